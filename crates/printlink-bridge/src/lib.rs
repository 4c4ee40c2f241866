// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printlink Bridge: platform seams.
//
// The engine reaches the cloud record store and the paired companion device
// only through the traits in `traits`.  Hosts that have neither get the stub,
// which reports both channels as unavailable so the engine degrades quietly.

pub mod traits;

pub mod stub;

#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;

pub use stub::StubBridge;
pub use traits::{
    CloudChanges, CloudMirror, CompanionChannel, CompanionMessage, PlatformBridge,
    PushNotification,
};

#[cfg(any(test, feature = "test-helpers"))]
pub use memory::{InMemoryBridge, InMemoryCloud, InMemoryCompanion};

use std::sync::Arc;

/// Bridge implementation for this host.
///
/// Mobile shells construct their own `PlatformBridge` and hand it to the
/// engine; the headless binary gets the stub.
pub fn platform_bridge() -> Arc<dyn traits::PlatformBridge> {
    Arc::new(stub::StubBridge)
}
