// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printlink Engine: keeps one OctoPrint session, the printer registry, the
// cloud mirror and the companion device in agreement.
//
// Every component is built once by `Engine` and reached through explicit
// handles.  State flows out through the `EventDispatcher`; lifecycle signals
// flow in through the `LifecycleAdapter`.

pub mod cloud;
pub mod companion;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod poller;
pub mod registry;
pub mod store;

#[cfg(test)]
mod testing;

pub use cloud::CloudSyncAgent;
pub use companion::CompanionLink;
pub use connection::{ConnectionManager, SessionStatus};
pub use dispatcher::{
    ChangeSource, ChannelConsumer, EngineEvent, EventConsumer, EventDispatcher, RegistryChange,
    SubscriptionId,
};
pub use engine::Engine;
pub use lifecycle::LifecycleAdapter;
pub use poller::BackgroundPoller;
pub use registry::{MergeReport, PrinterRegistry};
pub use store::RegistryStore;
