// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed identifier of the cloud push subscription for printer records.
pub const DEFAULT_SUBSCRIPTION_ID: &str = "printlink-printers";

/// Tunables for the connectivity engine. Durations are stored in
/// milliseconds so the persisted JSON stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for one command/query request.
    pub command_timeout_ms: u64,
    /// How long to wait for the server's `connected` envelope after the
    /// socket opens.
    pub handshake_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_initial_ms: u64,
    /// Reconnect delay cap.
    pub backoff_max_ms: u64,
    /// Inbound frames buffered between the socket reader and the session.
    pub realtime_buffer: usize,
    /// Grace period for a session to close its socket before it is aborted.
    pub teardown_grace_ms: u64,
    /// Server-side throttle multiplier requested during the handshake.
    pub realtime_throttle: u32,
    /// Cloud push subscription identifier.
    pub cloud_subscription_id: String,
    /// Whether to talk to a paired companion device at all.
    pub companion_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            realtime_buffer: 64,
            teardown_grace_ms: 2_000,
            realtime_throttle: 1,
            cloud_subscription_id: DEFAULT_SUBSCRIPTION_ID.into(),
            companion_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Reject values that would break the engine's invariants.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::PrintlinkError;

        if self.backoff_initial_ms == 0 {
            return Err(PrintlinkError::Config("backoff_initial_ms must be > 0".into()));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(PrintlinkError::Config(
                "backoff_max_ms must be >= backoff_initial_ms".into(),
            ));
        }
        if self.realtime_buffer == 0 {
            return Err(PrintlinkError::Config("realtime_buffer must be > 0".into()));
        }
        if self.cloud_subscription_id.trim().is_empty() {
            return Err(PrintlinkError::Config("cloud_subscription_id is empty".into()));
        }
        Ok(())
    }
}
