// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Translates host lifecycle signals into engine calls.  Each method maps to
// one OS callback; none of them blocks on the network beyond what the OS
// budget allows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use printlink_bridge::{CompanionMessage, PushNotification};
use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::FetchResult;

use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct LifecycleAdapter {
    engine: Arc<Engine>,
}

impl LifecycleAdapter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// App launched: bring up cloud sync (degrades quietly without an
    /// account).
    #[instrument(skip(self))]
    pub async fn did_finish_launching(&self) -> FetchResult {
        info!(platform = self.engine.platform_name(), "launch");
        self.engine.cloud().start().await
    }

    /// Foreground: (re)connect to the default target.  No default is not an
    /// error here; the user simply has nothing configured yet.
    #[instrument(skip(self))]
    pub async fn will_enter_foreground(&self) -> Result<()> {
        match self.engine.connect_default().await {
            Err(PrintlinkError::NoDefaultTarget) => {
                debug!("no default target; staying disconnected");
                Ok(())
            }
            other => other,
        }
    }

    /// Background: release the realtime channel.
    #[instrument(skip(self))]
    pub async fn did_enter_background(&self) {
        self.engine.connections().disconnect().await;
    }

    /// OS-scheduled background refresh.
    pub async fn perform_fetch<F>(&self, budget: Duration, completion: F) -> FetchResult
    where
        F: FnOnce(FetchResult) + Send,
    {
        self.engine.poller().run(budget, completion).await
    }

    /// Remote notification from the push service.
    pub async fn did_receive_remote_notification<F>(
        &self,
        notification: &PushNotification,
        completion: F,
    ) -> FetchResult
    where
        F: FnOnce(FetchResult) + Send,
    {
        let result = self.engine.cloud().handle_push(notification).await;
        completion(result);
        result
    }

    pub fn companion_reachability_changed(&self, reachable: bool) {
        self.engine.companion().on_reachability_changed(reachable);
    }

    pub async fn companion_message_received(&self, message: CompanionMessage) -> Result<()> {
        let outcome = self.engine.companion().on_message(message).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "companion request rejected");
        }
        outcome
    }

    #[instrument(skip(self))]
    pub async fn will_terminate(&self) {
        self.engine.shutdown().await;
    }
}
