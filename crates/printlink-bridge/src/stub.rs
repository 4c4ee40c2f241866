// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stub bridge for desktop/CI builds where no cloud account or paired
// companion device exists.
//
// Cloud calls report `CloudUnavailable`, companion sends report
// `CompanionUnreachable`; the engine treats both as soft.

use std::sync::Arc;

use async_trait::async_trait;

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{ChangeToken, DeletionMarker, SyncRecord};

use crate::traits::*;

/// No-op bridge returned on hosts without native integrations.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBridge;

impl PlatformBridge for StubBridge {
    fn platform_name(&self) -> &str {
        "Desktop (stub)"
    }

    fn cloud(&self) -> Arc<dyn CloudMirror> {
        Arc::new(StubBridge)
    }

    fn companion(&self) -> Arc<dyn CompanionChannel> {
        Arc::new(StubBridge)
    }
}

#[async_trait]
impl CloudMirror for StubBridge {
    async fn account_available(&self) -> Result<bool> {
        Ok(false)
    }

    async fn ensure_subscription(&self, _subscription_id: &str) -> Result<()> {
        tracing::warn!("CloudMirror::ensure_subscription called on stub bridge");
        Err(unavailable())
    }

    async fn fetch_changes(&self, _since: Option<&ChangeToken>) -> Result<CloudChanges> {
        Err(unavailable())
    }

    async fn fetch_all(&self) -> Result<Vec<SyncRecord>> {
        Err(unavailable())
    }

    async fn save_record(&self, _record: &SyncRecord) -> Result<()> {
        Err(unavailable())
    }

    async fn delete_record(&self, _marker: &DeletionMarker) -> Result<()> {
        Err(unavailable())
    }
}

#[async_trait]
impl CompanionChannel for StubBridge {
    fn is_reachable(&self) -> bool {
        false
    }

    async fn send(&self, _message: CompanionMessage) -> Result<()> {
        Err(PrintlinkError::CompanionUnreachable("no paired device".into()))
    }
}

fn unavailable() -> PrintlinkError {
    PrintlinkError::CloudUnavailable("no cloud account on this platform".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_reports_no_account() {
        let cloud = StubBridge.cloud();
        assert!(!cloud.account_available().await.expect("availability"));
        assert!(matches!(
            cloud.fetch_all().await,
            Err(PrintlinkError::CloudUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn stub_companion_is_unreachable() {
        let companion = StubBridge.companion();
        assert!(!companion.is_reachable());
        let err = companion
            .send(CompanionMessage::DefaultTargetChanged(Default::default()))
            .await
            .expect_err("unreachable");
        assert!(matches!(err, PrintlinkError::CompanionUnreachable(_)));
    }
}
