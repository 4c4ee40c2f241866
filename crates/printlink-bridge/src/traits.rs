// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-agnostic trait definitions for the engine's side channels.
//
// The cloud mirror is a per-user record store with push notifications and
// change tokens.  The companion channel is a best-effort session to a paired
// device (typically a watch).  Platforms lacking either return the stub.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use printlink_core::error::Result;
use printlink_core::types::{ChangeToken, CompanionSnapshot, DeletionMarker, SyncRecord, TargetId};

/// Groups the native capabilities the engine needs from its host.
pub trait PlatformBridge: Send + Sync {
    /// Human-readable platform name (e.g. "iOS 17", "Desktop (stub)").
    fn platform_name(&self) -> &str;

    fn cloud(&self) -> Arc<dyn CloudMirror>;

    fn companion(&self) -> Arc<dyn CompanionChannel>;
}

/// One page of changes from the cloud record store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudChanges {
    pub records: Vec<SyncRecord>,
    pub deletions: Vec<DeletionMarker>,
    /// Token to persist once this page has been merged.
    pub new_token: Option<ChangeToken>,
    /// Another page is available; fetch again with `new_token`.
    pub more_coming: bool,
}

/// Cross-device durable record store.
///
/// Every method may fail with `CloudUnavailable` (no account, restricted
/// network, quota); callers must treat that as a soft condition.
#[async_trait]
pub trait CloudMirror: Send + Sync {
    async fn account_available(&self) -> Result<bool>;

    /// Create the push subscription if it does not exist yet.
    async fn ensure_subscription(&self, subscription_id: &str) -> Result<()>;

    /// Changes since `since`, or everything when `None`.
    async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<CloudChanges>;

    async fn fetch_all(&self) -> Result<Vec<SyncRecord>>;

    async fn save_record(&self, record: &SyncRecord) -> Result<()>;

    async fn delete_record(&self, marker: &DeletionMarker) -> Result<()>;
}

/// Remote notification delivered by the platform's push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub subscription_id: String,
}

/// Messages exchanged with the companion device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompanionMessage {
    DefaultTargetChanged(TargetId),
    StateSnapshot(CompanionSnapshot),
}

/// Best-effort session to a paired companion device.
#[async_trait]
pub trait CompanionChannel: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Deliver now or fail; the channel never queues.
    async fn send(&self, message: CompanionMessage) -> Result<()>;
}
