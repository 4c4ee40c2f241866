// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloud sync agent: reconciles the registry with the cross-device mirror.
//
// Inbound: push notifications trigger delta pulls keyed by the persisted
// change token; launch runs a full reconciliation.  Outbound: registry
// mutations are queued to an upload worker that fires once and forgets.
// Failed uploads are picked up by the next full reconciliation, which
// re-sends tombstones and any local record the mirror lacks or has older.
//
// Nothing here returns `CloudUnavailable` to a caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use printlink_bridge::{CloudMirror, PushNotification};
use printlink_core::error::Result;
use printlink_core::types::{FetchResult, SyncRecord, TargetId};

use crate::registry::{MergeReport, PrinterRegistry, RecordUpload, needs_upload};

pub struct CloudSyncAgent {
    mirror: Arc<dyn CloudMirror>,
    registry: Arc<PrinterRegistry>,
    subscription_id: String,
    degraded: AtomicBool,
    uploader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CloudSyncAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSyncAgent")
            .field("subscription_id", &self.subscription_id)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl CloudSyncAgent {
    pub fn new(
        mirror: Arc<dyn CloudMirror>,
        registry: Arc<PrinterRegistry>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            mirror,
            registry,
            subscription_id: subscription_id.into(),
            // Until `start` proves otherwise.
            degraded: AtomicBool::new(true),
            uploader: Mutex::new(None),
        }
    }

    /// `true` while sync is a no-op (no account, or subscription failed).
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Bring sync up: check the account, ensure the push subscription, start
    /// the upload worker, then reconcile everything.  Safe to call again
    /// (e.g. after the user signs in).
    #[instrument(skip(self), fields(subscription = %self.subscription_id))]
    pub async fn start(&self) -> FetchResult {
        match self.mirror.account_available().await {
            Ok(true) => {}
            Ok(false) => {
                info!("no cloud account; sync disabled");
                self.degraded.store(true, Ordering::SeqCst);
                return FetchResult::NoData;
            }
            Err(e) => {
                warn!(error = %e, "cloud account check failed; sync disabled");
                self.degraded.store(true, Ordering::SeqCst);
                return FetchResult::Failed;
            }
        }

        if let Err(e) = self.mirror.ensure_subscription(&self.subscription_id).await {
            warn!(error = %e, "push subscription unavailable; sync disabled");
            self.degraded.store(true, Ordering::SeqCst);
            return FetchResult::Failed;
        }

        self.degraded.store(false, Ordering::SeqCst);
        self.spawn_uploader();
        info!("cloud sync started");
        self.pull_all().await
    }

    /// Delta pull in response to a push.  Notifications for other
    /// subscriptions are ignored.
    #[instrument(skip_all, fields(subscription = %notification.subscription_id))]
    pub async fn handle_push(&self, notification: &PushNotification) -> FetchResult {
        if notification.subscription_id != self.subscription_id {
            debug!("push for another subscription ignored");
            return FetchResult::NoData;
        }
        if self.is_degraded() {
            debug!("sync disabled; push ignored");
            return FetchResult::NoData;
        }
        outcome(self.pull_changes().await, "delta pull")
    }

    /// Full reconciliation plus passive retry of failed uploads.
    #[instrument(skip(self))]
    pub async fn pull_all(&self) -> FetchResult {
        if self.is_degraded() {
            return FetchResult::NoData;
        }
        outcome(self.reconcile().await, "full pull")
    }

    /// Stop the upload worker.  Queued uploads are dropped.
    pub fn stop(&self) {
        self.registry.set_upload_sink(None);
        if let Some(worker) = self.lock_uploader().take() {
            worker.abort();
        }
    }

    async fn pull_changes(&self) -> Result<MergeReport> {
        let mut token = self.registry.change_token().await?;
        let mut total = MergeReport::default();
        loop {
            let changes = self.mirror.fetch_changes(token.as_ref()).await?;
            debug!(
                records = changes.records.len(),
                deletions = changes.deletions.len(),
                more = changes.more_coming,
                "fetched changes"
            );
            let report = self
                .registry
                .merge_remote(&changes.records, &changes.deletions, changes.new_token.as_ref())
                .await?;
            total.absorb(report);
            if changes.new_token.is_some() {
                token = changes.new_token;
            }
            if !changes.more_coming {
                return Ok(total);
            }
        }
    }

    async fn reconcile(&self) -> Result<MergeReport> {
        // Tombstones first, so a delete that never reached the mirror is not
        // undone by the full fetch below.
        for marker in self.registry.pending_deletions().await? {
            match self.mirror.delete_record(&marker).await {
                Ok(()) => self.registry.clear_pending_deletion(marker.id).await?,
                Err(e) => warn!(target_id = %marker.id, error = %e, "tombstone re-send failed"),
            }
        }

        let remote = self.mirror.fetch_all().await?;
        let report = self.registry.merge_remote(&remote, &[], None).await?;

        let versions: Vec<(TargetId, DateTime<Utc>)> =
            remote.iter().map(|r| (r.id, r.modified_at)).collect();
        let stale = needs_upload(&self.registry.list(), &versions);
        if !stale.is_empty() {
            info!(count = stale.len(), "re-uploading records the mirror lacks");
        }
        for target in stale {
            if let Err(e) = self.mirror.save_record(&SyncRecord::from_target(&target)).await {
                warn!(target_id = %target.id, error = %e, "re-upload failed");
            }
        }
        Ok(report)
    }

    fn spawn_uploader(&self) {
        let mut uploader = self.lock_uploader();
        if uploader.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.set_upload_sink(Some(tx));
        *uploader = Some(tokio::spawn(upload_worker(
            self.mirror.clone(),
            Arc::downgrade(&self.registry),
            rx,
        )));
    }

    fn lock_uploader(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.uploader.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CloudSyncAgent {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_uploader().take() {
            worker.abort();
        }
    }
}

fn outcome(result: Result<MergeReport>, what: &str) -> FetchResult {
    match result {
        Ok(report) if report.is_empty() => FetchResult::NoData,
        Ok(_) => FetchResult::NewData,
        Err(e) => {
            warn!(error = %e, "{what} failed");
            FetchResult::Failed
        }
    }
}

/// Drain the upload queue.  Each upload is attempted once.
async fn upload_worker(
    mirror: Arc<dyn CloudMirror>,
    registry: Weak<PrinterRegistry>,
    mut rx: mpsc::UnboundedReceiver<RecordUpload>,
) {
    while let Some(upload) = rx.recv().await {
        match upload {
            RecordUpload::Save(record) => match mirror.save_record(&record).await {
                Ok(()) => debug!(target_id = %record.id, "record uploaded"),
                Err(e) => warn!(target_id = %record.id, error = %e, "record upload failed"),
            },
            RecordUpload::Delete(marker) => match mirror.delete_record(&marker).await {
                Ok(()) => {
                    debug!(target_id = %marker.id, "deletion uploaded");
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    if let Err(e) = registry.clear_pending_deletion(marker.id).await {
                        warn!(target_id = %marker.id, error = %e, "could not clear tombstone");
                    }
                }
                Err(e) => warn!(target_id = %marker.id, error = %e, "deletion upload failed"),
            },
        }
    }
    debug!("upload worker exiting");
}
