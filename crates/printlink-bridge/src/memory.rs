// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory cloud mirror and companion channel.
//
// Used by tests across the workspace.  The cloud keeps an append-only change
// log; a change token is the log position, so delta fetches behave like the
// real record store including paging via `more_coming`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{ChangeToken, DeletionMarker, SyncRecord, TargetId, TargetPatch};

use crate::traits::*;

#[derive(Debug, Clone)]
enum LogEntry {
    Saved(SyncRecord),
    Deleted(DeletionMarker),
}

#[derive(Debug, Default)]
struct CloudState {
    records: BTreeMap<TargetId, SyncRecord>,
    log: Vec<LogEntry>,
    subscriptions: Vec<String>,
    saves: Vec<SyncRecord>,
    deletes: Vec<DeletionMarker>,
}

/// Cloud record store held in memory.
#[derive(Debug)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    available: AtomicBool,
    fail_writes: AtomicBool,
    page_size: AtomicUsize,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            page_size: AtomicUsize::new(usize::MAX),
        }
    }
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `save_record`/`delete_record` fail with `CloudUnavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Limit the number of log entries returned per `fetch_changes` page.
    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Simulate a write from another device.
    pub fn remote_save(&self, record: SyncRecord) {
        let mut state = self.lock();
        store_record(&mut state, record);
    }

    /// Simulate a deletion from another device.
    pub fn remote_delete(&self, marker: DeletionMarker) {
        let mut state = self.lock();
        state.records.remove(&marker.id);
        state.log.push(LogEntry::Deleted(marker));
    }

    pub fn record(&self, id: TargetId) -> Option<SyncRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// Records uploaded through `save_record`, in call order.
    pub fn saves(&self) -> Vec<SyncRecord> {
        self.lock().saves.clone()
    }

    pub fn deletes(&self) -> Vec<DeletionMarker> {
        self.lock().deletes.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PrintlinkError::CloudUnavailable("account signed out".into()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(PrintlinkError::CloudUnavailable("quota exceeded".into()))
        } else {
            Ok(())
        }
    }
}

fn store_record(state: &mut CloudState, record: SyncRecord) {
    let merged = match state.records.get(&record.id) {
        Some(existing) => SyncRecord {
            id: record.id,
            modified_at: record.modified_at,
            fields: overlay(&existing.fields, &record.fields),
        },
        None => record.clone(),
    };
    state.records.insert(record.id, merged);
    state.log.push(LogEntry::Saved(record));
}

/// Present fields of `update` win over `base`.
fn overlay(base: &TargetPatch, update: &TargetPatch) -> TargetPatch {
    TargetPatch {
        name: update.name.clone().or_else(|| base.name.clone()),
        host: update.host.clone().or_else(|| base.host.clone()),
        credential: update.credential.clone().or_else(|| base.credential.clone()),
        camera_orientation: update.camera_orientation.or(base.camera_orientation),
        camera_aspect_16_9: update.camera_aspect_16_9.or(base.camera_aspect_16_9),
        color: update.color.clone().or_else(|| base.color.clone()),
        sd_support: update.sd_support.or(base.sd_support),
    }
}

#[async_trait]
impl CloudMirror for InMemoryCloud {
    async fn account_available(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn ensure_subscription(&self, subscription_id: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        if !state.subscriptions.iter().any(|s| s == subscription_id) {
            state.subscriptions.push(subscription_id.to_owned());
        }
        Ok(())
    }

    async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<CloudChanges> {
        self.check_available()?;
        let start = match since {
            Some(token) => token
                .0
                .parse::<usize>()
                .map_err(|_| PrintlinkError::CloudUnavailable("change token expired".into()))?,
            None => 0,
        };

        let state = self.lock();
        let start = start.min(state.log.len());
        let page = self.page_size.load(Ordering::SeqCst);
        let end = start.saturating_add(page).min(state.log.len());

        let mut changes = CloudChanges::default();
        for entry in &state.log[start..end] {
            match entry {
                LogEntry::Saved(record) => changes.records.push(record.clone()),
                LogEntry::Deleted(marker) => changes.deletions.push(*marker),
            }
        }
        changes.new_token = Some(ChangeToken(end.to_string()));
        changes.more_coming = end < state.log.len();
        Ok(changes)
    }

    async fn fetch_all(&self) -> Result<Vec<SyncRecord>> {
        self.check_available()?;
        Ok(self.lock().records.values().cloned().collect())
    }

    async fn save_record(&self, record: &SyncRecord) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        state.saves.push(record.clone());
        store_record(&mut state, record.clone());
        Ok(())
    }

    async fn delete_record(&self, marker: &DeletionMarker) -> Result<()> {
        self.check_writable()?;
        let mut state = self.lock();
        state.deletes.push(*marker);
        state.records.remove(&marker.id);
        state.log.push(LogEntry::Deleted(*marker));
        Ok(())
    }
}

/// Companion channel that records what it was sent.
#[derive(Debug, Default)]
pub struct InMemoryCompanion {
    reachable: AtomicBool,
    sent: Mutex<Vec<CompanionMessage>>,
}

impl InMemoryCompanion {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<CompanionMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CompanionChannel for InMemoryCompanion {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn send(&self, message: CompanionMessage) -> Result<()> {
        if !self.is_reachable() {
            return Err(PrintlinkError::CompanionUnreachable("not paired".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

/// Bridge wiring both in-memory channels together.
#[derive(Debug, Clone)]
pub struct InMemoryBridge {
    pub cloud: Arc<InMemoryCloud>,
    pub companion: Arc<InMemoryCompanion>,
}

impl Default for InMemoryBridge {
    fn default() -> Self {
        Self {
            cloud: Arc::new(InMemoryCloud::new()),
            companion: Arc::new(InMemoryCompanion::new(true)),
        }
    }
}

impl PlatformBridge for InMemoryBridge {
    fn platform_name(&self) -> &str {
        "In-memory"
    }

    fn cloud(&self) -> Arc<dyn CloudMirror> {
        self.cloud.clone()
    }

    fn companion(&self) -> Arc<dyn CompanionChannel> {
        self.companion.clone()
    }
}
