// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer registry: the single source of truth for configured targets.
//
// Writes are serialized through one async mutex and run as one SQLite
// transaction each; "exactly one default once any target exists" is enforced
// inside that transaction.  After each commit a fresh immutable snapshot is
// published, so readers never see a half-applied write and never wait for
// the writer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{
    ChangeToken, DeletionMarker, NewTarget, PrinterTarget, SyncRecord, TargetId, TargetPatch,
};

use crate::dispatcher::{ChangeSource, EngineEvent, EventDispatcher, RegistryChange};
use crate::store::{self, RegistryStore};

/// Fire-and-forget upload produced by a local mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpload {
    Save(SyncRecord),
    Delete(DeletionMarker),
}

/// What a cloud merge changed locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub inserted: Vec<TargetId>,
    pub updated: Vec<TargetId>,
    pub deleted: Vec<TargetId>,
    pub default_changed: bool,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && !self.default_changed
    }

    /// Fold a later page's report into this one.
    pub fn absorb(&mut self, other: MergeReport) {
        self.inserted.extend(other.inserted);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
        self.default_changed |= other.default_changed;
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    targets: Vec<PrinterTarget>,
}

pub struct PrinterRegistry {
    writer: tokio::sync::Mutex<RegistryStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    dispatcher: EventDispatcher,
    uploads: Mutex<Option<mpsc::UnboundedSender<RecordUpload>>>,
}

impl std::fmt::Debug for PrinterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterRegistry")
            .field("targets", &self.read().targets.len())
            .finish()
    }
}

impl PrinterRegistry {
    pub fn new(store: RegistryStore, dispatcher: EventDispatcher) -> Result<Self> {
        let targets = store.load_all()?;
        info!(count = targets.len(), "printer registry loaded");
        Ok(Self {
            writer: tokio::sync::Mutex::new(store),
            snapshot: RwLock::new(Arc::new(Snapshot { targets })),
            dispatcher,
            uploads: Mutex::new(None),
        })
    }

    /// Route upload requests to the cloud worker.  Without a sink, uploads
    /// are dropped; a later full pull re-sends whatever the cloud is missing.
    pub fn set_upload_sink(&self, sink: Option<mpsc::UnboundedSender<RecordUpload>>) {
        *self.uploads.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    // -- Reads (snapshot, never block on the writer) --

    pub fn list(&self) -> Vec<PrinterTarget> {
        self.read().targets.clone()
    }

    pub fn get(&self, id: TargetId) -> Option<PrinterTarget> {
        self.read().targets.iter().find(|t| t.id == id).cloned()
    }

    pub fn get_default(&self) -> Option<PrinterTarget> {
        self.read().targets.iter().find(|t| t.is_default).cloned()
    }

    // -- Writes --

    /// Add a target.  The first target always becomes the default.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create(&self, new: NewTarget) -> Result<PrinterTarget> {
        let target = PrinterTarget {
            id: TargetId::new(),
            name: new.name,
            host: new.host,
            credential: new.credential,
            camera_orientation: new.camera_orientation,
            camera_aspect_16_9: new.camera_aspect_16_9,
            color: new.color,
            sd_support: new.sd_support,
            is_default: false,
            modified_at: Utc::now(),
        };

        let mut writer = self.writer.lock().await;
        let tx = writer.transaction()?;
        let first = store::load_all(&tx)?.is_empty();
        store::insert(&tx, &target)?;
        let make_default = first || new.make_default;
        if make_default {
            store::set_default(&tx, Some(target.id))?;
        }
        store::commit(tx)?;
        self.refresh(&writer)?;
        drop(writer);

        info!(target_id = %target.id, make_default, "printer added");
        self.notify(RegistryChange::Upserted {
            target_id: target.id,
            source: ChangeSource::Local,
        });
        if make_default {
            self.notify(RegistryChange::DefaultChanged {
                target_id: Some(target.id),
                source: ChangeSource::Local,
            });
        }
        self.upload(RecordUpload::Save(SyncRecord::from_target(&target)));

        Ok(self.get(target.id).unwrap_or(target))
    }

    /// Apply `patch` and stamp a new modification time.
    #[instrument(skip(self, patch), fields(target_id = %id))]
    pub async fn update(&self, id: TargetId, patch: TargetPatch) -> Result<PrinterTarget> {
        let mut writer = self.writer.lock().await;
        let tx = writer.transaction()?;
        let mut target = store::get(&tx, id)?.ok_or(PrintlinkError::TargetNotFound(id))?;
        patch.apply_to(&mut target);
        target.modified_at = Utc::now();
        store::update(&tx, &target)?;
        store::commit(tx)?;
        self.refresh(&writer)?;
        drop(writer);

        debug!("printer updated");
        self.notify(RegistryChange::Upserted {
            target_id: id,
            source: ChangeSource::Local,
        });
        self.upload(RecordUpload::Save(SyncRecord::from_target(&target)));
        Ok(target)
    }

    /// Remove a target.  Deleting the default promotes the most recently
    /// modified remaining target in the same transaction.  Deleting an
    /// unknown id is a no-op.
    #[instrument(skip(self), fields(target_id = %id))]
    pub async fn delete(&self, id: TargetId) -> Result<()> {
        let marker = DeletionMarker {
            id,
            deleted_at: Utc::now(),
        };

        let mut writer = self.writer.lock().await;
        let tx = writer.transaction()?;
        let Some(existing) = store::get(&tx, id)? else {
            return Ok(());
        };
        store::delete(&tx, id)?;
        let promoted = if existing.is_default {
            let next = most_recent(&store::load_all(&tx)?);
            store::set_default(&tx, next)?;
            Some(next)
        } else {
            None
        };
        store::add_pending_deletion(&tx, &marker)?;
        store::commit(tx)?;
        self.refresh(&writer)?;
        drop(writer);

        info!(promoted = ?promoted.flatten(), "printer deleted");
        self.notify(RegistryChange::Deleted {
            target_id: id,
            source: ChangeSource::Local,
        });
        if let Some(next) = promoted {
            self.notify(RegistryChange::DefaultChanged {
                target_id: next,
                source: ChangeSource::Local,
            });
        }
        self.upload(RecordUpload::Delete(marker));
        Ok(())
    }

    /// Make `id` the default.  Default selection is per device and is not
    /// mirrored, so nothing is uploaded.
    pub async fn set_default(&self, id: TargetId) -> Result<()> {
        self.set_default_from(id, ChangeSource::Local).await
    }

    #[instrument(skip(self), fields(target_id = %id))]
    pub(crate) async fn set_default_from(&self, id: TargetId, source: ChangeSource) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let tx = writer.transaction()?;
        let target = store::get(&tx, id)?.ok_or(PrintlinkError::TargetNotFound(id))?;
        if target.is_default {
            return Ok(());
        }
        store::set_default(&tx, Some(id))?;
        store::commit(tx)?;
        self.refresh(&writer)?;
        drop(writer);

        info!(?source, "default printer changed");
        self.notify(RegistryChange::DefaultChanged {
            target_id: Some(id),
            source,
        });
        Ok(())
    }

    // -- Cloud reconciliation --

    /// Merge remote records and deletion markers using last-writer-wins on
    /// `modified_at`, then persist `token`.  Applying the same input twice
    /// changes nothing the second time.  Nothing is uploaded.
    #[instrument(skip_all, fields(records = records.len(), deletions = deletions.len()))]
    pub async fn merge_remote(
        &self,
        records: &[SyncRecord],
        deletions: &[DeletionMarker],
        token: Option<&ChangeToken>,
    ) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        let mut writer = self.writer.lock().await;
        let tx = writer.transaction()?;
        let previous_default = store::load_all(&tx)?
            .into_iter()
            .find(|t| t.is_default)
            .map(|t| t.id);

        for record in records {
            match store::get(&tx, record.id)? {
                None if store::pending_deletion(&tx, record.id)?
                    .is_some_and(|deleted_at| deleted_at >= record.modified_at) =>
                {
                    debug!(target_id = %record.id, "local delete is newer than remote record; kept deleted");
                }
                None => {
                    store::insert(&tx, &target_from_record(record))?;
                    store::remove_pending_deletion(&tx, record.id)?;
                    report.inserted.push(record.id);
                }
                Some(mut local) if record.modified_at > local.modified_at => {
                    record.fields.apply_to(&mut local);
                    local.modified_at = record.modified_at;
                    store::update(&tx, &local)?;
                    report.updated.push(record.id);
                }
                Some(_) => debug!(target_id = %record.id, "remote record not newer; kept local"),
            }
        }

        for marker in deletions {
            let Some(local) = store::get(&tx, marker.id)? else {
                continue;
            };
            if local.modified_at > marker.deleted_at {
                debug!(target_id = %marker.id, "local edit is newer than remote delete; kept");
                continue;
            }
            store::delete(&tx, marker.id)?;
            report.deleted.push(marker.id);
        }

        // Repair: exactly one default whenever any target exists.
        let remaining = store::load_all(&tx)?;
        let current_default = remaining.iter().find(|t| t.is_default).map(|t| t.id);
        let repaired = match current_default {
            Some(id) => Some(id),
            None => most_recent(&remaining),
        };
        if repaired != current_default {
            store::set_default(&tx, repaired)?;
        }
        report.default_changed = repaired != previous_default;

        if let Some(token) = token {
            store::set_change_token(&tx, Some(token))?;
        }
        store::commit(tx)?;
        self.refresh(&writer)?;
        drop(writer);

        if !report.is_empty() {
            info!(
                inserted = report.inserted.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                default_changed = report.default_changed,
                "merged remote changes"
            );
        }
        for id in report.inserted.iter().chain(&report.updated) {
            self.notify(RegistryChange::Upserted {
                target_id: *id,
                source: ChangeSource::Cloud,
            });
        }
        for id in &report.deleted {
            self.notify(RegistryChange::Deleted {
                target_id: *id,
                source: ChangeSource::Cloud,
            });
        }
        if report.default_changed {
            self.notify(RegistryChange::DefaultChanged {
                target_id: repaired,
                source: ChangeSource::Cloud,
            });
        }
        Ok(report)
    }

    pub async fn change_token(&self) -> Result<Option<ChangeToken>> {
        self.writer.lock().await.change_token()
    }

    pub async fn pending_deletions(&self) -> Result<Vec<DeletionMarker>> {
        self.writer.lock().await.pending_deletions()
    }

    pub async fn clear_pending_deletion(&self, id: TargetId) -> Result<()> {
        self.writer.lock().await.clear_pending_deletion(id)
    }

    // -- Internals --

    fn read(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn refresh(&self, store: &RegistryStore) -> Result<()> {
        let targets = store.load_all()?;
        let defaults = targets.iter().filter(|t| t.is_default).count();
        if !targets.is_empty() && defaults != 1 {
            warn!(defaults, "registry default invariant violated after commit");
        }
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(Snapshot { targets });
        Ok(())
    }

    fn notify(&self, change: RegistryChange) {
        self.dispatcher.publish(EngineEvent::RegistryChanged(change));
    }

    fn upload(&self, upload: RecordUpload) {
        let sink = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        match sink.as_ref() {
            Some(tx) => {
                if tx.send(upload).is_err() {
                    debug!("upload worker gone; upload dropped");
                }
            }
            None => debug!("no upload sink; upload dropped"),
        }
    }
}

/// Most recent `modified_at` wins; ties go to the larger id so every device
/// picks the same target.
fn most_recent(targets: &[PrinterTarget]) -> Option<TargetId> {
    targets
        .iter()
        .max_by(|a, b| a.modified_at.cmp(&b.modified_at).then(a.id.cmp(&b.id)))
        .map(|t| t.id)
}

/// Build a local target from a remote record.  Absent fields take defaults.
fn target_from_record(record: &SyncRecord) -> PrinterTarget {
    let mut target = PrinterTarget {
        id: record.id,
        name: String::new(),
        host: String::new(),
        credential: Default::default(),
        camera_orientation: Default::default(),
        camera_aspect_16_9: false,
        color: None,
        sd_support: false,
        is_default: false,
        modified_at: record.modified_at,
    };
    record.fields.apply_to(&mut target);
    target
}

/// Ids present locally but absent from `remote`, or newer locally.
pub(crate) fn needs_upload(
    local: &[PrinterTarget],
    remote: &[(TargetId, DateTime<Utc>)],
) -> Vec<PrinterTarget> {
    let remote_ids: HashSet<TargetId> = remote.iter().map(|(id, _)| *id).collect();
    local
        .iter()
        .filter(|t| {
            !remote_ids.contains(&t.id)
                || remote
                    .iter()
                    .any(|(id, modified)| *id == t.id && t.modified_at > *modified)
        })
        .cloned()
        .collect()
}
