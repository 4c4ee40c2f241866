// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Companion link: keeps a paired device informed about the default target
// and lets it pick a new one.
//
// Outbound traffic goes through two `watch` slots (latest snapshot, latest
// default id) drained by one sender task.  A slot holds only the newest
// value, so a slow or absent companion never builds a backlog; while the
// device is unreachable values are dropped, and the current state is
// re-sent when it comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

use printlink_bridge::{CompanionChannel, CompanionMessage};
use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{
    CompanionSnapshot, ConnectionPhase, EventOrigin, PrinterTarget, StateEvent, TargetId,
};

use crate::connection::ConnectionManager;
use crate::dispatcher::{ChangeSource, EngineEvent, EventConsumer, EventDispatcher, RegistryChange};
use crate::registry::PrinterRegistry;

pub struct CompanionLink {
    registry: Arc<PrinterRegistry>,
    connections: ConnectionManager,
    dispatcher: EventDispatcher,
    enabled: bool,
    reachable: AtomicBool,
    snapshot: watch::Sender<Option<CompanionSnapshot>>,
    default_target: watch::Sender<Option<TargetId>>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CompanionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionLink")
            .field("enabled", &self.enabled)
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .finish()
    }
}

impl CompanionLink {
    /// Build the link, start its sender task, and subscribe it to
    /// `dispatcher`.  Must be called within a Tokio runtime.
    pub fn new(
        channel: Arc<dyn CompanionChannel>,
        registry: Arc<PrinterRegistry>,
        connections: ConnectionManager,
        dispatcher: EventDispatcher,
        enabled: bool,
    ) -> Arc<Self> {
        let (snapshot, snapshot_rx) = watch::channel(None);
        let (default_target, default_rx) = watch::channel(None);
        let reachable = channel.is_reachable();

        let sender = enabled.then(|| tokio::spawn(send_loop(channel, snapshot_rx, default_rx)));
        let link = Arc::new(Self {
            registry,
            connections,
            dispatcher: dispatcher.clone(),
            enabled,
            reachable: AtomicBool::new(reachable),
            snapshot,
            default_target,
            sender: Mutex::new(sender),
        });
        if enabled {
            dispatcher.subscribe(&link);
        }
        link
    }

    /// Offer a snapshot to the companion.  Replaces any unsent one.
    pub fn send_snapshot(&self, snapshot: CompanionSnapshot) {
        if self.enabled {
            self.snapshot.send_replace(Some(snapshot));
        }
    }

    /// Host reports a reachability change.  Informational only.
    pub fn on_reachability_changed(&self, reachable: bool) {
        if !self.enabled {
            return;
        }
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        info!(reachable, "companion reachability changed");
        self.dispatcher
            .publish(EngineEvent::CompanionReachability(reachable));

        if reachable && !was {
            let current = self.registry.get_default();
            self.default_target
                .send_replace(current.as_ref().map(|t| t.id));
            let snapshot = self
                .snapshot
                .borrow()
                .clone()
                .filter(|s| Some(s.target_id) == current.as_ref().map(|t| t.id))
                .or_else(|| current.as_ref().map(|t| self.fresh_snapshot(t)));
            self.snapshot.send_replace(snapshot);
        }
    }

    /// Dispatch a message received from the companion.
    pub async fn on_message(&self, message: CompanionMessage) -> Result<()> {
        match message {
            CompanionMessage::DefaultTargetChanged(id) => self.on_default_target_changed(id).await,
            CompanionMessage::StateSnapshot(snapshot) => {
                if self.enabled {
                    self.dispatcher
                        .publish(EngineEvent::CompanionReported(snapshot));
                }
                Ok(())
            }
        }
    }

    /// The companion picked a new default target.
    ///
    /// Commits the registry change, moves the connection to the new target,
    /// and returns once every subscriber has seen the switch.
    #[instrument(skip(self), fields(target_id = %id))]
    pub async fn on_default_target_changed(&self, id: TargetId) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let target = self
            .registry
            .get(id)
            .ok_or(PrintlinkError::TargetNotFound(id))?;

        self.registry
            .set_default_from(id, ChangeSource::Companion)
            .await?;
        if !self.connections.switch_to(target).await {
            // Already connected to it; still let consumers observe the switch.
            self.connections
                .publish_phase(id, EventOrigin::TargetSwitch);
        }
        self.dispatcher.flush().await;
        info!("default target switched by companion");
        Ok(())
    }

    fn fresh_snapshot(&self, target: &PrinterTarget) -> CompanionSnapshot {
        let status = self.connections.status();
        let phase = if status.target_id == Some(target.id) {
            status.phase
        } else {
            ConnectionPhase::Disconnected
        };
        CompanionSnapshot {
            target_id: target.id,
            target_name: target.name.clone(),
            phase,
            state_text: None,
            job_phase: None,
            completion: None,
            print_time_left: None,
            tool_temperature: None,
            bed_temperature: None,
        }
    }

    fn on_state(&self, event: &StateEvent) {
        let Some(target) = self.registry.get_default() else {
            return;
        };
        if target.id != event.target_id {
            return;
        }
        let previous = self.snapshot.borrow().clone();
        let mut snapshot = previous
            .filter(|s| s.target_id == target.id)
            .unwrap_or_else(|| self.fresh_snapshot(&target));
        apply_state(&mut snapshot, event);
        self.send_snapshot(snapshot);
    }

    fn on_registry_change(&self, change: &RegistryChange) {
        match change {
            RegistryChange::DefaultChanged { target_id, source } => {
                if *source != ChangeSource::Companion {
                    self.default_target.send_replace(*target_id);
                }
                let fresh = target_id
                    .and_then(|id| self.registry.get(id))
                    .map(|t| self.fresh_snapshot(&t));
                if fresh.is_some() {
                    self.snapshot.send_replace(fresh);
                }
            }
            RegistryChange::Upserted { target_id, .. } => {
                let renamed = self
                    .snapshot
                    .borrow()
                    .as_ref()
                    .filter(|s| s.target_id == *target_id)
                    .and_then(|s| {
                        let name = self.registry.get(*target_id)?.name;
                        (name != s.target_name).then(|| CompanionSnapshot {
                            target_name: name,
                            ..s.clone()
                        })
                    });
                if let Some(snapshot) = renamed {
                    self.send_snapshot(snapshot);
                }
            }
            RegistryChange::Deleted { .. } => {}
        }
    }
}

impl EventConsumer for CompanionLink {
    fn on_event(&self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::State(state) => self.on_state(state),
            EngineEvent::RegistryChanged(change) => self.on_registry_change(change),
            _ => {}
        }
        Ok(())
    }
}

impl Drop for CompanionLink {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sender.abort();
        }
    }
}

/// Fold a state event into the companion's projection.
fn apply_state(snapshot: &mut CompanionSnapshot, event: &StateEvent) {
    snapshot.phase = event.phase;
    let Some(printer) = &event.printer else {
        return;
    };
    snapshot.state_text = Some(printer.state_text.clone());
    snapshot.job_phase = Some(printer.job_phase());
    snapshot.completion = printer.job.completion;
    snapshot.print_time_left = printer.job.print_time_left;
    snapshot.tool_temperature = printer.temperature("tool").and_then(|t| t.actual);
    snapshot.bed_temperature = printer.temperature("bed").and_then(|t| t.actual);
}

async fn send_loop(
    channel: Arc<dyn CompanionChannel>,
    mut snapshots: watch::Receiver<Option<CompanionSnapshot>>,
    mut defaults: watch::Receiver<Option<TargetId>>,
) {
    loop {
        let message = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                snapshots.borrow_and_update().clone().map(CompanionMessage::StateSnapshot)
            }
            changed = defaults.changed() => {
                if changed.is_err() {
                    break;
                }
                defaults.borrow_and_update().map(CompanionMessage::DefaultTargetChanged)
            }
        };
        let Some(message) = message else {
            continue;
        };
        if !channel.is_reachable() {
            trace!("companion unreachable; dropped");
            continue;
        }
        if let Err(e) = channel.send(message).await {
            debug!(error = %e, "companion send failed; dropped");
        }
    }
    debug!("companion sender exiting");
}
