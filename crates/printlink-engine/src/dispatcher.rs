// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Event fan-out.
//
// Subscribers are held as `Weak` handles, so the dispatcher never keeps a
// consumer alive.  `publish` snapshots the subscriber list and hands the
// event to a single delivery task; every consumer therefore sees the same
// total order, and a slow or failing consumer only delays, never blocks,
// the publisher.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use printlink_core::error::Result;
use printlink_core::types::{CompanionSnapshot, StateEvent, TargetId};

/// Where a registry change came from.  Used to avoid echoing a change back
/// to the channel that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    Local,
    Cloud,
    Companion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryChange {
    Upserted {
        target_id: TargetId,
        source: ChangeSource,
    },
    Deleted {
        target_id: TargetId,
        source: ChangeSource,
    },
    /// `None` once the registry is empty.
    DefaultChanged {
        target_id: Option<TargetId>,
        source: ChangeSource,
    },
}

/// Everything the engine tells its consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    State(StateEvent),
    /// The server rejected the credential; the session has stopped.
    AuthFailed { target_id: TargetId, detail: String },
    RegistryChanged(RegistryChange),
    CompanionReachability(bool),
    /// Status reported by the companion device itself.
    CompanionReported(CompanionSnapshot),
}

/// A subscriber.  Handlers run on the delivery task and must not block.
pub trait EventConsumer: Send + Sync {
    fn on_event(&self, event: &EngineEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber = (SubscriptionId, Weak<dyn EventConsumer>);

enum Delivery {
    Event {
        event: EngineEvent,
        subscribers: Vec<Subscriber>,
    },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Cheaply cloneable handle to the dispatcher.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.lock().len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create the dispatcher and spawn its delivery task.
    ///
    /// Must be called within a Tokio runtime.  The task exits once every
    /// handle has been dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
        });
        tokio::spawn(deliver(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn subscribe<C: EventConsumer + 'static>(&self, consumer: &Arc<C>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<C> = Arc::downgrade(consumer);
        let weak: Weak<dyn EventConsumer> = weak;

        let mut subscribers = self.lock();
        subscribers.retain(|(_, w)| w.strong_count() > 0);
        subscribers.push((id, weak));
        debug!(subscription = id.0, total = subscribers.len(), "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().retain(|(sid, _)| *sid != id);
    }

    /// Queue `event` for everyone subscribed right now.
    pub fn publish(&self, event: EngineEvent) {
        // Snapshot and enqueue under one lock so the delivery order matches
        // the order in which subscriber lists were captured.
        let subscribers = self.lock();
        let delivery = Delivery::Event {
            event,
            subscribers: subscribers.clone(),
        };
        if self.inner.tx.send(delivery).is_err() {
            warn!("delivery task has stopped; event dropped");
        }
    }

    /// Resolve once everything published before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.tx.send(Delivery::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>, inner: Weak<Inner>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Event { event, subscribers } => {
                let mut dead = Vec::new();
                for (id, weak) in &subscribers {
                    let Some(consumer) = weak.upgrade() else {
                        dead.push(*id);
                        continue;
                    };
                    match catch_unwind(AssertUnwindSafe(|| consumer.on_event(&event))) {
                        Ok(Ok(())) => trace!(subscription = id.0, "delivered"),
                        Ok(Err(e)) => warn!(subscription = id.0, error = %e, "consumer failed"),
                        Err(_) => warn!(subscription = id.0, "consumer panicked"),
                    }
                }
                if !dead.is_empty() {
                    if let Some(inner) = inner.upgrade() {
                        let mut list = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
                        list.retain(|(id, _)| !dead.contains(id));
                        debug!(pruned = dead.len(), "pruned dropped subscribers");
                    }
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("dispatcher delivery task exiting");
}

/// Consumer that forwards every event into a channel.  Handy for the CLI
/// and for tests.
#[derive(Debug)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelConsumer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventConsumer for ChannelConsumer {
    fn on_event(&self, event: &EngineEvent) -> Result<()> {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
