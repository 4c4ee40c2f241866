// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Background refresh under an OS-imposed time budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use printlink_core::types::{EventOrigin, FetchResult, TargetPatch};
use printlink_net::Command;
use printlink_net::protocol::parse_printer_state;

use crate::connection::ConnectionManager;
use crate::registry::PrinterRegistry;

/// One-shot state refresh for the default target.
#[derive(Debug, Clone)]
pub struct BackgroundPoller {
    registry: Arc<PrinterRegistry>,
    connections: ConnectionManager,
}

impl BackgroundPoller {
    pub fn new(registry: Arc<PrinterRegistry>, connections: ConnectionManager) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Query the default target once within `budget` and report the outcome
    /// through `completion`, exactly once.
    ///
    /// Past the budget the query is dropped and nothing is published.
    #[instrument(skip(self, completion), fields(budget_ms = budget.as_millis() as u64))]
    pub async fn run<F>(&self, budget: Duration, completion: F) -> FetchResult
    where
        F: FnOnce(FetchResult) + Send,
    {
        let result = self.poll(budget).await;
        info!(?result, "background fetch finished");
        completion(result);
        result
    }

    async fn poll(&self, budget: Duration) -> FetchResult {
        let Some(target) = self.registry.get_default() else {
            debug!("no default target");
            return FetchResult::NoData;
        };

        let query = self
            .connections
            .send_command_to(&target, &Command::QueryPrinterState);
        let Ok(outcome) = timeout(budget, query).await else {
            warn!(target_id = %target.id, "state query exceeded budget");
            return FetchResult::Failed;
        };

        let report = match outcome.into_body().and_then(|body| parse_printer_state(&body)) {
            Ok(report) => report,
            Err(e) => {
                warn!(target_id = %target.id, error = %e, "state query failed");
                return FetchResult::Failed;
            }
        };

        self.connections
            .publish_observation(target.id, report.snapshot, EventOrigin::BackgroundPoll);

        if let Some(sd_support) = report.sd_support {
            if sd_support != target.sd_support {
                let patch = TargetPatch {
                    sd_support: Some(sd_support),
                    ..Default::default()
                };
                if let Err(e) = self.registry.update(target.id, patch).await {
                    // Deleted meanwhile; the state was still fresh.
                    debug!(error = %e, "sd capability not recorded");
                }
            }
        }
        FetchResult::NewData
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use printlink_core::error::PrintlinkError;
    use printlink_core::types::{ErrorClass, NewTarget};
    use printlink_net::CommandOutcome;

    use crate::dispatcher::{ChannelConsumer, EngineEvent, EventDispatcher};
    use crate::store::RegistryStore;
    use crate::testing::*;

    struct Harness {
        poller: BackgroundPoller,
        registry: Arc<PrinterRegistry>,
        transport: Arc<FakeTransport>,
        dispatcher: EventDispatcher,
    }

    fn harness(transport: Arc<FakeTransport>) -> Harness {
        let dispatcher = EventDispatcher::new();
        let store = RegistryStore::open_in_memory().expect("db");
        let registry = Arc::new(PrinterRegistry::new(store, dispatcher.clone()).expect("registry"));
        let connections = ConnectionManager::new(
            FakeConnector::new(),
            transport.clone(),
            dispatcher.clone(),
            test_config(),
        );
        Harness {
            poller: BackgroundPoller::new(registry.clone(), connections),
            registry,
            transport,
            dispatcher,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<FetchResult>>>, impl FnOnce(FetchResult) + Send) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |r| sink.lock().expect("calls").push(r))
    }

    async fn add_default(h: &Harness) {
        h.registry
            .create(NewTarget {
                name: "Prusa".into(),
                host: "http://prusa.local".into(),
                ..Default::default()
            })
            .await
            .expect("create");
    }

    #[tokio::test(start_paused = true)]
    async fn no_default_means_no_data_and_no_request() {
        let h = harness(FakeTransport::accepting());
        let (calls, completion) = recorder();

        let result = h.poller.run(Duration::from_secs(30), completion).await;
        assert_eq!(result, FetchResult::NoData);
        assert_eq!(*calls.lock().expect("calls"), vec![FetchResult::NoData]);
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_state_is_published_and_sd_recorded() {
        let h = harness(FakeTransport::accepting());
        add_default(&h).await;
        let (consumer, mut events) = ChannelConsumer::new();
        h.dispatcher.subscribe(&consumer);
        let (calls, completion) = recorder();

        let result = h.poller.run(Duration::from_secs(30), completion).await;
        assert_eq!(result, FetchResult::NewData);
        assert_eq!(*calls.lock().expect("calls"), vec![FetchResult::NewData]);

        let event = next_state(&mut events).await;
        assert_eq!(event.origin, EventOrigin::BackgroundPoll);
        assert!(event.printer.is_some());
        assert!(h.registry.get_default().expect("default").sd_support);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_expiry_fails_without_side_effects() {
        let h = harness(FakeTransport::accepting());
        add_default(&h).await;
        h.transport.set_delay(Duration::from_secs(20));
        let (consumer, mut events) = ChannelConsumer::new();
        h.dispatcher.subscribe(&consumer);
        let (calls, completion) = recorder();

        let result = h.poller.run(Duration::from_secs(2), completion).await;
        assert_eq!(result, FetchResult::Failed);
        assert_eq!(*calls.lock().expect("calls"), vec![FetchResult::Failed]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        h.dispatcher.flush().await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, EngineEvent::State(_)), "unexpected {event:?}");
        }
        assert!(!h.registry.get_default().expect("default").sd_support);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_fails() {
        let h = harness(FakeTransport::new(|_| CommandOutcome::Rejected {
            status: 409,
            class: ErrorClass::Permanent,
            reason: "Printer is not operational".into(),
        }));
        add_default(&h).await;
        let (calls, completion) = recorder();

        assert_eq!(
            h.poller.run(Duration::from_secs(30), completion).await,
            FetchResult::Failed
        );
        assert_eq!(calls.lock().expect("calls").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_fails() {
        let h = harness(FakeTransport::new(|_| {
            CommandOutcome::TransportFailed(PrintlinkError::Network("unreachable".into()))
        }));
        add_default(&h).await;
        let (_calls, completion) = recorder();

        assert_eq!(
            h.poller.run(Duration::from_secs(30), completion).await,
            FetchResult::Failed
        );
    }
}
