// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection manager: owns the single realtime session.
//
// State machine per session:
//
//   Disconnected -> Connecting -> Connected -> { Error, Disconnected }
//   Error -> (backoff) -> Connecting
//   Auth failure -> Disconnected (surfaced once, never retried)
//
// All slot transitions (connect, disconnect, switch) hold the slot mutex
// for their whole duration, including teardown of the previous session, so
// two sessions never exist at the same time.  Every StateEvent is sequenced
// and published under one lock, so subscribers see sequence numbers in
// publish order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use printlink_core::config::EngineConfig;
use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{
    ConnectionPhase, ErrorClass, EventOrigin, PrinterSnapshot, PrinterTarget, StateEvent, TargetId,
};
use printlink_net::protocol::{parse_printer_state, throttle_message};
use printlink_net::retry::classify_error;
use printlink_net::{
    BackoffSchedule, Command, CommandOutcome, CommandTransport, Inbound, RealtimeConnector,
    RealtimeStream, parse_envelope,
};

use crate::dispatcher::{EngineEvent, EventDispatcher};

/// Observable state of the current (or last) session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub target_id: Option<TargetId>,
    pub phase: ConnectionPhase,
    /// Failed attempts since the last successful handshake.
    pub retry_count: u32,
    pub last_error: Option<ErrorClass>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            target_id: None,
            phase: ConnectionPhase::Disconnected,
            retry_count: 0,
            last_error: None,
        }
    }
}

struct Session {
    target: PrinterTarget,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn RealtimeConnector>,
    transport: Arc<dyn CommandTransport>,
    dispatcher: EventDispatcher,
    config: EngineConfig,
    slot: tokio::sync::Mutex<Option<Session>>,
    status: Mutex<SessionStatus>,
    sequences: Mutex<HashMap<TargetId, u64>>,
    /// One permit: held by whichever task owns the open socket.
    sockets: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        transport: Arc<dyn CommandTransport>,
        dispatcher: EventDispatcher,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                transport,
                dispatcher,
                config,
                slot: tokio::sync::Mutex::new(None),
                status: Mutex::new(SessionStatus::default()),
                sequences: Mutex::new(HashMap::new()),
                sockets: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    /// Start a session for `target`.
    ///
    /// Idempotent for the target already being served.  Fails with
    /// `AlreadyConnecting` while a session for a different target is alive;
    /// callers disconnect first (or use [`switch_to`](Self::switch_to)).
    #[instrument(skip(self, target), fields(target_id = %target.id))]
    pub async fn connect(&self, target: PrinterTarget) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.task.is_finished() {
                if session.target.id == target.id {
                    debug!("already serving this target");
                    return Ok(());
                }
                return Err(PrintlinkError::AlreadyConnecting {
                    current: session.target.id,
                    requested: target.id,
                });
            }
        }
        // Reap a session that ended on its own (auth failure).
        *slot = None;
        *slot = Some(self.inner.begin(target, EventOrigin::Request));
        Ok(())
    }

    /// Tear down any session.  Idempotent and infallible.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Some(session) = slot.take() {
            self.inner.teardown(session, EventOrigin::Request).await;
        }
    }

    /// Replace the current session with one for `target`.  The old session
    /// is fully torn down (its `Disconnected` published) before the new
    /// `Connecting` event.  Returns `false` when `target` was already being
    /// served and nothing changed.
    #[instrument(skip(self, target), fields(target_id = %target.id))]
    pub async fn switch_to(&self, target: PrinterTarget) -> bool {
        let mut slot = self.inner.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.target.id == target.id && !session.task.is_finished() {
                return false;
            }
        }
        if let Some(old) = slot.take() {
            self.inner.teardown(old, EventOrigin::TargetSwitch).await;
        }
        info!(name = %target.name, "switching target");
        *slot = Some(self.inner.begin(target, EventOrigin::TargetSwitch));
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    /// Target of the live session, if any.
    pub async fn current_target(&self) -> Option<PrinterTarget> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.target.clone())
    }

    /// Send `command` to the session's target.  Commands are independent
    /// exchanges; any number may be in flight.
    pub async fn send_command(&self, command: Command) -> CommandOutcome {
        let Some(target) = self.current_target().await else {
            return CommandOutcome::TransportFailed(PrintlinkError::NotConnected);
        };
        self.send_command_to(&target, &command).await
    }

    /// Send `command` to an explicit target, with or without a session.
    pub async fn send_command_to(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome {
        self.inner.query(target, command).await
    }

    /// Publish printer state obtained outside the realtime channel.
    pub fn publish_observation(
        &self,
        target_id: TargetId,
        snapshot: PrinterSnapshot,
        origin: EventOrigin,
    ) -> StateEvent {
        self.inner.observe(target_id, snapshot, origin)
    }

    /// Publish a state event for `target_id` carrying only the current phase.
    pub fn publish_phase(&self, target_id: TargetId, origin: EventOrigin) -> StateEvent {
        let status = self.status();
        let (phase, last_error) = if status.target_id == Some(target_id) {
            (status.phase, status.last_error)
        } else {
            (ConnectionPhase::Disconnected, None)
        };
        self.inner.emit(target_id, phase, origin, None, last_error)
    }
}

/// Lets helpers written against the transport seam (such as
/// `printlink_net::refresh_sd`) run with the manager's command timeout.
#[async_trait]
impl CommandTransport for ConnectionManager {
    async fn execute(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome {
        self.send_command_to(target, command).await
    }
}

impl Inner {
    fn status(&self) -> SessionStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) -> SessionStatus {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
        status.clone()
    }

    /// Allocate the next sequence number and publish, atomically.
    fn emit(
        &self,
        target_id: TargetId,
        phase: ConnectionPhase,
        origin: EventOrigin,
        printer: Option<PrinterSnapshot>,
        last_error: Option<ErrorClass>,
    ) -> StateEvent {
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let sequence = sequences.entry(target_id).or_insert(0);
        *sequence += 1;
        let event = StateEvent {
            target_id,
            sequence: *sequence,
            phase,
            origin,
            printer,
            last_error,
        };
        trace!(target_id = %target_id, sequence = event.sequence, ?phase, ?origin, "state event");
        self.dispatcher.publish(EngineEvent::State(event.clone()));
        event
    }

    fn observe(&self, target_id: TargetId, snapshot: PrinterSnapshot, origin: EventOrigin) -> StateEvent {
        let status = self.status();
        let phase = if status.target_id == Some(target_id) {
            status.phase
        } else {
            ConnectionPhase::Disconnected
        };
        self.emit(target_id, phase, origin, Some(snapshot), None)
    }

    async fn query(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome {
        match timeout(self.config.command_timeout(), self.transport.execute(target, command)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(target_id = %target.id, command = command.name(), "command timed out");
                CommandOutcome::TransportFailed(PrintlinkError::Network(format!(
                    "{} timed out",
                    command.name()
                )))
            }
        }
    }

    /// Publish `Connecting` and spawn the session task.  Caller holds the slot.
    fn begin(self: &Arc<Self>, target: PrinterTarget, origin: EventOrigin) -> Session {
        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.id, 0);
        self.update_status(|s| {
            *s = SessionStatus {
                target_id: Some(target.id),
                phase: ConnectionPhase::Connecting,
                retry_count: 0,
                last_error: None,
            }
        });
        self.emit(target.id, ConnectionPhase::Connecting, origin, None, None);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(self.clone(), target.clone(), shutdown_rx));
        Session {
            target,
            shutdown,
            task,
        }
    }

    /// Signal the session to stop and wait for it, aborting after the grace
    /// period.  Caller holds the slot.
    async fn teardown(&self, session: Session, origin: EventOrigin) {
        let Session {
            target,
            shutdown,
            mut task,
        } = session;
        let _ = shutdown.send(true);
        if timeout(self.config.teardown_grace(), &mut task).await.is_err() {
            warn!(target_id = %target.id, "session did not stop in time; aborting");
            task.abort();
            // Wait for the aborted task to drop its socket before the slot
            // is reused.
            let _ = task.await;
        }

        let previous = self.status().phase;
        self.update_status(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.retry_count = 0;
        });
        if previous != ConnectionPhase::Disconnected {
            self.emit(target.id, ConnectionPhase::Disconnected, origin, None, None);
        }
        info!(target_id = %target.id, "session closed");
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Resolves once shutdown is requested or the manager side is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn run_session(inner: Arc<Inner>, target: PrinterTarget, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = BackoffSchedule::new(inner.config.backoff_initial(), inner.config.backoff_max());

    loop {
        let opened = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            opened = open_channel(&inner, &target) => opened,
        };

        let ended = match opened {
            Ok(socket) => {
                backoff.reset();
                inner.update_status(|s| {
                    s.phase = ConnectionPhase::Connected;
                    s.retry_count = 0;
                    s.last_error = None;
                });
                inner.emit(target.id, ConnectionPhase::Connected, EventOrigin::Realtime, None, None);
                info!(target_id = %target.id, "realtime channel connected");

                match pump(&inner, &target, socket, &mut shutdown).await {
                    Ok(()) => return,
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        if let PrintlinkError::Auth(detail) = ended {
            warn!(target_id = %target.id, %detail, "credentials rejected; not retrying");
            inner.update_status(|s| {
                s.phase = ConnectionPhase::Disconnected;
                s.last_error = Some(ErrorClass::UserAction);
            });
            inner.emit(
                target.id,
                ConnectionPhase::Disconnected,
                EventOrigin::Realtime,
                None,
                Some(ErrorClass::UserAction),
            );
            inner.dispatcher.publish(EngineEvent::AuthFailed {
                target_id: target.id,
                detail,
            });
            return;
        }

        let class = classify_error(&ended);
        let delay = backoff.next_delay();
        warn!(
            target_id = %target.id,
            error = %ended,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "realtime channel failed; retrying"
        );
        inner.update_status(|s| {
            s.phase = ConnectionPhase::Error;
            s.retry_count += 1;
            s.last_error = Some(class);
        });
        inner.emit(target.id, ConnectionPhase::Error, EventOrigin::Realtime, None, Some(class));

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }

        inner.update_status(|s| s.phase = ConnectionPhase::Connecting);
        inner.emit(target.id, ConnectionPhase::Connecting, EventOrigin::Realtime, None, None);
    }
}

/// Open the socket, request the push rate, and wait for `connected`.
///
/// Acquiring the socket permit first waits for the socket of a torn-down
/// session to be dropped.
async fn open_channel(inner: &Inner, target: &PrinterTarget) -> Result<OpenSocket> {
    let permit = inner
        .sockets
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| PrintlinkError::Network("connection manager closed".into()))?;

    // A host that drops packets would otherwise hold the socket open for the
    // OS connect timeout.
    let mut stream = timeout(inner.config.handshake_timeout(), inner.connector.open(target))
        .await
        .map_err(|_| PrintlinkError::Network("connect timed out".into()))??;
    stream
        .send_text(throttle_message(inner.config.realtime_throttle))
        .await?;

    let handshake = timeout(inner.config.handshake_timeout(), await_connected(stream.as_mut())).await;
    match handshake {
        Ok(Ok(())) => Ok(OpenSocket {
            stream,
            _permit: permit,
        }),
        Ok(Err(err)) => {
            stream.close().await;
            Err(err)
        }
        Err(_) => {
            stream.close().await;
            Err(PrintlinkError::Network("handshake timed out".into()))
        }
    }
}

async fn await_connected(stream: &mut dyn RealtimeStream) -> Result<()> {
    loop {
        let Some(text) = stream.next_text().await? else {
            return Err(PrintlinkError::Network("closed during handshake".into()));
        };
        match parse_envelope(&text) {
            Ok(Some(Inbound::Connected { version })) => {
                debug!(version = version.as_deref().unwrap_or("unknown"), "handshake complete");
                return Ok(());
            }
            Ok(_) => trace!("frame before handshake ignored"),
            Err(e) => debug!(error = %e, "unparseable frame during handshake"),
        }
    }
}

/// The live realtime stream.  Fields drop in order, so the stream is gone
/// before the permit is released.
struct OpenSocket {
    stream: Box<dyn RealtimeStream>,
    _permit: OwnedSemaphorePermit,
}

enum Frame {
    Text { index: u64, text: String },
    End(PrintlinkError),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Tracks reader-assigned frame numbers and reports holes.
#[derive(Debug, Default)]
struct FrameSequencer {
    last: u64,
}

impl FrameSequencer {
    /// Number of frames missed before `index`.
    fn observe(&mut self, index: u64) -> u64 {
        let missed = index.saturating_sub(self.last + 1);
        self.last = self.last.max(index);
        missed
    }
}

/// Consume frames until shutdown (`Ok`) or channel failure (`Err`).
async fn pump(
    inner: &Arc<Inner>,
    target: &PrinterTarget,
    socket: OpenSocket,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(inner.config.realtime_buffer.max(1));
    let mut reader = AbortOnDrop(tokio::spawn(read_frames(socket, tx, shutdown.clone())));
    let mut sequencer = FrameSequencer::default();
    let mut resync: Option<AbortOnDrop> = None;

    loop {
        let frame = tokio::select! {
            _ = shutdown_requested(shutdown) => {
                // The reader sees the same signal and closes the socket.
                let _ = (&mut reader.0).await;
                return Ok(());
            }
            frame = rx.recv() => frame,
        };

        let (index, text) = match frame {
            Some(Frame::Text { index, text }) => (index, text),
            Some(Frame::End(err)) => return Err(err),
            None => return Err(PrintlinkError::Network("realtime reader stopped".into())),
        };

        let missed = sequencer.observe(index);
        if missed > 0 {
            let idle = resync.as_ref().is_none_or(|r| r.0.is_finished());
            warn!(target_id = %target.id, missed, "realtime frames dropped");
            if idle {
                resync = Some(AbortOnDrop(tokio::spawn(resynchronize(
                    inner.clone(),
                    target.clone(),
                ))));
            }
        }

        match parse_envelope(&text) {
            Ok(Some(Inbound::Current(snapshot) | Inbound::History(snapshot))) => {
                inner.emit(
                    target.id,
                    ConnectionPhase::Connected,
                    EventOrigin::Realtime,
                    Some(snapshot),
                    None,
                );
            }
            Ok(Some(Inbound::Event { kind, .. })) => debug!(%kind, "server event"),
            Ok(Some(Inbound::Plugin { plugin, .. })) => trace!(%plugin, "plugin message"),
            Ok(Some(Inbound::Connected { .. })) => debug!("server repeated handshake"),
            Ok(None) => trace!("unknown envelope ignored"),
            Err(e) => warn!(target_id = %target.id, error = %e, "dropping unparseable frame"),
        }
    }
}

/// Read frames off the socket, numbering each.  A full buffer drops the
/// frame; the consumer sees the hole and resynchronizes.
async fn read_frames(
    mut socket: OpenSocket,
    tx: mpsc::Sender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut index = 0u64;
    let end = loop {
        let next = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                socket.stream.close().await;
                return;
            }
            next = socket.stream.next_text() => next,
        };
        match next {
            Ok(Some(text)) => {
                index += 1;
                match tx.try_send(Frame::Text { index, text }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(index, "realtime buffer full; frame dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        socket.stream.close().await;
                        return;
                    }
                }
            }
            Ok(None) => break PrintlinkError::Network("closed by server".into()),
            Err(err) => break err,
        }
    };
    let _ = tx.send(Frame::End(end)).await;
}

/// Re-query full printer state after a gap in the realtime stream.
async fn resynchronize(inner: Arc<Inner>, target: PrinterTarget) {
    let outcome = inner.query(&target, &Command::QueryPrinterState).await;
    match outcome.into_body().and_then(|body| parse_printer_state(&body)) {
        Ok(report) => {
            inner.observe(target.id, report.snapshot, EventOrigin::Resync);
        }
        Err(e) => warn!(target_id = %target.id, error = %e, "resync query failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::ChannelConsumer;
    use crate::testing::*;

    struct Harness {
        manager: ConnectionManager,
        connector: Arc<FakeConnector>,
        transport: Arc<FakeTransport>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        _consumer: Arc<ChannelConsumer>,
    }

    fn harness_with(config: EngineConfig, transport: Arc<FakeTransport>) -> Harness {
        let dispatcher = EventDispatcher::new();
        let (consumer, events) = ChannelConsumer::new();
        dispatcher.subscribe(&consumer);
        let connector = FakeConnector::new();
        let manager = ConnectionManager::new(
            connector.clone(),
            transport.clone(),
            dispatcher,
            config,
        );
        Harness {
            manager,
            connector,
            transport,
            events,
            _consumer: consumer,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), FakeTransport::accepting())
    }

    #[tokio::test(start_paused = true)]
    async fn connect_completes_handshake() {
        let mut h = harness();
        let server = h.connector.accept();
        let p1 = target("P1");

        h.manager.connect(p1.clone()).await.expect("connect");

        let connecting = next_state(&mut h.events).await;
        assert_eq!(connecting.phase, ConnectionPhase::Connecting);
        assert_eq!(connecting.origin, EventOrigin::Request);
        assert_eq!(connecting.sequence, 1);

        let connected = next_state(&mut h.events).await;
        assert_eq!(connected.phase, ConnectionPhase::Connected);
        assert_eq!(connected.sequence, 2);
        assert_eq!(h.manager.status().phase, ConnectionPhase::Connected);
        assert_eq!(server.sent(), vec![r#"{"throttle":1}"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_exclusive_and_idempotent() {
        let mut h = harness();
        let _server = h.connector.accept();
        let p1 = target("P1");
        let p2 = target("P2");

        h.manager.connect(p1.clone()).await.expect("connect");
        h.manager.connect(p1.clone()).await.expect("same target again");
        let err = h.manager.connect(p2.clone()).await.expect_err("other target");
        assert!(matches!(
            err,
            PrintlinkError::AlreadyConnecting { current, requested }
                if current == p1.id && requested == p2.id
        ));

        next_state(&mut h.events).await;
        next_state(&mut h.events).await;
        assert_eq!(h.connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_become_sequenced_events() {
        let mut h = harness();
        let server = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        server.push(current_frame("Operational"));
        server.push_text("{not json");
        server.push(serde_json::json!({"slicingProgress": {}}));
        server.push(current_frame("Printing"));

        let first = next_state(&mut h.events).await;
        let second = next_state(&mut h.events).await;
        assert_eq!(first.origin, EventOrigin::Realtime);
        assert_eq!(
            first.printer.as_ref().map(|p| p.state_text.as_str()),
            Some("Operational")
        );
        assert_eq!(
            second.printer.as_ref().map(|p| p.state_text.as_str()),
            Some("Printing")
        );
        assert_eq!(second.sequence, first.sequence + 1);
        assert_eq!(h.manager.status().phase, ConnectionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_surfaced_once() {
        let mut h = harness();
        h.connector.refuse(PrintlinkError::Auth("HTTP 401".into()));
        let p1 = target("P1");
        h.manager.connect(p1.clone()).await.expect("connect");

        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connecting);
        let stopped = next_state(&mut h.events).await;
        assert_eq!(stopped.phase, ConnectionPhase::Disconnected);
        assert_eq!(stopped.last_error, Some(ErrorClass::UserAction));
        assert!(matches!(
            next_event(&mut h.events).await,
            EngineEvent::AuthFailed { target_id, .. } if target_id == p1.id
        ));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.connector.opens(), 1);
        assert!(h.events.try_recv().is_err());

        // A fresh connect after fixing credentials is allowed.
        let _server = h.connector.accept();
        h.manager.connect(p1).await.expect("reconnect");
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connecting);
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_resets_on_connect() {
        let mut h = harness();
        for _ in 0..3 {
            h.connector.refuse(PrintlinkError::Network("connection refused".into()));
        }
        let _server = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");

        let mut errors = 0;
        loop {
            let event = next_state(&mut h.events).await;
            match event.phase {
                ConnectionPhase::Error => {
                    errors += 1;
                    assert_eq!(event.last_error, Some(ErrorClass::Transient));
                }
                ConnectionPhase::Connected => break,
                _ => {}
            }
        }
        assert_eq!(errors, 3);
        assert_eq!(h.manager.status().retry_count, 0);

        let opens = h.connector.open_log();
        assert_eq!(opens.len(), 4);
        let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1].1 - w[0].1).collect();
        assert!(gaps[0] >= Duration::from_millis(1_000));
        assert!(gaps.windows(2).all(|g| g[1] >= g[0]));
        assert!(gaps.iter().all(|g| *g <= Duration::from_millis(8_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_triggers_reconnect() {
        let mut h = harness();
        let first = h.connector.accept();
        let _second = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        first.hang_up();
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Error);
        let retry = next_state(&mut h.events).await;
        assert_eq!(retry.phase, ConnectionPhase::Connecting);
        assert_eq!(retry.origin, EventOrigin::Realtime);
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connected);
        assert_eq!(h.connector.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_connected_envelope() {
        let mut h = harness();
        let silent = h.connector.accept_silent();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;

        let failed = next_state(&mut h.events).await;
        assert_eq!(failed.phase, ConnectionPhase::Error);
        assert!(silent.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_backoff_and_is_idempotent() {
        let mut h = harness();
        h.connector.refuse(PrintlinkError::Network("connection refused".into()));
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Error);

        h.manager.disconnect().await;
        let down = next_state(&mut h.events).await;
        assert_eq!(down.phase, ConnectionPhase::Disconnected);
        assert_eq!(down.origin, EventOrigin::Request);

        h.manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.opens(), 1);
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.manager.status().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_socket() {
        let mut h = harness();
        let server = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        h.manager.disconnect().await;
        assert!(server.is_closed());
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_tears_down_before_connecting_new_target() {
        let mut h = harness();
        let old = h.connector.accept();
        let _new = h.connector.accept();
        let p1 = target("P1");
        let p2 = target("P2");

        h.manager.connect(p1.clone()).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        assert!(h.manager.switch_to(p2.clone()).await);
        assert!(old.is_closed());
        assert!(!h.manager.switch_to(p2.clone()).await);

        let down = next_state(&mut h.events).await;
        assert_eq!((down.target_id, down.phase), (p1.id, ConnectionPhase::Disconnected));
        assert_eq!(down.origin, EventOrigin::TargetSwitch);
        let connecting = next_state(&mut h.events).await;
        assert_eq!((connecting.target_id, connecting.phase), (p2.id, ConnectionPhase::Connecting));
        assert_eq!(connecting.origin, EventOrigin::TargetSwitch);
        assert_eq!(connecting.sequence, 1);
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connected);
        assert_eq!(h.manager.current_target().await.map(|t| t.id), Some(p2.id));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_during_backoff_cancels_pending_attempt() {
        let mut h = harness();
        h.connector.refuse(PrintlinkError::Network("connection refused".into()));
        let _p2_server = h.connector.accept();
        let p1 = target("P1");
        let p2 = target("P2");

        h.manager.connect(p1.clone()).await.expect("connect");
        next_state(&mut h.events).await;
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Error);

        h.manager.switch_to(p2.clone()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let targets: Vec<TargetId> = h.connector.open_log().iter().map(|(id, _)| *id).collect();
        assert_eq!(targets, vec![p1.id, p2.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_frames_trigger_resync() {
        let config = EngineConfig {
            realtime_buffer: 1,
            ..test_config()
        };
        let mut h = harness_with(config, FakeTransport::accepting());
        let server = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        for _ in 0..10 {
            server.push(current_frame("Printing"));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.push(current_frame("Printing"));

        let mut saw_resync = false;
        for _ in 0..20 {
            let event = next_state(&mut h.events).await;
            if event.origin == EventOrigin::Resync {
                saw_resync = true;
                assert_eq!(
                    event.printer.map(|p| p.state_text),
                    Some("Operational".to_string())
                );
                break;
            }
        }
        assert!(saw_resync);
        assert!(
            h.transport
                .calls()
                .iter()
                .any(|(_, c)| *c == Command::QueryPrinterState)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commands_require_a_session_and_run_concurrently() {
        let mut h = harness();
        let outcome = h.manager.send_command(Command::QueryJob).await;
        assert!(matches!(
            outcome,
            CommandOutcome::TransportFailed(PrintlinkError::NotConnected)
        ));

        let _server = h.connector.accept();
        h.manager.connect(target("P1")).await.expect("connect");
        next_state(&mut h.events).await;

        h.transport.set_delay(Duration::from_secs(1));
        let (a, b) = tokio::join!(
            h.manager.send_command(Command::QueryJob),
            h.manager.send_command(Command::QueryPrinterState),
        );
        assert!(a.is_accepted() && b.is_accepted());
        assert_eq!(h.transport.max_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sd_refresh_falls_back_to_init_through_manager() {
        let transport = FakeTransport::new(|command| match command {
            Command::RefreshSd => CommandOutcome::Rejected {
                status: 409,
                class: ErrorClass::Permanent,
                reason: "SD card not initialised".into(),
            },
            _ => CommandOutcome::Accepted {
                status: 204,
                body: String::new(),
            },
        });
        let h = harness_with(test_config(), transport);
        let outcome = printlink_net::refresh_sd(&h.manager, &target("P1")).await;
        assert!(outcome.is_accepted());
        let sent: Vec<Command> = h.transport.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(sent, vec![Command::RefreshSd, Command::InitSd]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_command_times_out_as_network_error() {
        let h = harness();
        h.transport.set_delay(Duration::from_secs(30));
        let outcome = h
            .manager
            .send_command_to(&target("P1"), &Command::QueryPrinterState)
            .await;
        let CommandOutcome::TransportFailed(err) = outcome else {
            panic!("expected transport failure");
        };
        assert!(matches!(err, PrintlinkError::Network(_)));
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_times_out_into_backoff() {
        let mut h = harness();
        h.connector.stall();
        let start = tokio::time::Instant::now();
        h.manager.connect(target("P1")).await.expect("connect");
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connecting);

        let failed = next_state(&mut h.events).await;
        assert_eq!(failed.phase, ConnectionPhase::Error);
        assert_eq!(failed.last_error, Some(ErrorClass::Transient));
        assert!(start.elapsed() >= Duration::from_millis(2_000));

        // The retry is refused by the exhausted script.
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connecting);
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Error);
        assert_eq!(h.connector.opens(), 2);
        assert_eq!(h.manager.status().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_close_is_released_before_next_socket_opens() {
        let mut h = harness();
        let old = h.connector.accept();
        old.stall_close();
        let _new = h.connector.accept();
        let p1 = target("P1");
        let p2 = target("P2");

        h.manager.connect(p1.clone()).await.expect("connect");
        next_state(&mut h.events).await;
        next_state(&mut h.events).await;

        assert!(h.manager.switch_to(p2.clone()).await);
        let down = next_state(&mut h.events).await;
        assert_eq!((down.target_id, down.phase), (p1.id, ConnectionPhase::Disconnected));
        assert_eq!(next_state(&mut h.events).await.phase, ConnectionPhase::Connecting);
        let up = next_state(&mut h.events).await;
        assert_eq!((up.target_id, up.phase), (p2.id, ConnectionPhase::Connected));

        assert!(old.is_closed());
        assert!(old.is_dropped());
        assert_eq!(h.connector.max_live(), 1);
        assert_eq!(h.connector.live(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_never_overlap_sockets() {
        let config = EngineConfig {
            teardown_grace_ms: 20,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
            ..test_config()
        };
        let h = harness_with(config, FakeTransport::accepting());
        h.connector.accept_all(Duration::from_millis(5));
        let targets = [target("A"), target("B"), target("C")];

        let mut tasks = Vec::new();
        for i in 0..40 {
            let manager = h.manager.clone();
            let t = targets[i % targets.len()].clone();
            tasks.push(tokio::spawn(async move {
                match i % 4 {
                    0 => {
                        // Refused while another target is live; that is fine.
                        let _ = manager.connect(t).await;
                    }
                    1 | 2 => {
                        manager.switch_to(t).await;
                    }
                    _ => manager.disconnect().await,
                }
                tokio::time::sleep(Duration::from_millis((i % 3) as u64)).await;
            }));
        }
        for task in tasks {
            task.await.expect("transition task");
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.manager.disconnect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.connector.opens() > 0);
        assert_eq!(h.connector.max_live(), 1);
        assert_eq!(h.connector.live(), 0);
        assert_eq!(h.manager.status().phase, ConnectionPhase::Disconnected);
    }

    #[test]
    fn sequencer_reports_holes() {
        let mut seq = FrameSequencer::default();
        assert_eq!(seq.observe(1), 0);
        assert_eq!(seq.observe(2), 0);
        assert_eq!(seq.observe(5), 2);
        assert_eq!(seq.observe(6), 0);
    }
}
