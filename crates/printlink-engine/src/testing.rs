// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scripted fakes for the realtime and command seams, shared by the engine's
// unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use printlink_core::config::EngineConfig;
use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{Credential, PrinterTarget, StateEvent, TargetId};
use printlink_net::{Command, CommandOutcome, CommandTransport, RealtimeConnector, RealtimeStream};

use crate::dispatcher::EngineEvent;

pub fn target(name: &str) -> PrinterTarget {
    PrinterTarget {
        id: TargetId::new(),
        name: name.into(),
        host: format!("http://{}.local", name.to_lowercase()),
        credential: Credential {
            api_key: "KEY".into(),
            ..Default::default()
        },
        camera_orientation: Default::default(),
        camera_aspect_16_9: false,
        color: None,
        sd_support: false,
        is_default: false,
        modified_at: Utc::now(),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        command_timeout_ms: 5_000,
        handshake_timeout_ms: 2_000,
        backoff_initial_ms: 1_000,
        backoff_max_ms: 8_000,
        realtime_buffer: 16,
        teardown_grace_ms: 500,
        ..Default::default()
    }
}

pub fn current_frame(state_text: &str) -> Value {
    json!({
        "current": {
            "state": {"text": state_text, "flags": {"operational": true}},
            "temps": [{"time": 1, "tool0": {"actual": 21.0, "target": 0.0}}]
        }
    })
}

pub const PRINTER_STATE: &str = r#"{
    "state": {"text": "Operational", "flags": {"operational": true, "ready": true}},
    "temperature": {"tool0": {"actual": 21.5, "target": 0.0}, "bed": {"actual": 20.0, "target": 0.0}},
    "sd": {"ready": true}
}"#;

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

type Item = Result<Option<String>>;

/// Test-side handle of one scripted realtime channel.
#[derive(Clone)]
pub struct FakeServer {
    frames: mpsc::UnboundedSender<Item>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn push(&self, frame: Value) {
        let _ = self.frames.send(Ok(Some(frame.to_string())));
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.frames.send(Ok(Some(text.to_owned())));
    }

    pub fn fail(&self, err: PrintlinkError) {
        let _ = self.frames.send(Err(err));
    }

    /// Server-initiated close.
    pub fn hang_up(&self) {
        let _ = self.frames.send(Ok(None));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent").clone()
    }

    /// Whether the client closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the client's close handshake hang forever.
    pub fn stall_close(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    /// Whether the client dropped its end of the socket.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

pub struct FakeStream {
    frames: mpsc::UnboundedReceiver<Item>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
    close_delay: Duration,
    dropped: Arc<AtomicBool>,
    live: Option<Arc<AtomicUsize>>,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RealtimeStream for FakeStream {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().expect("sent").push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        match self.frames.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
    }
}

fn channel() -> (FakeServer, FakeStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let stall_close = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));
    (
        FakeServer {
            frames: tx,
            sent: sent.clone(),
            closed: closed.clone(),
            stall_close: stall_close.clone(),
            dropped: dropped.clone(),
        },
        FakeStream {
            frames: rx,
            sent,
            closed,
            stall_close,
            close_delay: Duration::ZERO,
            dropped,
            live: None,
        },
    )
}

enum Scripted {
    Stream(FakeStream),
    Fail(PrintlinkError),
    Stall,
}

/// Connector that hands out scripted channels in order.  Once the script is
/// exhausted every attempt is refused, unless [`accept_all`] was called.
///
/// [`accept_all`]: FakeConnector::accept_all
#[derive(Default)]
pub struct FakeConnector {
    script: Mutex<VecDeque<Scripted>>,
    opens: Mutex<Vec<(TargetId, Instant)>>,
    accept_all: Mutex<Option<Duration>>,
    servers: Mutex<Vec<FakeServer>>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next attempt succeeds and the server completes the handshake.
    pub fn accept(&self) -> FakeServer {
        let server = self.accept_silent();
        server.push(json!({"connected": {"version": "1.10.0"}}));
        server
    }

    /// Next attempt opens a socket but the server never says `connected`.
    pub fn accept_silent(&self) -> FakeServer {
        let (server, stream) = channel();
        self.script
            .lock()
            .expect("script")
            .push_back(Scripted::Stream(stream));
        server
    }

    pub fn refuse(&self, err: PrintlinkError) {
        self.script
            .lock()
            .expect("script")
            .push_back(Scripted::Fail(err));
    }

    /// Next attempt never completes.
    pub fn stall(&self) {
        self.script.lock().expect("script").push_back(Scripted::Stall);
    }

    /// Once the script is exhausted, accept every attempt and complete the
    /// handshake.  Each accepted socket takes `close_delay` to close.
    pub fn accept_all(&self, close_delay: Duration) {
        *self.accept_all.lock().expect("accept_all") = Some(close_delay);
    }

    /// Sockets handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of sockets ever alive at once.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.lock().expect("opens").len()
    }

    pub fn open_log(&self) -> Vec<(TargetId, Instant)> {
        self.opens.lock().expect("opens").clone()
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn open(&self, target: &PrinterTarget) -> Result<Box<dyn RealtimeStream>> {
        self.opens
            .lock()
            .expect("opens")
            .push((target.id, Instant::now()));
        let next = self.script.lock().expect("script").pop_front();
        let accept_all = *self.accept_all.lock().expect("accept_all");
        let mut stream = match next {
            Some(Scripted::Stream(stream)) => stream,
            Some(Scripted::Fail(err)) => return Err(err),
            Some(Scripted::Stall) => std::future::pending::<FakeStream>().await,
            None => match accept_all {
                Some(close_delay) => {
                    let (server, mut stream) = channel();
                    server.push(json!({"connected": {"version": "1.10.0"}}));
                    stream.close_delay = close_delay;
                    self.servers.lock().expect("servers").push(server);
                    stream
                }
                None => return Err(PrintlinkError::Network("connection refused".into())),
            },
        };

        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        stream.live = Some(self.live.clone());
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&Command) -> CommandOutcome + Send + Sync>;

pub struct FakeTransport {
    responder: Responder,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<(TargetId, Command)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new(responder: impl Fn(&Command) -> CommandOutcome + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Every command is accepted; state queries get a canned printer state.
    pub fn accepting() -> Arc<Self> {
        Self::new(|command| CommandOutcome::Accepted {
            status: 200,
            body: match command {
                Command::QueryPrinterState => PRINTER_STATE.to_owned(),
                _ => String::new(),
            },
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay") = delay;
    }

    pub fn calls(&self) -> Vec<(TargetId, Command)> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandTransport for FakeTransport {
    async fn execute(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome {
        self.calls
            .lock()
            .expect("calls")
            .push((target.id, command.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(command)
    }
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

/// Next `State` event, skipping everything else.  Panics after a minute of
/// (virtual) silence.
pub async fn next_state(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> StateEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for a state event")
            .expect("dispatcher closed");
        if let EngineEvent::State(state) = event {
            return state;
        }
    }
}

/// Next event of any kind.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("dispatcher closed")
}
