// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command protocol: independent request/response exchanges over OctoPrint's
// REST API.  Commands never share the realtime socket, so any number can be
// in flight at once.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use url::Url;

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{ErrorClass, PrinterTarget};

use crate::retry::classify_status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

/// Storage a print file lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOrigin {
    Local,
    Sdcard,
}

impl FileOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sdcard => "sdcard",
        }
    }
}

/// Operations the engine can ask a print server to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open the server's serial link to the printer.
    ConnectPrinter,
    DisconnectPrinter,
    QueryPrinterState,
    QueryConnection,
    QuerySettings,
    QueryJob,
    SetToolTemperature { tool: u8, celsius: f64 },
    SetBedTemperature { celsius: f64 },
    Job(JobAction),
    SendGcode(Vec<String>),
    /// Recursive listing of every origin.
    ListFiles,
    /// Select a file and start printing it.
    PrintFile { origin: FileOrigin, path: String },
    DeleteFile { origin: FileOrigin, path: String },
    /// Re-read the SD card's file list.
    RefreshSd,
    /// Initialise the SD card; needed before a refresh on some firmwares.
    InitSd,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectPrinter => "connect-printer",
            Self::DisconnectPrinter => "disconnect-printer",
            Self::QueryPrinterState => "query-printer-state",
            Self::QueryConnection => "query-connection",
            Self::QuerySettings => "query-settings",
            Self::QueryJob => "query-job",
            Self::SetToolTemperature { .. } => "set-tool-temperature",
            Self::SetBedTemperature { .. } => "set-bed-temperature",
            Self::Job(JobAction::Start) => "job-start",
            Self::Job(JobAction::Pause) => "job-pause",
            Self::Job(JobAction::Resume) => "job-resume",
            Self::Job(JobAction::Cancel) => "job-cancel",
            Self::SendGcode(_) => "send-gcode",
            Self::ListFiles => "list-files",
            Self::PrintFile { .. } => "print-file",
            Self::DeleteFile { .. } => "delete-file",
            Self::RefreshSd => "refresh-sd",
            Self::InitSd => "init-sd",
        }
    }

    fn method(&self) -> Method {
        match self {
            Self::QueryPrinterState
            | Self::QueryConnection
            | Self::QuerySettings
            | Self::QueryJob
            | Self::ListFiles => Method::GET,
            Self::DeleteFile { .. } => Method::DELETE,
            _ => Method::POST,
        }
    }

    /// Unencoded path; file paths may contain spaces and other characters
    /// that `request_url` escapes per segment.
    fn path(&self) -> String {
        let fixed = match self {
            Self::ConnectPrinter | Self::DisconnectPrinter | Self::QueryConnection => {
                "/api/connection"
            }
            Self::QueryPrinterState => "/api/printer",
            Self::QuerySettings => "/api/settings",
            Self::QueryJob | Self::Job(_) => "/api/job",
            Self::SetToolTemperature { .. } => "/api/printer/tool",
            Self::SetBedTemperature { .. } => "/api/printer/bed",
            Self::SendGcode(_) => "/api/printer/command",
            Self::ListFiles => "/api/files",
            Self::RefreshSd | Self::InitSd => "/api/printer/sd",
            Self::PrintFile { origin, path } | Self::DeleteFile { origin, path } => {
                return format!("/api/files/{}/{}", origin.as_str(), path.trim_start_matches('/'));
            }
        };
        fixed.to_owned()
    }

    fn query(&self) -> Option<&'static str> {
        match self {
            Self::ListFiles => Some("recursive=true"),
            _ => None,
        }
    }

    fn body(&self) -> Option<Value> {
        match self {
            Self::ConnectPrinter => Some(json!({ "command": "connect" })),
            Self::DisconnectPrinter => Some(json!({ "command": "disconnect" })),
            Self::SetToolTemperature { tool, celsius } => {
                let mut targets = serde_json::Map::new();
                targets.insert(format!("tool{tool}"), json!(celsius));
                Some(json!({ "command": "target", "targets": targets }))
            }
            Self::SetBedTemperature { celsius } => {
                Some(json!({ "command": "target", "target": celsius }))
            }
            Self::Job(JobAction::Start) => Some(json!({ "command": "start" })),
            Self::Job(JobAction::Pause) => Some(json!({ "command": "pause", "action": "pause" })),
            Self::Job(JobAction::Resume) => {
                Some(json!({ "command": "pause", "action": "resume" }))
            }
            Self::Job(JobAction::Cancel) => Some(json!({ "command": "cancel" })),
            Self::SendGcode(lines) => Some(json!({ "commands": lines })),
            Self::PrintFile { .. } => Some(json!({ "command": "select", "print": true })),
            Self::RefreshSd => Some(json!({ "command": "refresh" })),
            Self::InitSd => Some(json!({ "command": "init" })),
            Self::QueryPrinterState
            | Self::QueryConnection
            | Self::QuerySettings
            | Self::QueryJob
            | Self::ListFiles
            | Self::DeleteFile { .. } => None,
        }
    }
}

/// Join the command path onto the target host, keeping any reverse-proxy
/// prefix and escaping each path segment.
pub fn request_url(host: &str, command: &Command) -> Result<Url> {
    let mut url = Url::parse(host)
        .map_err(|e| PrintlinkError::Network(format!("invalid url '{host}': {e}")))?;
    let path = command.path();
    url.path_segments_mut()
        .map_err(|()| PrintlinkError::Network(format!("invalid url '{host}'")))?
        .pop_if_empty()
        .extend(path.split('/').filter(|s| !s.is_empty()));
    url.set_query(command.query());
    Ok(url)
}

/// Result of one command exchange.
#[derive(Debug)]
pub enum CommandOutcome {
    Accepted {
        status: u16,
        body: String,
    },
    Rejected {
        status: u16,
        class: ErrorClass,
        reason: String,
    },
    TransportFailed(PrintlinkError),
}

impl CommandOutcome {
    /// Collapse into a `Result` carrying the response body.
    pub fn into_body(self) -> Result<String> {
        match self {
            Self::Accepted { body, .. } => Ok(body),
            Self::Rejected {
                status,
                class: ErrorClass::UserAction,
                reason,
            } => Err(PrintlinkError::Auth(format!("{status}: {reason}"))),
            Self::Rejected {
                status,
                class: ErrorClass::Transient,
                reason,
            } => Err(PrintlinkError::Network(format!("{status}: {reason}"))),
            Self::Rejected { status, reason, .. } => {
                Err(PrintlinkError::Protocol(format!("{status}: {reason}")))
            }
            Self::TransportFailed(err) => Err(err),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Executes commands against a target.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn execute(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome;
}

/// REST client for OctoPrint's `/api` endpoints.
#[derive(Debug, Clone)]
pub struct HttpCommandClient {
    client: reqwest::Client,
}

impl HttpCommandClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("printlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PrintlinkError::Network(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CommandTransport for HttpCommandClient {
    #[instrument(skip(self, target), fields(target_id = %target.id, command = command.name()))]
    async fn execute(&self, target: &PrinterTarget, command: &Command) -> CommandOutcome {
        let url = match request_url(&target.host, command) {
            Ok(url) => url,
            Err(e) => return CommandOutcome::TransportFailed(e),
        };
        let mut request = self
            .client
            .request(command.method(), url)
            .header("X-Api-Key", &target.credential.api_key);
        if let Some(username) = target.credential.username.as_deref().filter(|u| !u.is_empty()) {
            request = request.basic_auth(username, target.credential.password.as_deref());
        }
        if let Some(body) = command.body() {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return CommandOutcome::TransportFailed(map_reqwest_error(command, &e)),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return CommandOutcome::TransportFailed(map_reqwest_error(command, &e)),
        };

        if (200..300).contains(&status) {
            debug!(status, "command accepted");
            CommandOutcome::Accepted { status, body }
        } else {
            let class = classify_status(status);
            let reason = rejection_reason(&body);
            warn!(status, ?class, %reason, "command rejected");
            CommandOutcome::Rejected {
                status,
                class,
                reason,
            }
        }
    }
}

/// Refresh the SD card listing.  Servers answer 409 when the card has not
/// been initialised yet; in that case initialise it instead, which also
/// loads the listing.
pub async fn refresh_sd(transport: &dyn CommandTransport, target: &PrinterTarget) -> CommandOutcome {
    match transport.execute(target, &Command::RefreshSd).await {
        CommandOutcome::Rejected { status: 409, .. } => {
            info!(target_id = %target.id, "sd card not ready; initialising");
            transport.execute(target, &Command::InitSd).await
        }
        other => other,
    }
}

/// OctoPrint answers errors with `{"error": "..."}` or plain text.
fn rejection_reason(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        if let Some(Value::String(error)) = map.get("error") {
            return error.clone();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no reason given".into()
    } else {
        trimmed.chars().take(200).collect()
    }
}

/// Flatten the error chain so DNS/refused/TLS details survive for
/// human-readable reporting.
fn map_reqwest_error(command: &Command, err: &reqwest::Error) -> PrintlinkError {
    if err.is_timeout() {
        return PrintlinkError::Network(format!("{} timed out", command.name()));
    }
    if err.is_builder() {
        return PrintlinkError::Network(format!("invalid url: {err}"));
    }
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    PrintlinkError::Network(format!("{}: {detail}", command.name()))
}
