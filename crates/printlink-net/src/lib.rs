// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printlink Net: the OctoPrint wire layer.  Realtime websocket channel,
// REST command client, envelope parsing, and reconnect backoff.  Everything
// above this crate talks through the `RealtimeConnector` and
// `CommandTransport` seams so tests can swap in fakes.

pub mod command;
pub mod protocol;
pub mod realtime;
pub mod retry;

pub use command::{
    Command, CommandOutcome, CommandTransport, FileOrigin, HttpCommandClient, JobAction, refresh_sd,
};
pub use protocol::{FileEntry, Inbound, parse_envelope, parse_files};
pub use realtime::{RealtimeConnector, RealtimeStream, WsConnector};
pub use retry::BackoffSchedule;
