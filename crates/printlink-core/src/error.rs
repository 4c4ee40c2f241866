// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printlink.

use thiserror::Error;

use crate::types::TargetId;

/// Top-level error type for all Printlink operations.
#[derive(Debug, Error)]
pub enum PrintlinkError {
    // -- Connectivity --
    /// Timeout, unreachable host, DNS failure. Always retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid credential or forbidden. Terminal for the current session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed or unexpected payload from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("a session for {current} already exists (requested {requested}); disconnect first")]
    AlreadyConnecting {
        current: TargetId,
        requested: TargetId,
    },

    #[error("no active session")]
    NotConnected,

    // -- Registry --
    #[error("no default printer configured")]
    NoDefaultTarget,

    #[error("printer {0} not found")]
    TargetNotFound(TargetId),

    // -- Side channels --
    /// No account, disabled, restricted network, quota.
    #[error("cloud mirror unavailable: {0}")]
    CloudUnavailable(String),

    #[error("companion device unreachable: {0}")]
    CompanionUnreachable(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Platform bridge --
    #[error("feature not available on this platform")]
    PlatformUnavailable,
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintlinkError>;
