// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for the interactive surface.
//
// Every technical error is mapped to plain English with a clear suggestion.
// The taxonomy uses three severity levels that drive UI presentation.

use crate::error::PrintlinkError;

/// Severity of an error from the user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip, timeout; the engine keeps retrying on its own.
    Transient,
    /// User must do something (fix the API key, pick a printer).
    ActionRequired,
    /// Cannot be fixed by retrying; bad address, unsupported server.
    Permanent,
}

/// A human-readable error with plain English message and actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain English summary (shown as a heading).
    pub message: String,
    /// What the user should try (shown as body text).
    pub suggestion: String,
    /// Whether the engine retries automatically.
    pub retriable: bool,
    pub severity: Severity,
}

/// Convert a `PrintlinkError` into a `HumanError`.
pub fn humanize_error(err: &PrintlinkError) -> HumanError {
    match err {
        PrintlinkError::Network(detail) => humanize_network_error(detail),

        PrintlinkError::Auth(_) => HumanError {
            message: "Authentication failed.".into(),
            suggestion: "Check the API key (and username/password if your server sits behind a proxy), then connect again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        PrintlinkError::Protocol(_) => HumanError {
            message: "The server sent something we didn't understand.".into(),
            suggestion: "Make sure the address points at an OctoPrint server and that it is up to date.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },

        PrintlinkError::AlreadyConnecting { .. } => HumanError {
            message: "Already connecting to another printer.".into(),
            suggestion: "Disconnect from the current printer first, then try again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        PrintlinkError::NotConnected => HumanError {
            message: "Not connected to a printer.".into(),
            suggestion: "Connect to the printer, then try again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        PrintlinkError::NoDefaultTarget | PrintlinkError::TargetNotFound(_) => HumanError {
            message: "No printer selected.".into(),
            suggestion: "Add a printer or choose one from the list, then try again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        // Side channels degrade silently; these only show up in diagnostics.
        PrintlinkError::CloudUnavailable(_) => HumanError {
            message: "Printers are not being shared with your other devices.".into(),
            suggestion: "Sign in to your cloud account to keep printers in sync.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        PrintlinkError::CompanionUnreachable(_) => HumanError {
            message: "Your watch is not reachable.".into(),
            suggestion: "Open the companion app on your watch; it will catch up automatically.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        PrintlinkError::Database(_) => HumanError {
            message: "The app's data storage had a problem.".into(),
            suggestion: "Try closing and reopening the app. Your printers should still be there.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        PrintlinkError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::PermissionDenied {
                HumanError {
                    message: "The app doesn't have permission to write its data.".into(),
                    suggestion: "Check the permissions of the data directory.".into(),
                    retriable: false,
                    severity: Severity::ActionRequired,
                }
            } else {
                HumanError {
                    message: "There was a problem reading or writing a file.".into(),
                    suggestion: "Try again. If this keeps happening, your device's storage may be full.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        PrintlinkError::Serialization(_) => HumanError {
            message: "The app had an internal data problem.".into(),
            suggestion: "Try again. If this keeps happening, please report it.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        PrintlinkError::Config(detail) => HumanError {
            message: "The settings file is not valid.".into(),
            suggestion: format!("Fix or delete the settings file and restart. ({detail})"),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        PrintlinkError::PlatformUnavailable => HumanError {
            message: "This feature isn't available on your device.".into(),
            suggestion: "Some features require a phone with a paired watch or a cloud account.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },
    }
}

/// Parse transport error details into human-readable messages.
fn humanize_network_error(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        HumanError {
            message: "Bad certificate or SSL problem.".into(),
            suggestion: "The server's HTTPS certificate was rejected. Check it has not expired and that the hostname matches.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("dns") || lower.contains("failed to lookup") || lower.contains("resolve") {
        HumanError {
            message: "Server cannot be found.".into(),
            suggestion: "Check the printer address. Names like 'octopi.local' only work on the same Wi-Fi network.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("connection refused") {
        HumanError {
            message: "Could not connect to the server.".into(),
            suggestion: "The server may be turned off, or the port may be wrong.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("timed out") {
        HumanError {
            message: "The server didn't respond in time.".into(),
            suggestion: "The service may be down or the port incorrect. We'll keep trying.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("invalid url") || lower.contains("relative url") {
        HumanError {
            message: "The printer address doesn't look right.".into(),
            suggestion: "It should look like http://octopi.local or http://192.168.1.100:5000.".into(),
            retriable: false,
            severity: Severity::Permanent,
        }
    } else {
        HumanError {
            message: "Connection to the printer failed.".into(),
            suggestion: format!("We'll try again automatically. (Detail: {detail})"),
            retriable: true,
            severity: Severity::Transient,
        }
    }
}
