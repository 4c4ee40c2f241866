// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconnect backoff and error classification.
//
// Errors are classified as Transient (reconnect after backoff), UserAction
// (stop and surface once) or Permanent (drop the message, keep the session).

use std::time::Duration;

use printlink_core::error::PrintlinkError;
use printlink_core::types::ErrorClass;
use tracing::debug;

/// Classify a `PrintlinkError` for the session state machine.
pub fn classify_error(err: &PrintlinkError) -> ErrorClass {
    match err {
        PrintlinkError::Network(_) => ErrorClass::Transient,
        PrintlinkError::CloudUnavailable(_) => ErrorClass::Transient,
        PrintlinkError::CompanionUnreachable(_) => ErrorClass::Transient,
        PrintlinkError::Database(_) => ErrorClass::Transient,

        PrintlinkError::Auth(_) => ErrorClass::UserAction,
        PrintlinkError::NoDefaultTarget => ErrorClass::UserAction,
        PrintlinkError::TargetNotFound(_) => ErrorClass::UserAction,
        PrintlinkError::AlreadyConnecting { .. } => ErrorClass::UserAction,
        PrintlinkError::NotConnected => ErrorClass::UserAction,
        PrintlinkError::Config(_) => ErrorClass::UserAction,

        PrintlinkError::Protocol(_) => ErrorClass::Permanent,
        PrintlinkError::Serialization(_) => ErrorClass::Permanent,
        PrintlinkError::PlatformUnavailable => ErrorClass::Permanent,

        PrintlinkError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorClass::UserAction
            }
            _ => ErrorClass::Transient,
        },
    }
}

/// Classify an HTTP status returned by the command protocol.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::UserAction,
        // 409: printer not operational; resending the same request won't help.
        400 | 404 | 405 | 409 | 415 => ErrorClass::Permanent,
        408 | 429 => ErrorClass::Transient,
        s if s >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Exponential reconnect schedule with deterministic jitter.
///
/// delay(n) = min(initial * 2^n + jitter(n), max), jitter in [0, initial).
/// Because the exponential step always exceeds the jitter range, successive
/// delays never decrease.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = compute_delay(self.attempt, self.initial, self.max);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "backoff");
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called on reaching `Connected`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn compute_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    if attempt >= 20 {
        return max;
    }
    let base_ms = initial.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt);
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    Duration::from_millis(total_ms.min(max.as_millis() as u64))
}

/// Spread reconnects from many clients without pulling in an RNG.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        let err = PrintlinkError::Network("timed out after 10s".into());
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[test]
    fn bad_key_is_user_action() {
        assert_eq!(
            classify_error(&PrintlinkError::Auth("401".into())),
            ErrorClass::UserAction
        );
        assert_eq!(classify_status(403), ErrorClass::UserAction);
    }

    #[test]
    fn not_operational_is_permanent() {
        assert_eq!(classify_status(409), ErrorClass::Permanent);
        assert_eq!(classify_status(503), ErrorClass::Transient);
    }

    #[test]
    fn delays_never_decrease_and_respect_cap() {
        let mut schedule =
            BackoffSchedule::new(Duration::from_millis(250), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = schedule.next_delay();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));
    }

    #[test]
    fn reset_starts_over() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(1), Duration::from_secs(60));
        let first = schedule.next_delay();
        schedule.next_delay();
        schedule.next_delay();
        schedule.reset();
        assert_eq!(schedule.attempt(), 0);
        assert_eq!(schedule.next_delay(), first);
    }

    #[test]
    fn cap_below_initial_is_lifted() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
    }
}
