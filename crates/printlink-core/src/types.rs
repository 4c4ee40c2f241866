// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printlink engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, globally unique identifier for a printer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TargetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Orientation of the printer's camera stream (EXIF-style, raw values 0–7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraOrientation {
    #[default]
    Up,
    Down,
    Left,
    Right,
    UpMirrored,
    DownMirrored,
    LeftMirrored,
    RightMirrored,
}

impl CameraOrientation {
    /// Raw integer stored on disk and in the cloud mirror.
    pub fn raw(&self) -> i64 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Left => 2,
            Self::Right => 3,
            Self::UpMirrored => 4,
            Self::DownMirrored => 5,
            Self::LeftMirrored => 6,
            Self::RightMirrored => 7,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Left),
            3 => Some(Self::Right),
            4 => Some(Self::UpMirrored),
            5 => Some(Self::DownMirrored),
            6 => Some(Self::LeftMirrored),
            7 => Some(Self::RightMirrored),
            _ => None,
        }
    }

    /// Derive the orientation from OctoPrint's webcam flip/rotate settings.
    pub fn from_webcam_settings(flip_h: bool, flip_v: bool, rotate_90: bool) -> Self {
        match (flip_h, flip_v, rotate_90) {
            (true, false, false) => Self::UpMirrored,
            (false, true, false) => Self::DownMirrored,
            (true, true, false) => Self::Down,
            (false, false, true) => Self::Left,
            (true, false, true) => Self::LeftMirrored,
            (false, true, true) => Self::RightMirrored,
            (true, true, true) => Self::Right,
            (false, false, false) => Self::Up,
        }
    }
}

/// Credentials used for both the realtime channel and command requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credential {
    /// OctoPrint API key, sent as `X-Api-Key`.
    pub api_key: String,
    /// Optional HTTP basic-auth username (reverse proxies in front of the server).
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A remote print server the engine can connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterTarget {
    pub id: TargetId,
    pub name: String,
    /// Base URL, e.g. `http://octopi.local`.
    pub host: String,
    pub credential: Credential,
    pub camera_orientation: CameraOrientation,
    /// Whether the first camera streams 16:9 (otherwise 4:3).
    pub camera_aspect_16_9: bool,
    /// UI accent color, e.g. `#1e88e5`.
    pub color: Option<String>,
    pub sd_support: bool,
    pub is_default: bool,
    /// Last-known modification time, shared with the cloud mirror for
    /// last-writer-wins reconciliation.
    pub modified_at: DateTime<Utc>,
}

/// Payload for creating a new target.
#[derive(Debug, Clone, Default)]
pub struct NewTarget {
    pub name: String,
    pub host: String,
    pub credential: Credential,
    pub camera_orientation: CameraOrientation,
    pub camera_aspect_16_9: bool,
    pub color: Option<String>,
    pub sd_support: bool,
    /// Request this target become the default. The first target always does.
    pub make_default: bool,
}

/// Partial set of target fields. `None` means "leave untouched".
///
/// Used for local updates and for cloud records, which may carry only the
/// fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_orientation: Option<CameraOrientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_aspect_16_9: Option<bool>,
    /// `Some(None)` clears the color; serialized as `null`.
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub color: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd_support: Option<bool>,
}

/// Keeps an explicit `null` apart from a missing field: missing falls back
/// to `default` (`None`), `null` becomes `Some(None)`.
fn present_or_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl TargetPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Full patch carrying every mirrored field of `target`.
    pub fn from_target(target: &PrinterTarget) -> Self {
        Self {
            name: Some(target.name.clone()),
            host: Some(target.host.clone()),
            credential: Some(target.credential.clone()),
            camera_orientation: Some(target.camera_orientation),
            camera_aspect_16_9: Some(target.camera_aspect_16_9),
            color: Some(target.color.clone()),
            sd_support: Some(target.sd_support),
        }
    }

    /// Overwrite only the fields present in this patch.
    pub fn apply_to(&self, target: &mut PrinterTarget) {
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(host) = &self.host {
            target.host = host.clone();
        }
        if let Some(credential) = &self.credential {
            target.credential = credential.clone();
        }
        if let Some(orientation) = self.camera_orientation {
            target.camera_orientation = orientation;
        }
        if let Some(aspect) = self.camera_aspect_16_9 {
            target.camera_aspect_16_9 = aspect;
        }
        if let Some(color) = &self.color {
            target.color = color.clone();
        }
        if let Some(sd) = self.sd_support {
            target.sd_support = sd;
        }
    }
}

// ---------------------------------------------------------------------------
// Cloud mirror
// ---------------------------------------------------------------------------

/// Cloud-side mirror of a printer target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: TargetId,
    pub modified_at: DateTime<Utc>,
    /// Only the fields present in the remote payload.
    pub fields: TargetPatch,
}

impl SyncRecord {
    pub fn from_target(target: &PrinterTarget) -> Self {
        Self {
            id: target.id,
            modified_at: target.modified_at,
            fields: TargetPatch::from_target(target),
        }
    }
}

/// Remote deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMarker {
    pub id: TargetId,
    pub deleted_at: DateTime<Utc>,
}

/// Opaque token used to request only changes since the last pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken(pub String);

// ---------------------------------------------------------------------------
// Connection + state events
// ---------------------------------------------------------------------------

/// Phase of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip, timeout, unreachable; safe to retry automatically.
    Transient,
    /// User must take action (fix credentials, grant access).
    UserAction,
    /// Malformed data or a request the server will never accept.
    Permanent,
}

/// Printer state flags as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrinterFlags {
    pub operational: bool,
    pub printing: bool,
    pub paused: bool,
    pub pausing: bool,
    pub cancelling: bool,
    pub ready: bool,
    pub error: bool,
    pub closed_or_error: bool,
    pub sd_ready: bool,
}

/// One temperature sensor reading (tool0, bed, chamber...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub sensor: String,
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

/// Progress of the current job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub file_name: Option<String>,
    /// Percentage 0–100.
    pub completion: Option<f64>,
    /// Seconds elapsed.
    pub print_time: Option<u64>,
    /// Seconds remaining (estimate).
    pub print_time_left: Option<u64>,
}

/// Coarse job phase derived from the printer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Idle,
    Printing,
    Paused,
    Finishing,
    Error,
}

/// Normalized printer status, independent of the wire format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    pub state_text: String,
    pub flags: PrinterFlags,
    pub temperatures: Vec<TemperatureReading>,
    pub job: JobProgress,
}

impl PrinterSnapshot {
    pub fn job_phase(&self) -> JobPhase {
        let flags = &self.flags;
        if flags.error {
            JobPhase::Error
        } else if flags.cancelling || flags.pausing {
            JobPhase::Finishing
        } else if flags.paused {
            JobPhase::Paused
        } else if flags.printing {
            JobPhase::Printing
        } else {
            JobPhase::Idle
        }
    }

    /// First reading whose sensor name starts with `prefix` (e.g. "tool", "bed").
    pub fn temperature(&self, prefix: &str) -> Option<&TemperatureReading> {
        self.temperatures.iter().find(|t| t.sensor.starts_with(prefix))
    }
}

/// Why a state event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    /// Caller-initiated connect/disconnect.
    Request,
    /// Pushed over the realtime channel.
    Realtime,
    /// Re-query after a gap in the realtime stream.
    Resync,
    /// Background refresh.
    BackgroundPoll,
    /// Default target switched (e.g. from the companion device).
    TargetSwitch,
}

/// Normalized, sequenced snapshot of target status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub target_id: TargetId,
    /// Strictly increasing within one session.
    pub sequence: u64,
    pub phase: ConnectionPhase,
    pub origin: EventOrigin,
    /// Present when the event carries printer status.
    pub printer: Option<PrinterSnapshot>,
    pub last_error: Option<ErrorClass>,
}

/// Minimal projection of the default target sent to the companion device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionSnapshot {
    pub target_id: TargetId,
    pub target_name: String,
    pub phase: ConnectionPhase,
    pub state_text: Option<String>,
    pub job_phase: Option<JobPhase>,
    pub completion: Option<f64>,
    pub print_time_left: Option<u64>,
    pub tool_temperature: Option<f64>,
    pub bed_temperature: Option<f64>,
}

/// Outcome reported to the OS after a background invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchResult {
    NewData,
    NoData,
    Failed,
}
