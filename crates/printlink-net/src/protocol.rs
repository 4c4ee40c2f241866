// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// OctoPrint wire formats.
//
// Realtime frames are JSON objects keyed by a single discriminator:
//
//   {"connected": {...}}   handshake acknowledgement (server version, api version)
//   {"current":   {...}}   periodic state push
//   {"history":   {...}}   state backlog sent once after connecting
//   {"event":     {...}}   server event (PrintStarted, FileAdded, ...)
//   {"plugin":    {...}}   plugin message
//
// Anything else (timelapse, slicingProgress, reauthRequired...) is ignored.
// REST responses from `/api/printer` and `/api/settings` are parsed here too
// so both paths produce the same `PrinterSnapshot`, along with the
// `/api/files` listing.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{
    CameraOrientation, JobProgress, PrinterFlags, PrinterSnapshot, TemperatureReading,
};

use crate::command::FileOrigin;

/// A decoded realtime frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connected { version: Option<String> },
    Current(PrinterSnapshot),
    History(PrinterSnapshot),
    Event { kind: String, payload: Value },
    Plugin { plugin: String, data: Value },
}

/// Decode one realtime frame.
///
/// Returns `Ok(None)` for well-formed frames with an unknown discriminator
/// and `Err(Protocol)` for anything that is not a JSON object or whose known
/// payload does not match the expected shape.
pub fn parse_envelope(text: &str) -> Result<Option<Inbound>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PrintlinkError::Protocol(format!("frame is not JSON: {e}")))?;
    let Value::Object(map) = value else {
        return Err(PrintlinkError::Protocol("frame is not a JSON object".into()));
    };

    for (key, payload) in map {
        let inbound = match key.as_str() {
            "connected" => {
                let wire: ConnectedWire = decode(payload, "connected")?;
                Inbound::Connected {
                    version: wire.version,
                }
            }
            "current" => Inbound::Current(decode::<StatePushWire>(payload, "current")?.into()),
            "history" => Inbound::History(decode::<StatePushWire>(payload, "history")?.into()),
            "event" => {
                let wire: EventWire = decode(payload, "event")?;
                Inbound::Event {
                    kind: wire.kind,
                    payload: wire.payload.unwrap_or(Value::Null),
                }
            }
            "plugin" => {
                let wire: PluginWire = decode(payload, "plugin")?;
                Inbound::Plugin {
                    plugin: wire.plugin,
                    data: wire.data.unwrap_or(Value::Null),
                }
            }
            _ => continue,
        };
        return Ok(Some(inbound));
    }
    Ok(None)
}

/// Message sent right after the socket opens to request a push rate.
/// OctoPrint pushes every `0.5s * throttle`.
pub fn throttle_message(throttle: u32) -> String {
    serde_json::json!({ "throttle": throttle.max(1) }).to_string()
}

fn decode<T: for<'de> Deserialize<'de>>(payload: Value, what: &str) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| PrintlinkError::Protocol(format!("malformed '{what}' payload: {e}")))
}

// ---------------------------------------------------------------------------
// Wire structs (realtime)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConnectedWire {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    #[serde(rename = "type")]
    kind: String,
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PluginWire {
    plugin: String,
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StatePushWire {
    #[serde(default)]
    state: StateWire,
    #[serde(default)]
    job: JobWire,
    #[serde(default)]
    progress: ProgressWire,
    /// Newest sample last; each entry maps sensor name to a reading plus `time`.
    #[serde(default)]
    temps: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct StateWire {
    #[serde(default)]
    text: String,
    #[serde(default)]
    flags: FlagsWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagsWire {
    #[serde(default)]
    operational: bool,
    #[serde(default)]
    printing: bool,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    pausing: bool,
    #[serde(default)]
    cancelling: bool,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    closed_or_error: bool,
    #[serde(default)]
    sd_ready: bool,
}

impl From<FlagsWire> for PrinterFlags {
    fn from(w: FlagsWire) -> Self {
        Self {
            operational: w.operational,
            printing: w.printing,
            paused: w.paused,
            pausing: w.pausing,
            cancelling: w.cancelling,
            ready: w.ready,
            error: w.error,
            closed_or_error: w.closed_or_error,
            sd_ready: w.sd_ready,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobWire {
    #[serde(default)]
    file: JobFileWire,
}

#[derive(Debug, Default, Deserialize)]
struct JobFileWire {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressWire {
    completion: Option<f64>,
    print_time: Option<f64>,
    print_time_left: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReadingWire {
    actual: Option<f64>,
    target: Option<f64>,
}

impl From<StatePushWire> for PrinterSnapshot {
    fn from(w: StatePushWire) -> Self {
        let temperatures = w
            .temps
            .into_iter()
            .last()
            .map(readings_from_map)
            .unwrap_or_default();

        Self {
            state_text: w.state.text,
            flags: w.state.flags.into(),
            temperatures,
            job: job_progress(w.job.file.name, w.progress),
        }
    }
}

fn job_progress(file_name: Option<String>, progress: ProgressWire) -> JobProgress {
    JobProgress {
        file_name,
        completion: progress.completion,
        print_time: progress.print_time.map(seconds),
        print_time_left: progress.print_time_left.map(seconds),
    }
}

fn seconds(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// Sensor readings from a `{"tool0": {...}, "bed": {...}, "time": 123}` map.
/// Entries that are not readings (like `time`) are skipped.
fn readings_from_map(map: BTreeMap<String, Value>) -> Vec<TemperatureReading> {
    map.into_iter()
        .filter_map(|(sensor, value)| {
            if !value.is_object() {
                return None;
            }
            let reading: ReadingWire = serde_json::from_value(value).ok()?;
            Some(TemperatureReading {
                sensor,
                actual: reading.actual,
                target: reading.target,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// REST responses
// ---------------------------------------------------------------------------

/// Parsed `GET /api/printer` response.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterStateReport {
    pub snapshot: PrinterSnapshot,
    /// `Some(true)` when the server included its SD section, which it only
    /// does when SD support is enabled.
    pub sd_support: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PrinterStateWire {
    #[serde(default)]
    state: StateWire,
    #[serde(default)]
    temperature: BTreeMap<String, Value>,
    sd: Option<Value>,
}

pub fn parse_printer_state(body: &str) -> Result<PrinterStateReport> {
    let wire: PrinterStateWire = serde_json::from_str(body)
        .map_err(|e| PrintlinkError::Protocol(format!("malformed printer state: {e}")))?;
    Ok(PrinterStateReport {
        sd_support: wire.sd.as_ref().map(|_| true),
        snapshot: PrinterSnapshot {
            state_text: wire.state.text,
            flags: wire.state.flags.into(),
            temperatures: readings_from_map(wire.temperature),
            job: JobProgress::default(),
        },
    })
}

/// Parsed `GET /api/job` response.
pub fn parse_job(body: &str) -> Result<JobProgress> {
    #[derive(Deserialize)]
    struct JobResponseWire {
        #[serde(default)]
        job: JobWire,
        #[serde(default)]
        progress: ProgressWire,
    }

    let wire: JobResponseWire = serde_json::from_str(body)
        .map_err(|e| PrintlinkError::Protocol(format!("malformed job: {e}")))?;
    Ok(job_progress(wire.job.file.name, wire.progress))
}

/// The subset of `GET /api/settings` the registry mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub sd_support: bool,
    pub camera_orientation: CameraOrientation,
}

pub fn parse_settings(body: &str) -> Result<ServerSettings> {
    #[derive(Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FeatureWire {
        #[serde(default)]
        sd_support: bool,
    }

    #[derive(Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WebcamWire {
        #[serde(default, rename = "flipH")]
        flip_h: bool,
        #[serde(default, rename = "flipV")]
        flip_v: bool,
        #[serde(default, rename = "rotate90")]
        rotate_90: bool,
    }

    #[derive(Deserialize)]
    struct SettingsWire {
        #[serde(default)]
        feature: FeatureWire,
        #[serde(default)]
        webcam: WebcamWire,
    }

    let wire: SettingsWire = serde_json::from_str(body)
        .map_err(|e| PrintlinkError::Protocol(format!("malformed settings: {e}")))?;
    Ok(ServerSettings {
        sd_support: wire.feature.sd_support,
        camera_orientation: CameraOrientation::from_webcam_settings(
            wire.webcam.flip_h,
            wire.webcam.flip_v,
            wire.webcam.rotate_90,
        ),
    })
}

/// One node of the `GET /api/files?recursive=true` tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the origin root, as used by print/delete.
    pub path: String,
    pub origin: FileOrigin,
    pub is_folder: bool,
    pub size: Option<u64>,
    /// Upload time, seconds since the epoch.
    pub date: Option<i64>,
    pub children: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct FileWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    children: Vec<FileWire>,
}

impl FileWire {
    fn into_entry(self) -> Option<FileEntry> {
        let path = self.path.unwrap_or_else(|| self.name.clone());
        if is_trashed(&path) {
            return None;
        }
        Some(FileEntry {
            origin: match self.origin.as_deref() {
                Some("sdcard") => FileOrigin::Sdcard,
                _ => FileOrigin::Local,
            },
            is_folder: self.kind.as_deref() == Some("folder"),
            size: self.size,
            date: self.date,
            children: self
                .children
                .into_iter()
                .filter_map(FileWire::into_entry)
                .collect(),
            name: self.name,
            path,
        })
    }
}

/// Files moved to a desktop trash on the server show up as
/// `trash-<user>~1/...`; they are not printable.
fn is_trashed(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("trash") else {
        return false;
    };
    let Some((owner, file)) = rest.split_once("~1/") else {
        return false;
    };
    !owner.is_empty()
        && !file.is_empty()
        && owner
            .chars()
            .all(|c| c == '-' || c == '_' || c.is_alphanumeric())
}

pub fn parse_files(body: &str) -> Result<Vec<FileEntry>> {
    #[derive(Deserialize)]
    struct FilesWire {
        #[serde(default)]
        files: Vec<FileWire>,
    }

    let wire: FilesWire = serde_json::from_str(body)
        .map_err(|e| PrintlinkError::Protocol(format!("malformed file listing: {e}")))?;
    Ok(wire.files.into_iter().filter_map(FileWire::into_entry).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURRENT: &str = r#"{
        "current": {
            "state": {"text": "Printing", "flags": {"operational": true, "printing": true, "sdReady": true}},
            "job": {"file": {"name": "benchy.gcode"}},
            "progress": {"completion": 42.5, "printTime": 600.4, "printTimeLeft": 900},
            "temps": [
                {"time": 1, "tool0": {"actual": 150.0, "target": 210.0}},
                {"time": 2, "tool0": {"actual": 205.1, "target": 210.0}, "bed": {"actual": 59.8, "target": 60.0}}
            ]
        }
    }"#;

    #[test]
    fn current_frame_is_normalized() {
        let Some(Inbound::Current(snapshot)) = parse_envelope(CURRENT).expect("parse") else {
            panic!("expected current frame");
        };
        assert_eq!(snapshot.state_text, "Printing");
        assert!(snapshot.flags.printing && snapshot.flags.sd_ready);
        assert_eq!(snapshot.job.file_name.as_deref(), Some("benchy.gcode"));
        assert_eq!(snapshot.job.print_time, Some(600));
        // Only the newest sample is kept; `time` is not a sensor.
        assert_eq!(snapshot.temperatures.len(), 2);
        assert_eq!(snapshot.temperature("bed").and_then(|t| t.actual), Some(59.8));
        assert_eq!(snapshot.temperature("tool").and_then(|t| t.actual), Some(205.1));
    }

    #[test]
    fn connected_frame_carries_version() {
        let frame = r#"{"connected": {"version": "1.9.3", "api_version": "0.1"}}"#;
        assert_eq!(
            parse_envelope(frame).expect("parse"),
            Some(Inbound::Connected {
                version: Some("1.9.3".into())
            })
        );
    }

    #[test]
    fn event_frame_keeps_payload() {
        let frame = r#"{"event": {"type": "PrintDone", "payload": {"name": "a.gcode"}}}"#;
        let Some(Inbound::Event { kind, payload }) = parse_envelope(frame).expect("parse") else {
            panic!("expected event");
        };
        assert_eq!(kind, "PrintDone");
        assert_eq!(payload["name"], "a.gcode");
    }

    #[test]
    fn unknown_discriminator_is_ignored() {
        let frame = r#"{"slicingProgress": {"progress": 10}}"#;
        assert_eq!(parse_envelope(frame).expect("parse"), None);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            parse_envelope("not json"),
            Err(PrintlinkError::Protocol(_))
        ));
        assert!(matches!(
            parse_envelope("[1, 2]"),
            Err(PrintlinkError::Protocol(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"event": {"payload": {}}}"#),
            Err(PrintlinkError::Protocol(_))
        ));
    }

    #[test]
    fn printer_state_reports_sd_section() {
        let body = r#"{
            "state": {"text": "Operational", "flags": {"operational": true, "ready": true}},
            "temperature": {"tool0": {"actual": 21.0, "target": 0.0}},
            "sd": {"ready": false}
        }"#;
        let report = parse_printer_state(body).expect("parse");
        assert_eq!(report.sd_support, Some(true));
        assert!(report.snapshot.flags.ready);
        assert_eq!(report.snapshot.temperatures.len(), 1);

        let without_sd = r#"{"state": {"text": "Operational", "flags": {}}}"#;
        assert_eq!(parse_printer_state(without_sd).expect("parse").sd_support, None);
    }

    #[test]
    fn settings_map_webcam_flags() {
        let body = r#"{"feature": {"sdSupport": true}, "webcam": {"flipH": true, "flipV": false, "rotate90": true}}"#;
        let settings = parse_settings(body).expect("parse");
        assert!(settings.sd_support);
        assert_eq!(settings.camera_orientation, CameraOrientation::LeftMirrored);
    }

    #[test]
    fn throttle_never_zero() {
        assert_eq!(throttle_message(0), r#"{"throttle":1}"#);
        assert_eq!(throttle_message(4), r#"{"throttle":4}"#);
    }

    #[test]
    fn file_listing_keeps_tree_and_drops_trash() {
        let body = r#"{"files": [
            {"name": "parts", "path": "parts", "origin": "local", "type": "folder", "children": [
                {"name": "gear.gcode", "path": "parts/gear.gcode", "origin": "local",
                 "type": "machinecode", "size": 1024, "date": 1700000000}
            ]},
            {"name": "old.gcode", "path": "trash-jane~1/old.gcode", "origin": "local", "type": "machinecode"},
            {"name": "BENCHY.GCO", "path": "BENCHY.GCO", "origin": "sdcard", "type": "machinecode"}
        ], "free": 1000}"#;
        let files = parse_files(body).expect("parse");
        assert_eq!(files.len(), 2);

        let folder = &files[0];
        assert!(folder.is_folder);
        assert_eq!(folder.children.len(), 1);
        assert_eq!(folder.children[0].path, "parts/gear.gcode");
        assert_eq!(folder.children[0].size, Some(1024));

        assert_eq!(files[1].origin, FileOrigin::Sdcard);
        assert!(!files[1].is_folder);
    }

    #[test]
    fn trash_detection_needs_owner_and_file() {
        assert!(is_trashed("trash-1000~1/a.gcode"));
        assert!(!is_trashed("trash~1/a.gcode"));
        assert!(!is_trashed("trash-1000~1/"));
        assert!(!is_trashed("trashcan.gcode"));
        assert!(!is_trashed("parts/trash-1000~1/a.gcode"));
    }
}
