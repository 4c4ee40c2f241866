// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SQLite persistence for printer targets.
//
// Three tables: `printers` (one row per target), `sync_state` (key/value,
// holds the cloud change token) and `pending_deletions` (tombstones for
// deletes the cloud has not acknowledged yet).  A partial unique index makes
// a second default row impossible at the storage level.
//
// All methods are synchronous because `rusqlite` is; callers serialize
// access through the registry's writer lock.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info, instrument};

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{
    CameraOrientation, ChangeToken, Credential, DeletionMarker, PrinterTarget, TargetId,
};

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS printers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        host TEXT NOT NULL,
        api_key TEXT NOT NULL,
        username TEXT,
        password TEXT,
        camera_orientation INTEGER NOT NULL DEFAULT 0,
        camera_aspect_16_9 INTEGER NOT NULL DEFAULT 0,
        color TEXT,
        sd_support INTEGER NOT NULL DEFAULT 0,
        is_default INTEGER NOT NULL DEFAULT 0,
        modified_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS printers_single_default
        ON printers (is_default) WHERE is_default = 1;
    CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pending_deletions (
        id TEXT PRIMARY KEY,
        deleted_at TEXT NOT NULL
    );
"#;

const SELECT_COLUMNS: &str = "SELECT id, name, host, api_key, username, password,
        camera_orientation, camera_aspect_16_9, color, sd_support, is_default, modified_at
     FROM printers";

const CHANGE_TOKEN_KEY: &str = "cloud_change_token";

/// Printer database.
pub struct RegistryStore {
    conn: Connection,
}

impl RegistryStore {
    /// Open (or create) the database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PrintlinkError::Database(format!("open: {e}")))?;

        // Readers (background refresh) must not block on the writer.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PrintlinkError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| PrintlinkError::Database(format!("create tables: {e}")))?;

        info!("printer database opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PrintlinkError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| PrintlinkError::Database(format!("create tables: {e}")))?;

        debug!("in-memory printer database opened");
        Ok(Self { conn })
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction()
            .map_err(|e| PrintlinkError::Database(format!("begin: {e}")))
    }

    pub fn load_all(&self) -> Result<Vec<PrinterTarget>> {
        load_all(&self.conn)
    }

    pub fn change_token(&self) -> Result<Option<ChangeToken>> {
        self.conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![CHANGE_TOKEN_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|value| value.map(ChangeToken))
            .map_err(|e| PrintlinkError::Database(format!("read change token: {e}")))
    }

    pub fn pending_deletions(&self) -> Result<Vec<DeletionMarker>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, deleted_at FROM pending_deletions ORDER BY deleted_at ASC")
            .map_err(|e| PrintlinkError::Database(format!("prepare pending_deletions: {e}")))?;

        let markers = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let deleted_at: String = row.get(1)?;
                Ok(DeletionMarker {
                    id: parse_id(0, &id)?,
                    deleted_at: parse_time(1, &deleted_at)?,
                })
            })
            .map_err(|e| PrintlinkError::Database(format!("query pending_deletions: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PrintlinkError::Database(format!("collect rows: {e}")))?;
        Ok(markers)
    }

    pub fn clear_pending_deletion(&self, id: TargetId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM pending_deletions WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| PrintlinkError::Database(format!("clear tombstone: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statements usable inside a transaction
// ---------------------------------------------------------------------------

pub fn load_all(conn: &Connection) -> Result<Vec<PrinterTarget>> {
    let mut stmt = conn
        .prepare(SELECT_COLUMNS)
        .map_err(|e| PrintlinkError::Database(format!("prepare load_all: {e}")))?;

    let mut targets = stmt
        .query_map([], row_to_target)
        .map_err(|e| PrintlinkError::Database(format!("query load_all: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PrintlinkError::Database(format!("collect rows: {e}")))?;

    targets.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Ok(targets)
}

pub fn get(conn: &Connection, id: TargetId) -> Result<Option<PrinterTarget>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE id = ?1"),
        params![id.to_string()],
        row_to_target,
    )
    .optional()
    .map_err(|e| PrintlinkError::Database(format!("get {id}: {e}")))
}

pub fn insert(conn: &Connection, target: &PrinterTarget) -> Result<()> {
    conn.execute(
        "INSERT INTO printers (id, name, host, api_key, username, password,
             camera_orientation, camera_aspect_16_9, color, sd_support, is_default, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
        params![
            target.id.to_string(),
            target.name,
            target.host,
            target.credential.api_key,
            target.credential.username,
            target.credential.password,
            target.camera_orientation.raw(),
            target.camera_aspect_16_9,
            target.color,
            target.sd_support,
            target.modified_at.to_rfc3339(),
        ],
    )
    .map_err(|e| PrintlinkError::Database(format!("insert printer: {e}")))?;
    Ok(())
}

/// Overwrite every mirrored column.  `is_default` is handled separately.
pub fn update(conn: &Connection, target: &PrinterTarget) -> Result<()> {
    let rows = conn
        .execute(
            "UPDATE printers SET name = ?2, host = ?3, api_key = ?4, username = ?5,
                 password = ?6, camera_orientation = ?7, camera_aspect_16_9 = ?8,
                 color = ?9, sd_support = ?10, modified_at = ?11
             WHERE id = ?1",
            params![
                target.id.to_string(),
                target.name,
                target.host,
                target.credential.api_key,
                target.credential.username,
                target.credential.password,
                target.camera_orientation.raw(),
                target.camera_aspect_16_9,
                target.color,
                target.sd_support,
                target.modified_at.to_rfc3339(),
            ],
        )
        .map_err(|e| PrintlinkError::Database(format!("update printer: {e}")))?;

    if rows == 0 {
        return Err(PrintlinkError::TargetNotFound(target.id));
    }
    Ok(())
}

/// Returns whether a row was removed.
pub fn delete(conn: &Connection, id: TargetId) -> Result<bool> {
    let rows = conn
        .execute("DELETE FROM printers WHERE id = ?1", params![id.to_string()])
        .map_err(|e| PrintlinkError::Database(format!("delete printer: {e}")))?;
    Ok(rows > 0)
}

/// Make `id` the only default row (or clear the default when `None`).
pub fn set_default(conn: &Connection, id: Option<TargetId>) -> Result<()> {
    conn.execute("UPDATE printers SET is_default = 0 WHERE is_default = 1", [])
        .map_err(|e| PrintlinkError::Database(format!("clear default: {e}")))?;
    if let Some(id) = id {
        let rows = conn
            .execute(
                "UPDATE printers SET is_default = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| PrintlinkError::Database(format!("set default: {e}")))?;
        if rows == 0 {
            return Err(PrintlinkError::TargetNotFound(id));
        }
    }
    Ok(())
}

pub fn set_change_token(conn: &Connection, token: Option<&ChangeToken>) -> Result<()> {
    match token {
        Some(token) => conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CHANGE_TOKEN_KEY, token.0],
        ),
        None => conn.execute(
            "DELETE FROM sync_state WHERE key = ?1",
            params![CHANGE_TOKEN_KEY],
        ),
    }
    .map_err(|e| PrintlinkError::Database(format!("write change token: {e}")))?;
    Ok(())
}

pub fn add_pending_deletion(conn: &Connection, marker: &DeletionMarker) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO pending_deletions (id, deleted_at) VALUES (?1, ?2)",
        params![marker.id.to_string(), marker.deleted_at.to_rfc3339()],
    )
    .map_err(|e| PrintlinkError::Database(format!("record tombstone: {e}")))?;
    Ok(())
}

pub fn remove_pending_deletion(conn: &Connection, id: TargetId) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_deletions WHERE id = ?1",
        params![id.to_string()],
    )
    .map_err(|e| PrintlinkError::Database(format!("clear tombstone: {e}")))?;
    Ok(())
}

/// Deletion time of an unacknowledged local delete of `id`.
pub fn pending_deletion(conn: &Connection, id: TargetId) -> Result<Option<DateTime<Utc>>> {
    let raw = conn
        .query_row(
            "SELECT deleted_at FROM pending_deletions WHERE id = ?1",
            params![id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| PrintlinkError::Database(format!("read tombstone: {e}")))?;
    raw.map(|value| {
        parse_time(0, &value).map_err(|e| PrintlinkError::Database(format!("tombstone time: {e}")))
    })
    .transpose()
}

pub fn commit(tx: Transaction<'_>) -> Result<()> {
    tx.commit()
        .map_err(|e| PrintlinkError::Database(format!("commit: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Column indices must match `SELECT_COLUMNS`.
fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrinterTarget> {
    let id: String = row.get(0)?;
    let orientation_raw: i64 = row.get(6)?;
    let modified_at: String = row.get(11)?;

    Ok(PrinterTarget {
        id: parse_id(0, &id)?,
        name: row.get(1)?,
        host: row.get(2)?,
        credential: Credential {
            api_key: row.get(3)?,
            username: row.get(4)?,
            password: row.get(5)?,
        },
        // Unknown raw values (written by a newer build) fall back to upright.
        camera_orientation: CameraOrientation::from_raw(orientation_raw).unwrap_or_default(),
        camera_aspect_16_9: row.get(7)?,
        color: row.get(8)?,
        sd_support: row.get(9)?,
        is_default: row.get(10)?,
        modified_at: parse_time(11, &modified_at)?,
    })
}

fn parse_id(column: usize, raw: &str) -> rusqlite::Result<TargetId> {
    raw.parse::<TargetId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}
