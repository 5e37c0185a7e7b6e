//! SQLite-backed run state persistence.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use super::{Interaction, RunState, RunStatus, Suspension};

/// A collected payload kept for trend rendering.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub payload: Value,
    pub collected_at: DateTime<Utc>,
}

/// The single source of truth for run status.
///
/// Writes are always whole-record replacements — a reader never observes a
/// torn record. The connection mutex serializes writes per source.
///
/// # Schema
/// ```sql
/// CREATE TABLE run_state (
///     source_id   TEXT PRIMARY KEY,
///     status      TEXT NOT NULL,
///     message     TEXT,
///     interaction TEXT,  -- JSON Interaction
///     payload     TEXT,  -- JSON last collected payload
///     suspension  TEXT,  -- JSON Suspension snapshot
///     updated_at  TEXT NOT NULL
/// );
/// CREATE TABLE run_history (
///     id           INTEGER PRIMARY KEY,
///     source_id    TEXT NOT NULL,
///     payload      TEXT NOT NULL,
///     collected_at TEXT NOT NULL
/// );
/// ```
pub struct RunStateStore {
    conn: Mutex<Connection>,
}

impl RunStateStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open state database")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS run_state (
                source_id   TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                message     TEXT,
                interaction TEXT,
                payload     TEXT,
                suspension  TEXT,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_history (
                id           INTEGER PRIMARY KEY,
                source_id    TEXT NOT NULL,
                payload      TEXT NOT NULL,
                collected_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_source
                ON run_history(source_id, collected_at);
            "#,
        )
        .context("failed to create state tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replaces the whole record for `state.source_id`. A `None` suspension
    /// clears any stored snapshot.
    pub fn set(&self, state: &RunState, suspension: Option<&Suspension>) -> Result<()> {
        let interaction = state
            .pending_interaction
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize interaction")?;
        let payload = state
            .last_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize payload")?;
        let suspension = suspension
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize suspension snapshot")?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT OR REPLACE INTO run_state
                    (source_id, status, message, interaction, payload, suspension, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    state.source_id,
                    state.status.as_str(),
                    state.message,
                    interaction,
                    payload,
                    suspension,
                    state.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to write run state")?;
        Ok(())
    }

    /// The current record for a source, if one was ever written.
    pub fn get(&self, source_id: &str) -> Result<Option<RunState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT status, message, interaction, payload, updated_at
                FROM run_state WHERE source_id = ?1
                "#,
            )
            .context("failed to prepare state lookup")?;
        let mut rows = stmt
            .query(params![source_id])
            .context("failed to query run state")?;

        let Some(row) = rows.next().context("failed to read state row")? else {
            return Ok(None);
        };

        let status: String = row.get(0)?;
        let status = parse_status(&status)?;
        let message: Option<String> = row.get(1)?;
        let interaction: Option<String> = row.get(2)?;
        let pending_interaction: Option<Interaction> = interaction
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("failed to parse stored interaction")?;
        let payload: Option<String> = row.get(3)?;
        let last_payload: Option<Value> = payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("failed to parse stored payload")?;
        let updated_at: String = row.get(4)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .context("failed to parse updated_at")?
            .with_timezone(&Utc);

        Ok(Some(RunState {
            source_id: source_id.to_string(),
            status,
            message,
            pending_interaction,
            last_payload,
            updated_at,
        }))
    }

    /// The suspension snapshot for a source, if it is currently suspended.
    pub fn suspension(&self, source_id: &str) -> Result<Option<Suspension>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT suspension FROM run_state WHERE source_id = ?1")
            .context("failed to prepare suspension lookup")?;
        let raw: Option<Option<String>> = stmt
            .query_row(params![source_id], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to query suspension")?;
        raw.flatten()
            .map(|s| serde_json::from_str(&s).context("failed to parse suspension snapshot"))
            .transpose()
    }

    /// Appends a successfully collected payload to the history trail.
    pub fn append_history(&self, source_id: &str, payload: &Value) -> Result<()> {
        let raw = serde_json::to_string(payload).context("failed to serialize history payload")?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO run_history (source_id, payload, collected_at) VALUES (?1, ?2, ?3)",
                params![source_id, raw, Utc::now().to_rfc3339()],
            )
            .context("failed to append history")?;
        Ok(())
    }

    /// Most recent history records, newest first.
    pub fn history(&self, source_id: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT payload, collected_at FROM run_history
                WHERE source_id = ?1 ORDER BY collected_at DESC, id DESC LIMIT ?2
                "#,
            )
            .context("failed to prepare history query")?;
        let rows = stmt
            .query_map(params![source_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query history")?;

        let mut records = Vec::new();
        for row in rows {
            let (payload, collected_at) = row.context("failed to read history row")?;
            records.push(HistoryRecord {
                payload: serde_json::from_str(&payload).context("failed to parse history payload")?,
                collected_at: DateTime::parse_from_rfc3339(&collected_at)
                    .context("failed to parse history timestamp")?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }

    /// Flags a source as needing a refresh after a configuration edit. The
    /// stale interaction and snapshot are discarded; the next fresh run
    /// starts from step 0.
    pub fn mark_config_changed(&self, source_id: &str) -> Result<()> {
        let mut state = self
            .get(source_id)?
            .unwrap_or_else(|| RunState::new(source_id, RunStatus::ConfigChanged));
        state.status = RunStatus::ConfigChanged;
        state.message = Some("Configuration changed, needs refresh".to_string());
        state.pending_interaction = None;
        state.updated_at = Utc::now();
        self.set(&state, None)
    }

    /// Cascade deletion when the source itself is removed.
    pub fn delete(&self, source_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM run_state WHERE source_id = ?1", params![source_id])
            .context("failed to delete run state")?;
        conn.execute(
            "DELETE FROM run_history WHERE source_id = ?1",
            params![source_id],
        )
        .context("failed to delete run history")?;
        Ok(())
    }
}

fn parse_status(raw: &str) -> Result<RunStatus> {
    match raw {
        "active" => Ok(RunStatus::Active),
        "suspended" => Ok(RunStatus::Suspended),
        "error" => Ok(RunStatus::Error),
        "config_changed" => Ok(RunStatus::ConfigChanged),
        other => anyhow::bail!("unknown run status in database: {other}"),
    }
}
