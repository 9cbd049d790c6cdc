//! Derived session history
//!
//! Sessions are telemetry, not authority: each row records one logical
//! connection interval derived from handshake liveness. Losing them is
//! non-fatal, so writes here never abort the poller.

use super::Registry;
use crate::error::Result;
use rusqlite::{params, Row};
use serde::Serialize;

/// One logical connection interval
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Row id
    pub id: i64,
    /// Owning peer row id
    pub peer_id: i64,
    /// Public key snapshot at session start
    pub public_key: String,
    /// Unix start time
    pub start_time: u64,
    /// Unix end time; `None` while open
    pub end_time: Option<u64>,
    /// Remote endpoint observed at start
    pub endpoint: Option<String>,
    /// Bytes received during this session
    pub bytes_rx: u64,
    /// Bytes transmitted during this session
    pub bytes_tx: u64,
    /// Whether the session is still open
    pub is_active: bool,
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let start_time: i64 = row.get(3)?;
    let end_time: Option<i64> = row.get(4)?;
    let bytes_rx: i64 = row.get(6)?;
    let bytes_tx: i64 = row.get(7)?;
    let is_active: i64 = row.get(8)?;

    Ok(SessionRecord {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        public_key: row.get(2)?,
        start_time: start_time.max(0) as u64,
        end_time: end_time.map(|v| v.max(0) as u64),
        endpoint: row.get(5)?,
        bytes_rx: bytes_rx.max(0) as u64,
        bytes_tx: bytes_tx.max(0) as u64,
        is_active: is_active != 0,
    })
}

const SESSION_COLUMNS: &str =
    "id, peer_id, public_key, start_time, end_time, endpoint, bytes_rx, bytes_tx, is_active";

impl Registry {
    /// Open a new session and return its id
    pub fn open_session(
        &self,
        peer_id: i64,
        public_key: &str,
        start_time: u64,
        endpoint: Option<&str>,
        bytes_rx: u64,
        bytes_tx: u64,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (peer_id, public_key, start_time, endpoint, bytes_rx, bytes_tx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                peer_id,
                public_key,
                start_time as i64,
                endpoint,
                bytes_rx as i64,
                bytes_tx as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Charge per-tick byte deltas onto an open session
    pub fn charge_session(
        &self,
        session_id: i64,
        delta_rx: u64,
        delta_tx: u64,
        endpoint: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET
                bytes_rx = bytes_rx + ?1,
                bytes_tx = bytes_tx + ?2,
                endpoint = COALESCE(?3, endpoint)
             WHERE id = ?4 AND is_active = 1",
            params![delta_rx as i64, delta_tx as i64, endpoint, session_id],
        )?;
        Ok(())
    }

    /// Close an open session
    pub fn close_session(&self, session_id: i64, end_time: u64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET is_active = 0, end_time = ?1 WHERE id = ?2 AND is_active = 1",
            params![end_time as i64, session_id],
        )?;
        Ok(())
    }

    /// Close every session left open by a previous run. The in-memory
    /// session map dies with the process, so anything still marked active
    /// at boot is stale by definition.
    pub fn close_stale_sessions(&self, end_time: u64) -> Result<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET is_active = 0, end_time = ?1 WHERE is_active = 1",
            params![end_time as i64],
        )?;
        Ok(changed)
    }

    /// Session history for one peer, newest first
    pub fn sessions_for_peer(&self, peer_id: i64, limit: u32) -> Result<Vec<SessionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE peer_id = ?1 ORDER BY start_time DESC, id DESC LIMIT ?2",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![peer_id, limit], session_from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Number of currently open sessions (telemetry introspection)
    pub fn open_session_count(&self) -> Result<u32> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions WHERE is_active = 1", [], |r| {
                r.get(0)
            })?;
        Ok(count.max(0) as u32)
    }
}
