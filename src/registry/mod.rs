//! Durable registry
//!
//! SQLite-backed record of peers, derived sessions and the administrator.
//! The connection sits behind a mutex: the registry is the authoritative
//! plane and sees one writer at a time, which SQLite serializes cheaply at
//! this scale.

mod peers;
mod sessions;

pub use peers::{AclProfile, ClientOs, NewPeer, PeerRecord, PeerStatus};
pub use sessions::SessionRecord;

use crate::error::{ConsoleError, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared handle to the durable store
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
}

/// The single administrator row
#[derive(Debug, Clone)]
pub struct AdminRecord {
    /// Login name
    pub username: String,
    /// Credential hash produced by the external auth tooling
    pub password_hash: String,
    /// Optional second-factor shared secret
    pub totp_secret: Option<String>,
}

impl Registry {
    /// Open (or create) the registry at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the registry, retrying while the store comes up
    pub async fn open_with_retry(path: &Path, attempts: u32) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Self::open(path) {
                Ok(registry) => return Ok(registry),
                Err(e) => {
                    warn!(
                        "Waiting for registry (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ConsoleError::Registry("unreachable".to_string())))
    }

    /// In-memory registry for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Fetch the administrator row, if bootstrapped
    pub fn get_admin(&self) -> Result<Option<AdminRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT username, password_hash, totp_secret FROM admins WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(AdminRecord {
                username: row.get(0)?,
                password_hash: row.get(1)?,
                totp_secret: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert the administrator row on first boot; later boots are no-ops
    pub fn ensure_admin(&self, username: &str, password_hash: &str) -> Result<()> {
        let conn = self.lock();
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM admins", [], |r| r.get(0))?;
        if existing == 0 {
            conn.execute(
                "INSERT INTO admins (id, username, password_hash) VALUES (1, ?1, ?2)",
                rusqlite::params![username, password_hash],
            )?;
            info!("Bootstrapped administrator '{}'", username);
        }
        Ok(())
    }
}

/// Create tables and apply additive column migrations
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS admins (
            id INTEGER PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            totp_secret TEXT
        );
        CREATE TABLE IF NOT EXISTS peers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            handle TEXT UNIQUE NOT NULL,
            public_key TEXT UNIQUE NOT NULL,
            private_key TEXT,
            address TEXT UNIQUE NOT NULL,
            client_os TEXT NOT NULL DEFAULT 'android',
            status TEXT NOT NULL DEFAULT 'active',
            acl_profile TEXT NOT NULL DEFAULT 'full',
            total_rx INTEGER NOT NULL DEFAULT 0,
            total_tx INTEGER NOT NULL DEFAULT 0,
            last_handshake INTEGER,
            last_endpoint TEXT,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_id INTEGER NOT NULL,
            public_key TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            endpoint TEXT,
            bytes_rx INTEGER NOT NULL DEFAULT 0,
            bytes_tx INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_peer ON sessions (peer_id, start_time);",
    )?;

    // Columns added after the first release; older databases gain them here.
    for (column, ddl) in [
        ("last_endpoint", "ALTER TABLE peers ADD COLUMN last_endpoint TEXT"),
        ("private_key", "ALTER TABLE peers ADD COLUMN private_key TEXT"),
        (
            "acl_profile",
            "ALTER TABLE peers ADD COLUMN acl_profile TEXT NOT NULL DEFAULT 'full'",
        ),
    ] {
        if !column_exists(conn, "peers", column)? {
            info!("Registry migration: adding peers.{}", column);
            conn.execute(ddl, [])?;
        }
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
