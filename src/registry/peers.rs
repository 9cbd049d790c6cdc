//! Peer records
//!
//! CRUD over the `peers` table plus the cumulative traffic counters the
//! telemetry poller charges. Counter updates are SQL-level additions so
//! concurrent writers cannot lose increments.

use super::Registry;
use crate::error::{ConsoleError, Result};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Client platform tag; drives client artifact rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientOs {
    /// Android (WireGuard app)
    Android,
    /// Linux (wg-quick)
    Linux,
    /// iOS (WireGuard app)
    Ios,
    /// Windows (WireGuard app)
    Windows,
    /// macOS (WireGuard app)
    Macos,
}

impl ClientOs {
    /// Wire form of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Linux => "linux",
            Self::Ios => "ios",
            Self::Windows => "windows",
            Self::Macos => "macos",
        }
    }
}

impl fmt::Display for ClientOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientOs {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "android" => Ok(Self::Android),
            "linux" => Ok(Self::Linux),
            "ios" => Ok(Self::Ios),
            "windows" => Ok(Self::Windows),
            "macos" => Ok(Self::Macos),
            other => Err(ConsoleError::Validation(format!(
                "unknown client OS '{}' (expected android, linux, ios, windows or macos)",
                other
            ))),
        }
    }
}

/// Access-control profile applied to a peer's tunnel address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AclProfile {
    /// Unrestricted forwarding
    Full,
    /// Internet reachable, RFC1918 ranges blocked
    InternetOnly,
    /// RFC1918 ranges reachable, internet blocked
    IntranetOnly,
}

impl AclProfile {
    /// Wire form of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::InternetOnly => "internet-only",
            Self::IntranetOnly => "intranet-only",
        }
    }
}

impl fmt::Display for AclProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AclProfile {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "internet-only" => Ok(Self::InternetOnly),
            "intranet-only" => Ok(Self::IntranetOnly),
            other => Err(ConsoleError::Validation(format!(
                "unknown ACL profile '{}' (expected full, internet-only or intranet-only)",
                other
            ))),
        }
    }
}

/// Peer lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Present in the tunnel file and the kernel
    Active,
    /// Known to the registry only
    Disabled,
}

impl PeerStatus {
    /// Wire form of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConsoleError::Validation(format!(
                "unknown peer status '{}'",
                other
            ))),
        }
    }
}

/// One row of the `peers` table
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    /// Row id
    pub id: i64,
    /// Unique human handle
    pub handle: String,
    /// Durable public key identifier
    pub public_key: String,
    /// Sealed private key blob, when stored
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    /// Assigned tunnel address
    pub address: Ipv4Addr,
    /// Client platform
    pub client_os: ClientOs,
    /// Lifecycle status
    pub status: PeerStatus,
    /// Access-control profile
    pub acl_profile: AclProfile,
    /// Cumulative bytes received, across daemon restarts
    pub total_rx: u64,
    /// Cumulative bytes transmitted, across daemon restarts
    pub total_tx: u64,
    /// Unix time of the most recent observed handshake
    pub last_handshake: Option<u64>,
    /// Most recent observed remote endpoint
    pub last_endpoint: Option<String>,
    /// Unix creation time
    pub created_at: u64,
}

/// Fields for a new peer row
#[derive(Debug)]
pub struct NewPeer<'a> {
    /// Unique human handle (already validated and case-folded)
    pub handle: &'a str,
    /// Public key
    pub public_key: &'a str,
    /// Sealed private key blob, when storage is enabled
    pub private_key: Option<&'a str>,
    /// Assigned tunnel address
    pub address: Ipv4Addr,
    /// Client platform
    pub client_os: ClientOs,
    /// Access-control profile
    pub acl_profile: AclProfile,
}

const PEER_COLUMNS: &str = "id, handle, public_key, private_key, address, client_os, status, \
     acl_profile, total_rx, total_tx, last_handshake, last_endpoint, created_at";

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    let address: String = row.get(4)?;
    let client_os: String = row.get(5)?;
    let status: String = row.get(6)?;
    let acl_profile: String = row.get(7)?;
    let total_rx: i64 = row.get(8)?;
    let total_tx: i64 = row.get(9)?;
    let last_handshake: Option<i64> = row.get(10)?;
    let created_at: i64 = row.get(12)?;

    Ok(PeerRecord {
        id: row.get(0)?,
        handle: row.get(1)?,
        public_key: row.get(2)?,
        private_key: row.get(3)?,
        address: address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
        client_os: client_os.parse().unwrap_or(ClientOs::Android),
        status: status.parse().unwrap_or(PeerStatus::Disabled),
        acl_profile: acl_profile.parse().unwrap_or(AclProfile::Full),
        total_rx: total_rx.max(0) as u64,
        total_tx: total_tx.max(0) as u64,
        last_handshake: last_handshake.map(|v| v.max(0) as u64),
        last_endpoint: row.get(11)?,
        created_at: created_at.max(0) as u64,
    })
}

impl Registry {
    /// Insert a new peer row
    pub fn create_peer(&self, peer: &NewPeer<'_>) -> Result<PeerRecord> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO peers (handle, public_key, private_key, address, client_os, acl_profile)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                peer.handle,
                peer.public_key,
                peer.private_key,
                peer.address.to_string(),
                peer.client_os.as_str(),
                peer.acl_profile.as_str(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ConsoleError::Conflict(format!(
                    "peer '{}' collides on handle, key or address",
                    peer.handle
                ))
            }
            other => other.into(),
        })?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE handle = ?1",
            PEER_COLUMNS
        ))?;
        let record = stmt.query_row([peer.handle], peer_from_row)?;
        Ok(record)
    }

    /// Fetch a peer by handle
    pub fn get_peer(&self, handle: &str) -> Result<Option<PeerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE handle = ?1",
            PEER_COLUMNS
        ))?;
        match stmt.query_row([handle], peer_from_row) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a peer by public key
    pub fn get_peer_by_key(&self, public_key: &str) -> Result<Option<PeerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE public_key = ?1",
            PEER_COLUMNS
        ))?;
        match stmt.query_row([public_key], peer_from_row) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All peers, newest first
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers ORDER BY created_at DESC, id DESC",
            PEER_COLUMNS
        ))?;
        let rows = stmt.query_map([], peer_from_row)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Active peers only, in insertion order (stable file layout)
    pub fn active_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE status = 'active' ORDER BY id",
            PEER_COLUMNS
        ))?;
        let rows = stmt.query_map([], peer_from_row)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Every assigned address, regardless of status
    pub fn used_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT address FROM peers")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut used = HashSet::new();
        for row in rows {
            if let Ok(addr) = row?.parse() {
                used.insert(addr);
            }
        }
        Ok(used)
    }

    /// Flip a peer's lifecycle status
    pub fn set_peer_status(&self, handle: &str, status: PeerStatus) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE peers SET status = ?1 WHERE handle = ?2",
            params![status.as_str(), handle],
        )?;
        if changed == 0 {
            return Err(ConsoleError::NotFound(format!("peer '{}'", handle)));
        }
        Ok(())
    }

    /// Overwrite both keys after a rotation
    pub fn update_peer_keys(
        &self,
        handle: &str,
        public_key: &str,
        sealed_private_key: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE peers SET public_key = ?1, private_key = ?2 WHERE handle = ?3",
            params![public_key, sealed_private_key, handle],
        )?;
        if changed == 0 {
            return Err(ConsoleError::NotFound(format!("peer '{}'", handle)));
        }
        Ok(())
    }

    /// Delete a peer row
    pub fn delete_peer(&self, handle: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM peers WHERE handle = ?1", params![handle])?;
        if changed == 0 {
            return Err(ConsoleError::NotFound(format!("peer '{}'", handle)));
        }
        Ok(())
    }

    /// Charge a traffic delta onto the cumulative totals and refresh the
    /// last-seen endpoint/handshake with the latest non-null observation.
    pub fn accumulate_traffic(
        &self,
        public_key: &str,
        delta_rx: u64,
        delta_tx: u64,
        endpoint: Option<&str>,
        handshake: Option<u64>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE peers SET
                total_rx = total_rx + ?1,
                total_tx = total_tx + ?2,
                last_endpoint = COALESCE(?3, last_endpoint),
                last_handshake = COALESCE(?4, last_handshake)
             WHERE public_key = ?5",
            params![
                delta_rx as i64,
                delta_tx as i64,
                endpoint,
                handshake.map(|v| v as i64),
                public_key
            ],
        )?;
        Ok(())
    }
}
