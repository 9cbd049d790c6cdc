//! Tunnel configuration file store
//!
//! Owns the on-disk WireGuard configuration. Every read-modify-write happens
//! under an advisory exclusive lock, every rewrite goes through a same-
//! directory temp file renamed over the target, and a `.conf.bak` sibling is
//! written before each rewrite so a failed kernel sync can be rolled back.

use crate::error::{ConsoleError, Result};
use crate::wireguard::WgBackend;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One `[Peer]` section of the configuration file
#[derive(Debug, Clone)]
pub struct PeerSection {
    /// The section text exactly as it appears in the file
    pub raw: String,
    /// The `PublicKey` value, when present
    pub public_key: Option<String>,
    /// The `AllowedIPs` value, when present
    pub allowed_ips: Option<String>,
}

/// Parsed configuration: one interface block plus peer sections
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    /// The `[Interface]` section, empty when it could not be located
    pub interface: String,
    /// All `[Peer]` sections in file order
    pub peers: Vec<PeerSection>,
}

/// Advisory exclusive lock on the configuration file descriptor.
/// Released on drop, on every exit path.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ConsoleError::ConfigMissing(path.display().to_string())
                }
                _ => ConsoleError::Io(e),
            })?;

        // Blocks until the competing writer releases; no spinning.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(ConsoleError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Store owning the tunnel configuration file
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the given configuration path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the owned configuration file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current configuration text
    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Err(ConsoleError::ConfigMissing(self.path.display().to_string()));
        }
        Ok(std::fs::read_to_string(&self.path)?)
    }

    /// Run `f` while holding the advisory exclusive lock
    pub fn with_exclusive_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _lock = FileLock::acquire(&self.path)?;
        f()
    }

    /// Substring check for a peer key in the current file
    pub fn peer_exists(&self, public_key: &str) -> bool {
        match self.read() {
            Ok(content) => content.contains(public_key),
            Err(_) => false,
        }
    }

    /// Extract the server's private key from the interface block
    pub fn server_private_key(&self) -> Result<String> {
        let content = self.read()?;
        let parsed = parse_sections(&content);
        section_value(&parsed.interface, "PrivateKey").ok_or_else(|| {
            ConsoleError::ConfigCorrupt("no PrivateKey in the interface block".to_string())
        })
    }

    /// Rewrite the file atomically: same-directory temp file, mode 0600,
    /// fsync, rename over the target. The temp file never survives a failure.
    pub fn write_atomic(&self, text: &str) -> Result<()> {
        let dir = self.path.parent().ok_or_else(|| {
            ConsoleError::Config(format!("{} has no parent directory", self.path.display()))
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(".wg-console.")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(text.as_bytes())?;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| ConsoleError::Io(e.error))?;
        Ok(())
    }

    /// Copy the current file to its `.conf.bak` sibling
    fn write_backup(&self) -> Result<PathBuf> {
        let backup = self.path.with_extension("conf.bak");
        std::fs::copy(&self.path, &backup)?;
        Ok(backup)
    }

    fn restore_backup(&self) -> Result<()> {
        let backup = self.path.with_extension("conf.bak");
        let content = std::fs::read_to_string(&backup)?;
        self.write_atomic(&content)
    }

    /// Append a `[Peer]` section and sync the kernel.
    ///
    /// The file write lands before the kernel sync so the file stays the
    /// durable record if sync fails; on sync failure the backup is restored
    /// and re-synced before the error surfaces.
    pub async fn add_peer(
        &self,
        kernel: &dyn WgBackend,
        public_key: &str,
        address: Ipv4Addr,
        comment: Option<&str>,
    ) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;

        let content = self.read()?;
        if content.contains(public_key) {
            return Err(ConsoleError::Conflict(
                "public key already present in config".to_string(),
            ));
        }

        self.write_backup()?;

        let mut block = String::from("[Peer]\n");
        if let Some(comment) = comment {
            block.push_str(&format!("# {}\n", comment));
        }
        block.push_str(&format!(
            "PublicKey = {}\nAllowedIPs = {}/32",
            public_key, address
        ));

        let new_content = format!("{}\n\n{}\n", content.trim_end(), block);
        self.write_atomic(&new_content)?;

        if let Err(e) = kernel.sync_config(&self.path).await {
            warn!("Kernel sync failed after peer add, rolling back: {}", e);
            self.restore_backup()?;
            if let Err(resync) = kernel.sync_config(&self.path).await {
                warn!("Re-sync after rollback failed: {}", resync);
            }
            return Err(ConsoleError::ReloadFailed(e.to_string()));
        }
        Ok(())
    }

    /// Remove a peer from kernel and file.
    ///
    /// Kernel removal is issued first so no zombie survives even if the file
    /// rewrite races a competing writer. Removing an absent peer succeeds.
    pub async fn remove_peer(&self, kernel: &dyn WgBackend, public_key: &str) -> Result<()> {
        kernel.remove_peer(public_key).await?;

        let _lock = FileLock::acquire(&self.path)?;

        let content = self.read()?;
        if !content.contains(public_key) {
            debug!("Peer not in config, nothing to remove");
            return Ok(());
        }

        let parsed = parse_sections(&content);
        let kept: Vec<&PeerSection> = parsed
            .peers
            .iter()
            .filter(|p| p.public_key.as_deref() != Some(public_key))
            .collect();
        if kept.len() == parsed.peers.len() {
            // Key text matched a comment or an allowed-ips line, not a peer.
            return Ok(());
        }

        self.write_backup()?;

        let sections: Vec<&str> = kept.iter().map(|p| p.raw.as_str()).collect();
        let new_content = render_config(&parsed.interface, &sections);
        self.write_atomic(&new_content)?;

        if let Err(e) = kernel.sync_config(&self.path).await {
            warn!("Kernel sync failed after peer removal, rolling back: {}", e);
            self.restore_backup()?;
            if let Err(resync) = kernel.sync_config(&self.path).await {
                warn!("Re-sync after rollback failed: {}", resync);
            }
            return Err(ConsoleError::ReloadFailed(e.to_string()));
        }
        Ok(())
    }

    /// Rebuild the whole file: current interface block plus one section per
    /// given peer. Reconciler-only; refuses when the interface block cannot
    /// be located rather than risking corruption.
    pub fn rewrite_full(&self, peers: &[(String, Ipv4Addr, Option<String>)]) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;

        let content = self.read()?;
        let parsed = parse_sections(&content);
        if parsed.interface.is_empty() {
            return Err(ConsoleError::ConfigCorrupt(
                "interface block not found, refusing to rewrite".to_string(),
            ));
        }

        self.write_backup()?;

        let sections: Vec<String> = peers
            .iter()
            .map(|(public_key, address, comment)| {
                let mut block = String::from("[Peer]\n");
                if let Some(comment) = comment {
                    block.push_str(&format!("# {}\n", comment));
                }
                block.push_str(&format!(
                    "PublicKey = {}\nAllowedIPs = {}/32",
                    public_key, address
                ));
                block
            })
            .collect();
        let section_refs: Vec<&str> = sections.iter().map(String::as_str).collect();
        self.write_atomic(&render_config(&parsed.interface, &section_refs))
    }
}

/// Split configuration text into the interface block and peer sections,
/// preserving the original spacing inside each section.
pub fn parse_sections(content: &str) -> ParsedConfig {
    let mut interface = String::new();
    let mut peers = Vec::new();
    let mut current: Option<(bool, Vec<&str>)> = None;

    let mut flush = |section: Option<(bool, Vec<&str>)>,
                     interface: &mut String,
                     peers: &mut Vec<PeerSection>| {
        if let Some((is_interface, lines)) = section {
            let raw = lines.join("\n").trim_end().to_string();
            if is_interface {
                *interface = raw;
            } else {
                let public_key = section_value(&raw, "PublicKey");
                let allowed_ips = section_value(&raw, "AllowedIPs");
                peers.push(PeerSection {
                    raw,
                    public_key,
                    allowed_ips,
                });
            }
        }
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("[Interface]") {
            flush(current.take(), &mut interface, &mut peers);
            current = Some((true, vec![line]));
        } else if trimmed.starts_with("[Peer]") {
            flush(current.take(), &mut interface, &mut peers);
            current = Some((false, vec![line]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    flush(current, &mut interface, &mut peers);

    ParsedConfig { interface, peers }
}

/// Deterministically concatenate interface block and peer sections,
/// separated by blank lines and terminated with a newline.
pub fn render_config(interface: &str, peers: &[&str]) -> String {
    let mut parts = vec![interface.trim()];
    parts.extend(peers.iter().map(|p| p.trim()));
    let mut out = parts.join("\n\n");
    out.push('\n');
    out
}

/// Scan a section for `Key = value` and return the value
fn section_value(section: &str, key: &str) -> Option<String> {
    for line in section.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            if name.trim() == key {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}
