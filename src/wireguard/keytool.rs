//! Key tool adapter
//!
//! Thin wrapper over the WireGuard command-line utilities (`wg`, `wg-quick`).
//! Every operation shells out, so everything here is async and surfaces a
//! typed error carrying the tool's stderr on non-zero exit.

use crate::error::{ConsoleError, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

/// Deadline for key generation and peer mutations
const KEYTOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for read-only queries (dump)
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One peer row from `wg show <if> dump`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    /// Peer public key (base64)
    pub public_key: String,
    /// Last seen remote endpoint, `None` when the tool reports `(none)`
    pub endpoint: Option<String>,
    /// Unix time of the latest handshake, `None` when never handshaken
    pub latest_handshake: Option<u64>,
    /// Bytes received from this peer since interface start
    pub transfer_rx: u64,
    /// Bytes sent to this peer since interface start
    pub transfer_tx: u64,
}

/// Seam between the control plane and the running tunnel daemon.
///
/// The production implementation is [`WgTool`]; tests substitute mocks or
/// recording fakes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WgBackend: Send + Sync {
    /// Generate a fresh private key (`wg genkey`)
    async fn generate_private_key(&self) -> Result<Zeroizing<String>>;

    /// Derive the public key for a private key (`wg pubkey`)
    async fn derive_public_key(&self, private_key: &str) -> Result<String>;

    /// Dump the live peer table of the interface
    async fn dump_peers(&self) -> Result<Vec<PeerDump>>;

    /// Apply a stripped configuration file to the live interface
    /// (`wg-quick strip` + `wg syncconf`, zero downtime)
    async fn sync_config(&self, config_path: &Path) -> Result<()>;

    /// Remove a single peer from the kernel by key. Removing an absent
    /// peer succeeds.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Replay a batch of peers into the kernel in one `wg set` invocation
    async fn replay_peers(&self, peers: &[(String, Ipv4Addr)]) -> Result<()>;
}

/// Production key tool adapter invoking `wg`/`wg-quick`
pub struct WgTool {
    interface: String,
}

impl WgTool {
    /// Create an adapter bound to one tunnel interface
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    /// Run a command, optionally feeding stdin, returning trimmed stdout
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<String> {
        debug!("Executing command: {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ConsoleError::KeyTool(format!("Failed to execute {}: {}", program, e))
        })?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| ConsoleError::KeyTool("stdin pipe missing".to_string()))?;
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = match deadline {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    ConsoleError::Timeout(format!("{} {}", program, args.join(" ")))
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConsoleError::KeyTool(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WgBackend for WgTool {
    async fn generate_private_key(&self) -> Result<Zeroizing<String>> {
        let key = self
            .run("wg", &["genkey"], None, Some(KEYTOOL_TIMEOUT))
            .await?;
        Ok(Zeroizing::new(key))
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        self.run("wg", &["pubkey"], Some(private_key), Some(KEYTOOL_TIMEOUT))
            .await
    }

    async fn dump_peers(&self) -> Result<Vec<PeerDump>> {
        let stdout = self
            .run(
                "wg",
                &["show", &self.interface, "dump"],
                None,
                Some(QUERY_TIMEOUT),
            )
            .await?;
        Ok(parse_dump(&stdout))
    }

    async fn sync_config(&self, config_path: &Path) -> Result<()> {
        let path = config_path
            .to_str()
            .ok_or_else(|| ConsoleError::KeyTool("config path is not UTF-8".to_string()))?;
        let stripped = self
            .run("wg-quick", &["strip", path], None, Some(KEYTOOL_TIMEOUT))
            .await
            .map_err(|e| ConsoleError::ReloadFailed(format!("strip failed: {}", e)))?;

        let mut temp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut temp, stripped.as_bytes())?;
        std::io::Write::write_all(&mut temp, b"\n")?;
        let temp_path = temp
            .path()
            .to_str()
            .ok_or_else(|| ConsoleError::KeyTool("temp path is not UTF-8".to_string()))?
            .to_string();

        // Sync has no deadline: it must succeed or fail explicitly.
        self.run("wg", &["syncconf", &self.interface, &temp_path], None, None)
            .await
            .map_err(|e| ConsoleError::ReloadFailed(e.to_string()))?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.run(
            "wg",
            &["set", &self.interface, "peer", public_key, "remove"],
            None,
            Some(KEYTOOL_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn replay_peers(&self, peers: &[(String, Ipv4Addr)]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = vec!["set".to_string(), self.interface.clone()];
        for (public_key, address) in peers {
            args.push("peer".to_string());
            args.push(public_key.clone());
            args.push("allowed-ips".to_string());
            args.push(format!("{}/32", address));
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("wg", &arg_refs, None, Some(KEYTOOL_TIMEOUT)).await?;
        Ok(())
    }
}

/// Parse the tab-separated output of `wg show <if> dump`.
///
/// The first line describes the interface itself and is skipped. A `(none)`
/// endpoint and a `0` handshake timestamp both mean "never".
pub fn parse_dump(text: &str) -> Vec<PeerDump> {
    let mut peers = Vec::new();

    for line in text.lines().skip(1) {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 5 {
            continue;
        }

        let endpoint = match parts[2] {
            "(none)" | "" => None,
            other => Some(other.to_string()),
        };
        let latest_handshake = match parts[4].parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(ts) => Some(ts),
        };
        let transfer_rx = parts.get(5).and_then(|v| v.parse().ok()).unwrap_or(0);
        let transfer_tx = parts.get(6).and_then(|v| v.parse().ok()).unwrap_or(0);

        peers.push(PeerDump {
            public_key: parts[0].to_string(),
            endpoint,
            latest_handshake,
            transfer_rx,
            transfer_tx,
        });
    }

    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "privkey\tpubkey\t51820\toff\n\
        AbCdEf+klientkey1=\t(none)\t203.0.113.9:51111\t10.50.0.3/32\t1700000000\t1048576\t2097152\t25\n\
        ZyXwVu+klientkey2=\t(none)\t(none)\t10.50.0.4/32\t0\t0\t0\toff\n";

    #[test]
    fn test_parse_dump_skips_interface_line() {
        let peers = parse_dump(DUMP);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "AbCdEf+klientkey1=");
    }

    #[test]
    fn test_parse_dump_live_peer() {
        let peers = parse_dump(DUMP);
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.9:51111"));
        assert_eq!(peers[0].latest_handshake, Some(1_700_000_000));
        assert_eq!(peers[0].transfer_rx, 1_048_576);
        assert_eq!(peers[0].transfer_tx, 2_097_152);
    }

    #[test]
    fn test_parse_dump_never_handshaken_peer() {
        let peers = parse_dump(DUMP);
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].latest_handshake, None);
        assert_eq!(peers[1].transfer_rx, 0);
        assert_eq!(peers[1].transfer_tx, 0);
    }

    #[test]
    fn test_parse_dump_tolerates_short_lines() {
        let peers = parse_dump("header\ngarbage-line\n");
        assert!(peers.is_empty());
    }

    #[test]
    fn test_parse_dump_empty_input() {
        assert!(parse_dump("").is_empty());
    }
}
