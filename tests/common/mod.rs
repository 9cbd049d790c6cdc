//! Shared fixtures for integration tests
//!
//! `FakeKernel` simulates the live tunnel: its peer set is derived from the
//! config file on sync (like `wg syncconf` would) and mutated directly by
//! peer removal and replay, which lets tests assert the registry/file/kernel
//! invariants end to end without a real interface.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use wg_console::config::Settings;
use wg_console::firewall::AccessController;
use wg_console::manager::PeerManager;
use wg_console::reconcile::Reconciler;
use wg_console::registry::{AclProfile, Registry};
use wg_console::wireguard::{parse_sections, ConfigStore, PeerDump, WgBackend};
use wg_console::Result;
use zeroize::Zeroizing;

pub const BASE_CONFIG: &str = "[Interface]\n\
    Address = 10.50.0.1/24\n\
    ListenPort = 51820\n\
    PrivateKey = server-private-key\n";

/// Deterministic, correctly shaped public key for a fake private key
pub fn fake_public_key(private_key: &str) -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    let mut bytes = [0u8; 32];
    for (i, b) in private_key.bytes().enumerate() {
        bytes[i % 32] ^= b;
    }
    BASE64.encode(bytes)
}

/// In-memory stand-in for the kernel's peer table
#[derive(Default)]
pub struct FakeKernel {
    key_counter: AtomicUsize,
    /// public key -> allowed address
    pub peers: Mutex<HashMap<String, String>>,
    /// handshake/counter observations injected by tests, keyed by public key
    pub observations: Mutex<HashMap<String, (Option<u64>, u64, u64)>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel_keys(&self) -> HashSet<String> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Inject a peer directly, bypassing file and registry (stale state)
    pub fn inject_peer(&self, public_key: &str, address: &str) {
        self.peers
            .lock()
            .insert(public_key.to_string(), address.to_string());
    }

    /// Drop a peer directly (out-of-band `wg set ... remove`)
    pub fn drop_peer(&self, public_key: &str) {
        self.peers.lock().remove(public_key);
    }
}

#[async_trait]
impl WgBackend for FakeKernel {
    async fn generate_private_key(&self) -> Result<Zeroizing<String>> {
        let n = self.key_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Zeroizing::new(format!("priv-{}", n)))
    }

    async fn derive_public_key(&self, private_key: &str) -> Result<String> {
        Ok(fake_public_key(private_key))
    }

    async fn dump_peers(&self) -> Result<Vec<PeerDump>> {
        let observations = self.observations.lock();
        Ok(self
            .peers
            .lock()
            .iter()
            .map(|(key, _)| {
                let (handshake, rx, tx) =
                    observations.get(key).copied().unwrap_or((None, 0, 0));
                PeerDump {
                    public_key: key.clone(),
                    endpoint: handshake.map(|_| "203.0.113.9:51111".to_string()),
                    latest_handshake: handshake,
                    transfer_rx: rx,
                    transfer_tx: tx,
                }
            })
            .collect())
    }

    async fn sync_config(&self, config_path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(config_path)?;
        let parsed = parse_sections(&content);
        let mut peers = self.peers.lock();
        peers.clear();
        for section in parsed.peers {
            if let Some(key) = section.public_key {
                peers.insert(key, section.allowed_ips.unwrap_or_default());
            }
        }
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.peers.lock().remove(public_key);
        Ok(())
    }

    async fn replay_peers(&self, batch: &[(String, Ipv4Addr)]) -> Result<()> {
        let mut peers = self.peers.lock();
        for (key, address) in batch {
            peers.insert(key.clone(), format!("{}/32", address));
        }
        Ok(())
    }
}

/// Firewall double that records every call
#[derive(Default)]
pub struct RecordingFirewall {
    pub applied: Mutex<Vec<(Ipv4Addr, AclProfile)>>,
    pub cleared: Mutex<Vec<Ipv4Addr>>,
}

#[async_trait]
impl AccessController for RecordingFirewall {
    async fn apply(&self, address: Ipv4Addr, profile: AclProfile) -> Result<()> {
        self.applied.lock().push((address, profile));
        Ok(())
    }

    async fn clear(&self, address: Ipv4Addr) -> Result<()> {
        self.cleared.lock().push(address);
        Ok(())
    }

    async fn init_global(&self) -> Result<()> {
        Ok(())
    }
}

/// A fully wired control plane over fakes
pub struct TestPlane {
    pub _dir: TempDir,
    pub settings: Settings,
    pub store: Arc<ConfigStore>,
    pub kernel: Arc<FakeKernel>,
    pub firewall: Arc<RecordingFirewall>,
    pub registry: Registry,
    pub manager: Arc<PeerManager>,
    pub reconciler: Arc<Reconciler>,
}

impl TestPlane {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("wg0.conf");
        std::fs::write(&config_path, BASE_CONFIG).unwrap();

        let settings = Settings {
            config_path: config_path.clone(),
            endpoint: "vpn.example.net:51820".to_string(),
            session_secret: "integration-secret".to_string(),
            ..Settings::default()
        };

        let store = Arc::new(ConfigStore::new(config_path));
        let kernel = Arc::new(FakeKernel::new());
        let firewall = Arc::new(RecordingFirewall::default());
        let registry = Registry::open_in_memory().unwrap();

        let manager = Arc::new(PeerManager::new(
            store.clone(),
            kernel.clone(),
            registry.clone(),
            firewall.clone(),
            settings.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            kernel.clone(),
            registry.clone(),
        ));

        Self {
            _dir: dir,
            settings,
            store,
            kernel,
            firewall,
            registry,
            manager,
            reconciler,
        }
    }

    /// Public keys present in the config file
    pub fn file_keys(&self) -> HashSet<String> {
        let content = self.store.read().unwrap();
        parse_sections(&content)
            .peers
            .into_iter()
            .filter_map(|p| p.public_key)
            .collect()
    }

    /// Public keys of active registry peers
    pub fn registry_active_keys(&self) -> HashSet<String> {
        self.registry
            .active_peers()
            .unwrap()
            .into_iter()
            .map(|p| p.public_key)
            .collect()
    }
}
