//! Runtime settings
//!
//! Settings are resolved in three layers: built-in defaults, an optional
//! TOML file, then environment variables. The environment wins so that
//! container deployments can override a baked-in file.

use crate::error::{ConsoleError, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default tunnel subnet; the server occupies host 1.
pub const DEFAULT_SUBNET: &str = "10.50.0.0/24";

/// First host index handed to clients (.2 is reserved for the bootstrap identity).
pub const DEFAULT_HOST_START: u32 = 3;

/// Last host index handed to clients.
pub const DEFAULT_HOST_END: u32 = 254;

/// Fully resolved runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// WireGuard interface name (e.g., "wg0")
    pub interface: String,
    /// Path to the tunnel configuration file
    pub config_path: PathBuf,
    /// Tunnel subnet
    pub subnet: Ipv4Net,
    /// First allocatable host index
    pub host_start: u32,
    /// Last allocatable host index
    pub host_end: u32,
    /// Public endpoint clients dial, "host:port"
    pub endpoint: String,
    /// DNS server pushed to clients
    pub client_dns: String,
    /// MTU pushed to clients
    pub client_mtu: u16,
    /// PersistentKeepalive pushed to clients, seconds
    pub keepalive_secs: u16,
    /// Handshake age below which a peer counts as connected, seconds
    pub liveness_window_secs: u64,
    /// Telemetry poll period, seconds
    pub poll_interval_secs: u64,
    /// Telemetry sleep when nobody is watching, seconds
    pub idle_interval_secs: u64,
    /// How often telemetry deltas are persisted, seconds
    pub db_sync_interval_secs: u64,
    /// Path to the SQLite registry
    pub registry_path: PathBuf,
    /// Shared secret for admin bearer auth and private-key sealing
    pub session_secret: String,
    /// Bootstrap admin username (first boot only)
    pub admin_user: String,
    /// Bootstrap admin credential hash, produced by the external auth tooling
    pub admin_password_hash: Option<String>,
    /// Keep client private keys (sealed) so artifacts can be re-displayed.
    /// When false, re-display always rotates.
    pub store_private_keys: bool,
    /// HTTP bind address
    pub listen_addr: SocketAddr,
}

/// Optional TOML overlay; every field may be omitted
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    interface: Option<String>,
    config_path: Option<PathBuf>,
    subnet: Option<String>,
    host_start: Option<u32>,
    host_end: Option<u32>,
    endpoint: Option<String>,
    client_dns: Option<String>,
    client_mtu: Option<u16>,
    keepalive_secs: Option<u16>,
    liveness_window_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    idle_interval_secs: Option<u64>,
    db_sync_interval_secs: Option<u64>,
    registry_path: Option<PathBuf>,
    session_secret: Option<String>,
    admin_user: Option<String>,
    admin_password_hash: Option<String>,
    store_private_keys: Option<bool>,
    listen_addr: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            subnet: DEFAULT_SUBNET.parse().expect("default subnet is valid"),
            host_start: DEFAULT_HOST_START,
            host_end: DEFAULT_HOST_END,
            endpoint: String::new(),
            client_dns: "8.8.8.8".to_string(),
            client_mtu: 1420,
            keepalive_secs: 25,
            liveness_window_secs: 300,
            poll_interval_secs: 3,
            idle_interval_secs: 10,
            db_sync_interval_secs: 20,
            registry_path: PathBuf::from("/var/lib/wg-console/registry.db"),
            session_secret: String::new(),
            admin_user: "admin".to_string(),
            admin_password_hash: None,
            store_private_keys: true,
            listen_addr: "0.0.0.0:8000".parse().expect("default listen addr is valid"),
        }
    }
}

impl Settings {
    /// Resolve settings from defaults, an optional TOML file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ConsoleError::Config(format!("Failed to read settings file {:?}: {}", path, e))
            })?;
            let overlay: FileSettings = toml::from_str(&text)?;
            settings.apply_file(overlay)?;
        }

        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_file(&mut self, overlay: FileSettings) -> Result<()> {
        if let Some(v) = overlay.interface {
            self.interface = v;
        }
        if let Some(v) = overlay.config_path {
            self.config_path = v;
        }
        if let Some(v) = overlay.subnet {
            self.subnet = parse_subnet(&v)?;
        }
        if let Some(v) = overlay.host_start {
            self.host_start = v;
        }
        if let Some(v) = overlay.host_end {
            self.host_end = v;
        }
        if let Some(v) = overlay.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = overlay.client_dns {
            self.client_dns = v;
        }
        if let Some(v) = overlay.client_mtu {
            self.client_mtu = v;
        }
        if let Some(v) = overlay.keepalive_secs {
            self.keepalive_secs = v;
        }
        if let Some(v) = overlay.liveness_window_secs {
            self.liveness_window_secs = v;
        }
        if let Some(v) = overlay.poll_interval_secs {
            self.poll_interval_secs = v;
        }
        if let Some(v) = overlay.idle_interval_secs {
            self.idle_interval_secs = v;
        }
        if let Some(v) = overlay.db_sync_interval_secs {
            self.db_sync_interval_secs = v;
        }
        if let Some(v) = overlay.registry_path {
            self.registry_path = v;
        }
        if let Some(v) = overlay.session_secret {
            self.session_secret = v;
        }
        if let Some(v) = overlay.admin_user {
            self.admin_user = v;
        }
        if let Some(v) = overlay.admin_password_hash {
            self.admin_password_hash = Some(v);
        }
        if let Some(v) = overlay.store_private_keys {
            self.store_private_keys = v;
        }
        if let Some(v) = overlay.listen_addr {
            self.listen_addr = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("WG_INTERFACE") {
            self.interface = v;
        }
        if let Ok(v) = std::env::var("WG_CONFIG_PATH") {
            self.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VPN_SUBNET") {
            self.subnet = parse_subnet(&v)?;
        }
        if let Ok(v) = std::env::var("VPN_IP_START") {
            self.host_start = parse_env_num("VPN_IP_START", &v)?;
        }
        if let Ok(v) = std::env::var("VPN_IP_END") {
            self.host_end = parse_env_num("VPN_IP_END", &v)?;
        }
        if let Ok(v) = std::env::var("VPN_ENDPOINT") {
            self.endpoint = v;
        }
        if let Ok(v) = std::env::var("CLIENT_DNS") {
            self.client_dns = v;
        }
        if let Ok(v) = std::env::var("CLIENT_MTU") {
            self.client_mtu = parse_env_num("CLIENT_MTU", &v)?;
        }
        if let Ok(v) = std::env::var("PERSISTENT_KEEPALIVE") {
            self.keepalive_secs = parse_env_num("PERSISTENT_KEEPALIVE", &v)?;
        }
        if let Ok(v) = std::env::var("LIVENESS_WINDOW") {
            self.liveness_window_secs = parse_env_num("LIVENESS_WINDOW", &v)?;
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL") {
            self.poll_interval_secs = parse_env_num("POLL_INTERVAL", &v)?;
        }
        if let Ok(v) = std::env::var("DB_SYNC_INTERVAL") {
            self.db_sync_interval_secs = parse_env_num("DB_SYNC_INTERVAL", &v)?;
        }
        if let Ok(v) = std::env::var("REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SESSION_SECRET") {
            self.session_secret = v;
        }
        if let Ok(v) = std::env::var("ADMIN_USER") {
            self.admin_user = v;
        }
        if let Ok(v) = std::env::var("ADMIN_PASSWORD_HASH") {
            self.admin_password_hash = Some(v);
        }
        if let Ok(v) = std::env::var("STORE_PRIVATE_KEYS") {
            self.store_private_keys = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.listen_addr = v.parse().map_err(|e| {
                ConsoleError::Config(format!("Invalid LISTEN_ADDR '{}': {}", v, e))
            })?;
        }
        Ok(())
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.host_start < 2 {
            return Err(ConsoleError::Config(
                "host_start must be >= 2 (host 1 is the server)".to_string(),
            ));
        }
        if self.host_end <= self.host_start {
            return Err(ConsoleError::Config(format!(
                "host range [{}, {}] is empty",
                self.host_start, self.host_end
            )));
        }
        let max_host = (1u64 << (32 - u32::from(self.subnet.prefix_len()))).saturating_sub(2);
        if u64::from(self.host_end) > max_host {
            return Err(ConsoleError::Config(format!(
                "host_end {} does not fit in subnet {}",
                self.host_end, self.subnet
            )));
        }
        // A disconnect must be distinguishable from keepalive jitter.
        if self.liveness_window_secs <= 6 * u64::from(self.keepalive_secs) {
            return Err(ConsoleError::Config(format!(
                "liveness window {}s must exceed 6x keepalive ({}s)",
                self.liveness_window_secs,
                self.keepalive_secs * 6
            )));
        }
        if !self.endpoint.is_empty() && !self.endpoint.contains(':') {
            return Err(ConsoleError::Config(format!(
                "endpoint '{}' must be host:port",
                self.endpoint
            )));
        }
        Ok(())
    }

    /// The server's own tunnel address (host 1 of the subnet)
    pub fn server_address(&self) -> Ipv4Addr {
        let base = u32::from(self.subnet.network());
        Ipv4Addr::from(base + 1)
    }

    /// Liveness window as a `Duration`
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }
}

fn parse_subnet(s: &str) -> Result<Ipv4Net> {
    s.parse()
        .map_err(|e| ConsoleError::Config(format!("Invalid subnet '{}': {}", s, e)))
}

fn parse_env_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConsoleError::Config(format!("Invalid {} '{}': {}", name, value, e)))
}
