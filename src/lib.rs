//! wg-console: Control plane for a self-hosted WireGuard VPN
//!
//! This library keeps three data planes in lockstep: the durable peer
//! registry, the tunnel daemon's on-disk configuration, and the kernel's
//! live peer table. A fourth derived plane, the per-peer packet-filter
//! rules, tracks the registry as well.
//!
//! # Modules
//!
//! - `config`: Settings from defaults, optional TOML file and environment
//! - `wireguard`: Key tool adapter, config file store, address allocator,
//!   client artifact rendering
//! - `registry`: Durable record of peers, sessions and the administrator
//! - `firewall`: Per-peer ACL enforcement and global filter invariants
//! - `manager`: Peer lifecycle orchestration (create/delete/toggle/rotate)
//! - `reconcile`: Homeostatic sync forcing registry -> file -> kernel
//! - `telemetry`: Kernel counter polling, session derivation, fan-out
//! - `http`: Administrative HTTP/websocket surface
//! - `security`: Input validation and private-key sealing
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod firewall;
pub mod http;
pub mod manager;
pub mod reconcile;
pub mod registry;
pub mod security;
pub mod telemetry;
pub mod wireguard;

// Re-export commonly used types
pub use error::{ConsoleError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
