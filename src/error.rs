//! Error types for wg-console
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in application code.

use thiserror::Error;

/// Main error type for wg-console operations
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Input validation errors (bad handle, unknown platform, bad profile)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate handle, address or public key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No free address left in the tunnel subnet
    #[error("No available addresses in the VPN subnet")]
    AddressPoolExhausted,

    /// The wg/wg-quick tooling exited non-zero
    #[error("Key tool error: {0}")]
    KeyTool(String),

    /// Kernel sync failed after a config rewrite; file was rolled back
    #[error("WireGuard reload failed: {0}")]
    ReloadFailed(String),

    /// The tunnel configuration file is missing
    #[error("WireGuard config not found: {0}")]
    ConfigMissing(String),

    /// The tunnel configuration file could not be parsed safely
    #[error("WireGuard config corrupt: {0}")]
    ConfigCorrupt(String),

    /// Durable store errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Packet filter errors
    #[error("Firewall error: {0}")]
    Firewall(String),

    /// Settings/configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admin authentication failures
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias using ConsoleError
pub type Result<T> = std::result::Result<T, ConsoleError>;

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        ConsoleError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ConsoleError {
    fn from(err: toml::de::Error) -> Self {
        ConsoleError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for ConsoleError {
    fn from(err: rusqlite::Error) -> Self {
        ConsoleError::Registry(err.to_string())
    }
}
