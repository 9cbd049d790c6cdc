//! Input validation
//!
//! Everything arriving over the administrative surface is untrusted text.
//! Handles end up in shell-adjacent places (config comments, file content),
//! so the character set is strict.

use crate::error::{ConsoleError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Validate and case-fold a peer handle.
///
/// 2 to 32 characters, `[a-z0-9_-]` after folding.
pub fn validate_handle(handle: &str) -> Result<String> {
    let folded = handle.to_lowercase();
    if folded.len() < 2 {
        return Err(ConsoleError::Validation(
            "handle must be at least 2 characters".to_string(),
        ));
    }
    if folded.len() > 32 {
        return Err(ConsoleError::Validation(
            "handle must be at most 32 characters".to_string(),
        ));
    }
    if !folded
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ConsoleError::Validation(
            "handle may only contain letters, digits, underscores and hyphens".to_string(),
        ));
    }
    Ok(folded)
}

/// Validate a WireGuard public key: base64 of exactly 32 bytes
pub fn validate_public_key(key: &str) -> Result<()> {
    let decoded = BASE64
        .decode(key.trim())
        .map_err(|e| ConsoleError::Validation(format!("invalid base64 public key: {}", e)))?;
    if decoded.len() != 32 {
        return Err(ConsoleError::Validation(format!(
            "invalid public key length: expected 32 bytes, got {}",
            decoded.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_folding() {
        assert_eq!(validate_handle("Alice").unwrap(), "alice");
        assert_eq!(validate_handle("bob_2-x").unwrap(), "bob_2-x");
    }

    #[test]
    fn test_handle_length_bounds() {
        assert!(validate_handle("a").is_err());
        assert!(validate_handle(&"a".repeat(33)).is_err());
        assert!(validate_handle(&"a".repeat(32)).is_ok());
        assert!(validate_handle("ab").is_ok());
    }

    #[test]
    fn test_handle_character_set() {
        assert!(validate_handle("al ice").is_err());
        assert!(validate_handle("alice!").is_err());
        assert!(validate_handle("../etc").is_err());
        assert!(validate_handle("päivi").is_err());
    }

    #[test]
    fn test_public_key_shape() {
        let valid = BASE64.encode([7u8; 32]);
        assert!(validate_public_key(&valid).is_ok());
        assert!(validate_public_key("not-base64!!").is_err());
        let short = BASE64.encode([7u8; 16]);
        assert!(validate_public_key(&short).is_err());
    }
}
