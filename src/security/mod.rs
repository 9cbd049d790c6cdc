//! Security helpers
//!
//! Input validation for the administrative surface and sealing of stored
//! client private keys. Administrator authentication proper (sessions,
//! TOTP, password hashing) lives outside this crate; the HTTP layer only
//! checks a shared bearer secret.

mod sealed;
mod validation;

pub use sealed::KeySealer;
pub use validation::{validate_handle, validate_public_key};
