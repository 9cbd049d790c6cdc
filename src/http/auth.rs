//! Admin bearer authentication
//!
//! The full authentication stack (password hashing, sessions, TOTP) lives
//! outside this crate. Every administrative route simply demands the shared
//! session secret as a bearer token; an empty secret locks the surface.

use super::AppState;
use crate::error::ConsoleError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// Extractor proving the request carries the admin bearer secret
pub struct AdminAuth;

/// An empty configured secret matches nothing.
fn token_matches(provided: &str, secret: &str) -> bool {
    !secret.is_empty() && provided == secret
}

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ConsoleError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ConsoleError::Unauthorized("missing bearer token".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ConsoleError::Unauthorized("malformed authorization header".to_string()))?;

        if !token_matches(token, &state.settings.session_secret) {
            return Err(ConsoleError::Unauthorized("invalid bearer token".to_string()));
        }
        Ok(AdminAuth)
    }
}
