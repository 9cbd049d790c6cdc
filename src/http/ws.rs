//! Telemetry websocket
//!
//! `/ws/stats` subscribes the caller to the observer hub. Browsers cannot
//! attach an Authorization header to a websocket upgrade, so the bearer
//! secret is also accepted as a `token` query parameter.

use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub(super) struct WsAuthQuery {
    token: Option<String>,
}

fn authorized(state: &AppState, headers: &HeaderMap, query: &WsAuthQuery) -> bool {
    let secret = &state.settings.session_secret;
    if secret.is_empty() {
        return false;
    }
    if let Some(token) = &query.token {
        if token == secret {
            return true;
        }
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false)
}

pub(super) async fn stats(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsAuthQuery>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return crate::ConsoleError::Unauthorized("invalid websocket token".to_string())
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut frames) = state.hub.subscribe();
    debug!("Observer {} connected", id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Clients only ping to keep the connection alive.
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    state.hub.unsubscribe(id);
    debug!("Observer {} disconnected", id);
}
