//! Peer administration routes

use super::{AdminAuth, AppState};
use crate::error::Result;
use crate::registry::{AclProfile, ClientOs, PeerRecord, SessionRecord};
use crate::telemetry::unix_now;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub(super) struct CreateUserRequest {
    username: String,
    #[serde(default = "default_client_os")]
    client_os: ClientOs,
    #[serde(default = "default_acl_profile")]
    acl_profile: AclProfile,
}

fn default_client_os() -> ClientOs {
    ClientOs::Android
}

fn default_acl_profile() -> AclProfile {
    AclProfile::Full
}

/// A peer enriched with live kernel state
#[derive(Debug, Serialize)]
pub(super) struct UserView {
    #[serde(flatten)]
    record: PeerRecord,
    connected: bool,
    endpoint: Option<String>,
    transfer_rx: u64,
    transfer_tx: u64,
}

#[derive(Debug, Serialize)]
pub(super) struct UsersResponse {
    users: Vec<UserView>,
}

#[derive(Debug, Serialize)]
pub(super) struct ProvisionResponse {
    user: PeerRecord,
    client_config: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct SessionsQuery {
    #[serde(default = "default_session_limit")]
    limit: u32,
}

fn default_session_limit() -> u32 {
    50
}

pub(super) async fn list(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<UsersResponse>> {
    let peers = state.registry.list_peers()?;

    // Live enrichment is best effort; a listing must not depend on the
    // kernel being reachable.
    let dump = match state.kernel.dump_peers().await {
        Ok(dump) => dump,
        Err(e) => {
            warn!("Kernel dump failed while listing users: {}", e);
            Vec::new()
        }
    };
    let live: HashMap<&str, _> = dump.iter().map(|p| (p.public_key.as_str(), p)).collect();

    let now = unix_now();
    let window = state.settings.liveness_window_secs;
    let users = peers
        .into_iter()
        .map(|record| {
            let info = live.get(record.public_key.as_str());
            UserView {
                connected: info
                    .and_then(|p| p.latest_handshake)
                    .map(|h| now.saturating_sub(h) < window)
                    .unwrap_or(false),
                endpoint: info
                    .and_then(|p| p.endpoint.clone())
                    .or_else(|| record.last_endpoint.clone()),
                transfer_rx: info.map(|p| p.transfer_rx).unwrap_or(0),
                transfer_tx: info.map(|p| p.transfer_tx).unwrap_or(0),
                record,
            }
        })
        .collect();

    Ok(Json(UsersResponse { users }))
}

pub(super) async fn create(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<ProvisionResponse>)> {
    let provisioned = state
        .manager
        .create(&request.username, request.client_os, request.acl_profile)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse {
            user: provisioned.record,
            client_config: provisioned.artifact,
        }),
    ))
}

pub(super) async fn remove(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.manager.delete(&handle).await?;
    Ok(Json(serde_json::json!({
        "message": format!("Peer {} deleted", handle)
    })))
}

pub(super) async fn toggle(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let status = state.manager.toggle(&handle).await?;
    Ok(Json(serde_json::json!({
        "handle": handle,
        "status": status.as_str(),
    })))
}

pub(super) async fn rotate(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
) -> Result<Json<ProvisionResponse>> {
    let provisioned = state.manager.rotate_keys(&handle).await?;
    Ok(Json(ProvisionResponse {
        user: provisioned.record,
        client_config: provisioned.artifact,
    }))
}

pub(super) async fn config(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let artifact = state.manager.artifact(&handle).await?;
    Ok(Json(serde_json::json!({ "client_config": artifact })))
}

pub(super) async fn sessions(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionRecord>>> {
    let peer = state
        .registry
        .get_peer(&handle)?
        .ok_or_else(|| crate::ConsoleError::NotFound(format!("peer '{}'", handle)))?;
    let history = state
        .registry
        .sessions_for_peer(peer.id, query.limit.min(500))?;
    Ok(Json(history))
}

pub(super) async fn sync_one(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let synced = state.manager.sync_one(&handle).await?;
    Ok(Json(serde_json::json!({
        "handle": handle,
        "synced": synced,
    })))
}

pub(super) async fn sync_all(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<serde_json::Value>> {
    let report = state.reconciler.run().await?;
    Ok(Json(serde_json::json!({
        "zombies_purged": report.zombies_purged,
        "file_rewritten": report.file_rewritten,
        "peers_enforced": report.peers_enforced,
    })))
}
