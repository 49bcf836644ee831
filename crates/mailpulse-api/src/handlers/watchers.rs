//! Subscription and watcher status handlers

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use mailpulse_common::types::AccountId;
use mailpulse_core::{ManagerStatus, SubscriptionReply};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Body of subscribe / unsubscribe / touch
#[derive(Debug, Default, Deserialize)]
pub struct SessionRequest {
    /// Client session; a new one is issued when absent
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub reply: SubscriptionReply,
}

/// Parse the path id and make sure the account exists
async fn resolve_account(state: &AppState, raw: &str) -> Result<AccountId, ApiError> {
    let account_id: AccountId = raw.trim().parse().map_err(|_| ApiError::InvalidAccountId)?;
    if account_id <= 0 {
        return Err(ApiError::InvalidAccountId);
    }
    if !state.accounts.exists(account_id).await? {
        return Err(ApiError::AccountNotFound);
    }
    Ok(account_id)
}

fn session_id(body: Option<Json<SessionRequest>>) -> String {
    body.and_then(|Json(req)| req.session_id)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Register a session's interest in an account
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let account_id = resolve_account(&state, &id).await?;
    let session_id = session_id(body);
    let reply = state.manager().await?.subscribe(account_id, &session_id);
    debug!(account_id, session_id = %session_id, watching = reply.watching, "Subscribe");
    Ok(Json(SessionResponse { session_id, reply }))
}

pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let account_id = resolve_account(&state, &id).await?;
    let session_id = session_id(body);
    let reply = state.manager().await?.unsubscribe(account_id, &session_id);
    Ok(Json(SessionResponse { session_id, reply }))
}

/// Heartbeat
pub async fn touch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let account_id = resolve_account(&state, &id).await?;
    let session_id = session_id(body);
    let reply = state.manager().await?.touch(account_id, &session_id);
    Ok(Json(SessionResponse { session_id, reply }))
}

/// Manager status of the served database
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<ManagerStatus>, ApiError> {
    Ok(Json(state.manager().await?.status()))
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    let body = mailpulse_core::metrics()
        .map(|m| m.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
