//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Call-local failures returned to the client as `{ "error": code }`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("account not found")]
    AccountNotFound,

    #[error("invalid account id")]
    InvalidAccountId,

    #[error("subscription manager unavailable: {0}")]
    ManagerUnavailable(String),

    #[error(transparent)]
    Core(#[from] mailpulse_common::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AccountNotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidAccountId => StatusCode::BAD_REQUEST,
            ApiError::ManagerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Core(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AccountNotFound => "account_not_found",
            ApiError::InvalidAccountId => "invalid_account_id",
            ApiError::ManagerUnavailable(_) => "manager_unavailable",
            ApiError::Core(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}
