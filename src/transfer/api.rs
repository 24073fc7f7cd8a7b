//! Transfer API Layer
//!
//! Thin HTTP mapping onto [`TransfersService`]. User-scoped routes take the
//! requester from the `X-User-Uuid` header set by the authenticating proxy.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::error::TransferError;
use super::service::{CreateTransferRequest, TransfersService, UserTransferRequest};
use super::types::Transfer;
use crate::bus::BusEvent;

pub const USER_HEADER: &str = "x-user-uuid";

/// API wrapper for standard response format
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            data: Some(data),
            msg: None,
        }
    }

    pub fn error(code: i32, msg: impl ToString) -> Self {
        Self {
            code,
            data: None,
            msg: Some(msg.to_string()),
        }
    }
}

pub mod error_codes {
    pub const CREATION_FAILED: i32 = -1002;
    pub const TOO_MANY_CANDIDATES: i32 = -1003;
    pub const ALREADY_STARTED: i32 = -1004;
    pub const UNAUTHORIZED: i32 = -4001;
    pub const FORBIDDEN: i32 = -4003;
    pub const SERVICE_UNAVAILABLE: i32 = -5001;
    pub const INTERNAL: i32 = -5002;
    pub const TRANSFER_NOT_FOUND: i32 = -6001;
    pub const INVALID_STATE: i32 = -6002;
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Map TransferError to (StatusCode, error_code, message)
fn map_error(e: &TransferError) -> (StatusCode, i32, String) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let code = match e {
        TransferError::Creation(_) => error_codes::CREATION_FAILED,
        TransferError::TooManyCandidates(_) => error_codes::TOO_MANY_CANDIDATES,
        TransferError::AlreadyStarted(_) => error_codes::ALREADY_STARTED,
        TransferError::PermissionDenied(_) => error_codes::FORBIDDEN,
        TransferError::TransferNotFound(_) | TransferError::ChannelNotFound { .. } => {
            error_codes::TRANSFER_NOT_FOUND
        }
        TransferError::Completion(_)
        | TransferError::Cancellation(_)
        | TransferError::InvalidStateTransition { .. } => error_codes::INVALID_STATE,
        TransferError::Switch(_) => error_codes::SERVICE_UNAVAILABLE,
        TransferError::Storage(_) | TransferError::LockTimeout(_) => error_codes::INTERNAL,
    };

    (status, code, format!("{}: {}", e.code(), e))
}

fn reply(result: Result<Transfer, TransferError>) -> ApiResult<Transfer> {
    match result {
        Ok(transfer) => Ok(Json(ApiResponse::success(transfer))),
        Err(e) => {
            let (status, code, msg) = map_error(&e);
            if status.is_server_error() {
                warn!(code = e.code(), error = %e, "Transfer request failed");
            }
            Err((status, Json(ApiResponse::error(code, msg))))
        }
    }
}

fn requester(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error(
                    error_codes::UNAUTHORIZED,
                    "Missing X-User-Uuid header",
                )),
            )
        })
}

pub struct ApiState {
    pub service: Arc<TransfersService>,
    /// Ingress for bus events relayed over HTTP by the bus bridge
    pub bus_tx: mpsc::Sender<BusEvent>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/transfers", post(create_transfer))
        .route("/transfers/{id}", get(get_transfer))
        .route("/transfers/{id}/complete", put(complete_transfer))
        .route("/transfers/{id}/cancel", put(cancel_transfer))
        .route("/users/me/transfers", post(create_user_transfer))
        .route("/users/me/transfers/{id}", get(get_user_transfer))
        .route(
            "/users/me/transfers/{id}/complete",
            put(complete_user_transfer),
        )
        .route("/users/me/transfers/{id}/cancel", put(cancel_user_transfer))
        .route("/bus/events", post(ingest_bus_event))
        .route("/health", get(health_check))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_transfer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTransferRequest>,
) -> ApiResult<Transfer> {
    reply(state.service.create(req).await)
}

pub async fn get_transfer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    reply(state.service.get(&id).await)
}

pub async fn complete_transfer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    reply(state.service.complete(&id).await)
}

pub async fn cancel_transfer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    reply(state.service.cancel(&id).await)
}

pub async fn create_user_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<UserTransferRequest>,
) -> ApiResult<Transfer> {
    let user = requester(&headers)?;
    reply(state.service.create_from_user(req, &user).await)
}

pub async fn get_user_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    let user = requester(&headers)?;
    reply(state.service.get_from_user(&id, &user).await)
}

pub async fn complete_user_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    let user = requester(&headers)?;
    reply(state.service.complete_from_user(&id, &user).await)
}

pub async fn cancel_user_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Transfer> {
    let user = requester(&headers)?;
    reply(state.service.cancel_from_user(&id, &user).await)
}

pub async fn ingest_bus_event(
    State(state): State<Arc<ApiState>>,
    Json(event): Json<BusEvent>,
) -> Result<StatusCode, ApiError> {
    state.bus_tx.send(event).await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(
                error_codes::SERVICE_UNAVAILABLE,
                "Bus consumer stopped",
            )),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("ok"))
}

// ============================================================================
// Unit Tests
// ============================================================================
