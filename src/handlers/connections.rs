//! # Connection Handlers
//!
//! Operator endpoints that connect an owner to a provider account and revoke
//! existing connections.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use super::types::{ConnectRequest, ConnectionInfo};
use crate::auth::OperatorAuth;
use crate::domain::OwnerId;
use crate::error::{ApiError, validation_error};
use crate::server::AppState;

/// Activates a provider connection for the owner
#[utoipa::path(
    post,
    path = "/owners/{owner_id}/connections",
    security(("bearer_auth" = [])),
    params(("owner_id" = String, Path, description = "Owner id (UUID)")),
    request_body = ConnectRequest,
    responses(
        (status = 201, description = "Connection activated", body = ConnectionInfo),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Provider not configured", body = ApiError),
        (status = 409, description = "Owner already has an active connection for the provider", body = ApiError)
    ),
    tag = "operators"
)]
pub async fn connect(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(owner_id): Path<Uuid>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConnectionInfo>), ApiError> {
    let Json(request) = payload?;
    if request.external_account_id.trim().is_empty() {
        return Err(validation_error(
            "Invalid connection request",
            serde_json::json!({ "external_account_id": "must not be empty" }),
        ));
    }
    if request.access_token.is_empty() {
        return Err(validation_error(
            "Invalid connection request",
            serde_json::json!({ "access_token": "must not be empty" }),
        ));
    }

    let connection = state
        .connections
        .connect(
            OwnerId(owner_id),
            request.provider,
            request.external_account_id.trim(),
            request.credential(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ConnectionInfo::from(&connection))))
}

/// Revokes a connection; its skill records are kept
#[utoipa::path(
    post,
    path = "/connections/{connection_id}/disconnect",
    security(("bearer_auth" = [])),
    params(("connection_id" = String, Path, description = "Connection id (UUID)")),
    responses(
        (status = 204, description = "Connection revoked"),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "operators"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(connection_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.connections.disconnect(connection_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
