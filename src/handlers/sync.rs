//! Manual sync trigger.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use uuid::Uuid;

use super::types::SyncQuery;
use crate::auth::OperatorAuth;
use crate::domain::{OwnerId, Provider};
use crate::error::ApiError;
use crate::server::AppState;
use crate::sync_orchestrator::{SyncMode, SyncSummary};

/// Runs a sync pass for the owner's active connection and returns its summary
#[utoipa::path(
    post,
    path = "/owners/{owner_id}/providers/{provider}/sync",
    security(("bearer_auth" = [])),
    params(
        ("owner_id" = String, Path, description = "Owner id (UUID)"),
        ("provider" = String, Path, description = "Provider slug"),
        SyncQuery
    ),
    responses(
        (status = 200, description = "Sync pass completed", body = SyncSummary),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown provider or no active connection", body = ApiError),
        (status = 409, description = "A sync is already running for the connection", body = ApiError),
        (status = 502, description = "Provider failure; details carry the partial summary", body = ApiError)
    ),
    tag = "operators"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path((owner_id, provider)): Path<(Uuid, String)>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncSummary>, ApiError> {
    let provider: Provider = provider.parse().map_err(|_| {
        ApiError::new(
            axum::http::StatusCode::NOT_FOUND,
            "UNKNOWN_PROVIDER",
            &format!("Unknown provider '{provider}'"),
        )
    })?;
    let mode = if query.full {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };

    let summary = state
        .orchestrator
        .trigger_sync(OwnerId(owner_id), provider, mode)
        .await?;
    Ok(Json(summary))
}
