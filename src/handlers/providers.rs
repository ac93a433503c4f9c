//! Provider catalog endpoint.

use axum::{extract::State, response::Json};

use super::types::ProvidersResponse;
use crate::server::AppState;

/// Lists the registered providers, ordered by slug
#[utoipa::path(
    get,
    path = "/providers",
    responses(
        (status = 200, description = "Registered providers", body = ProvidersResponse)
    ),
    tag = "providers"
)]
pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.connections.providers().metadata(),
    })
}
