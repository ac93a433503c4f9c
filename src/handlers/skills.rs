//! Skill profile endpoint.

use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use super::types::SkillsResponse;
use crate::auth::OperatorAuth;
use crate::domain::OwnerId;
use crate::error::ApiError;
use crate::server::AppState;

/// Lists the owner's skill records, per provider and aggregate
#[utoipa::path(
    get,
    path = "/owners/{owner_id}/skills",
    security(("bearer_auth" = [])),
    params(("owner_id" = String, Path, description = "Owner id (UUID)")),
    responses(
        (status = 200, description = "Skill records", body = SkillsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "operators"
)]
pub async fn list_skills(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<SkillsResponse>, ApiError> {
    let owner_id = OwnerId(owner_id);
    let mut skills = state.skills.find_by_owner(owner_id).await?;
    skills.sort_by(|a, b| {
        a.skill_name
            .cmp(&b.skill_name)
            .then_with(|| a.source.as_str().cmp(b.source.as_str()))
    });
    Ok(Json(SkillsResponse { owner_id, skills }))
}
