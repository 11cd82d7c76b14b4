//! services/api/src/web/managers.rs
//!
//! Manager account administration.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use deal_desk_core::{
    activity::ActivityLog,
    domain::{ActionKind, ActivityLogEntry, Actor, ActorRole, Manager},
    lifecycle::LifecycleError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody};
use crate::web::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ManagerView {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    /// `manager` or `supervisor`.
    pub role: String,
}

impl From<Manager> for ManagerView {
    fn from(m: Manager) -> Self {
        Self {
            id: m.id,
            email: m.email,
            display_name: m.display_name,
            role: m.role.as_str().to_string(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RoleRequest {
    pub role: String,
}

/// The logged-in manager.
#[utoipa::path(
    get,
    path = "/managers/me",
    responses(
        (status = 200, description = "Current manager", body = ManagerView),
        (status = 401, description = "Not logged in", body = ErrorBody)
    )
)]
pub async fn current_manager_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<ManagerView>, ApiError> {
    let manager = state.db.get_manager(actor.id).await?;
    Ok(Json(manager.into()))
}

/// Change a manager's role (supervisors only).
#[utoipa::path(
    put,
    path = "/managers/{id}/role",
    params(("id" = Uuid, Path, description = "Manager id")),
    request_body = RoleRequest,
    responses(
        (status = 200, description = "Role updated", body = ManagerView),
        (status = 403, description = "Not a supervisor", body = ErrorBody),
        (status = 404, description = "No such manager", body = ErrorBody)
    )
)]
pub async fn set_role_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(manager_id): Path<Uuid>,
    Json(req): Json<RoleRequest>,
) -> Result<Json<ManagerView>, ApiError> {
    if !actor.is_privileged() {
        return Err(LifecycleError::Forbidden.into());
    }
    let role = req
        .role
        .parse::<ActorRole>()
        .map_err(|e| ApiError::BadRequest(format!("{}; expected manager or supervisor", e)))?;

    let manager = state.db.set_manager_role(manager_id, role).await?;
    ActivityLog::new(state.db.clone())
        .append(
            ActivityLogEntry::new(ActionKind::RoleChanged, format!("Role set to {}", role.as_str()))
                .by(&actor)
                .with_metadata(json!({ "manager_id": manager_id, "role": role.as_str() })),
        )
        .await;
    Ok(Json(manager.into()))
}
