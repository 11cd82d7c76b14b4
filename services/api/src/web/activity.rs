//! services/api/src/web/activity.rs
//!
//! Read access to the audit trail.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use deal_desk_core::{
    activity::ActivityLog,
    domain::{ActionKind, ActivityFilter, ActivityLogEntry},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody};
use crate::web::state::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ActivityParams {
    pub deal_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    /// Action kind, e.g. `status_changed`.
    pub action: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ActivityView {
    pub id: Uuid,
    pub deal_id: Option<Uuid>,
    /// `null` for system events such as webhook ingestion.
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub description: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ActivityLogEntry> for ActivityView {
    fn from(e: ActivityLogEntry) -> Self {
        Self {
            id: e.id,
            deal_id: e.deal_id,
            actor_id: e.actor_id,
            action: e.action.as_str().to_string(),
            description: e.description,
            metadata: e.metadata,
            ip: e.origin.ip,
            user_agent: e.origin.user_agent,
            created_at: e.created_at,
        }
    }
}

/// List activity, newest first.
#[utoipa::path(
    get,
    path = "/activity",
    params(ActivityParams),
    responses(
        (status = 200, description = "Activity entries", body = [ActivityView]),
        (status = 400, description = "Unknown action kind", body = ErrorBody)
    )
)]
pub async fn list_activity_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Vec<ActivityView>>, ApiError> {
    let action = params
        .action
        .as_deref()
        .map(|raw| {
            raw.parse::<ActionKind>()
                .map_err(|e| ApiError::BadRequest(format!("action: {}", e)))
        })
        .transpose()?;
    let filter = ActivityFilter {
        deal_id: params.deal_id,
        actor_id: params.actor_id,
        action,
        from: params.from,
        to: params.to,
        limit: params.limit.unwrap_or(0),
    };
    let entries = ActivityLog::new(state.db.clone()).list(filter).await?;
    Ok(Json(entries.into_iter().map(ActivityView::from).collect()))
}
