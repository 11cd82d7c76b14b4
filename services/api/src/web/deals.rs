//! services/api/src/web/deals.rs
//!
//! Manager-facing deal endpoints. Every handler runs behind `require_auth` and
//! acts as the resolved `Actor`; policy lives in the lifecycle engine.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use deal_desk_core::{
    domain::{Actor, AiAnalysis, Deal, DealFilter, DealStatus},
    sla::SlaState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody};
use crate::web::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AnalysisView {
    pub summary: String,
    pub score: u8,
    pub intent: String,
    pub objections: Vec<String>,
    pub next_action: String,
}

impl From<AiAnalysis> for AnalysisView {
    fn from(a: AiAnalysis) -> Self {
        Self {
            summary: a.summary,
            score: a.score,
            intent: a.intent,
            objections: a.objections,
            next_action: a.next_action,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SlaView {
    pub breached: bool,
    pub overdue_minutes: i64,
    pub waiting_since: Option<DateTime<Utc>>,
}

impl From<SlaState> for SlaView {
    fn from(s: SlaState) -> Self {
        Self {
            breached: s.breached,
            overdue_minutes: s.overdue_minutes,
            waiting_since: s.waiting_since,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DealView {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub conversation_id: Uuid,
    pub manager_id: Option<Uuid>,
    /// One of `New`, `InProgress`, `Closed`.
    pub status: String,
    pub is_priority: bool,
    pub is_viewed: bool,
    pub note: Option<String>,
    pub reminder_at: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
    pub last_client_message_at: Option<DateTime<Utc>>,
    pub last_manager_response_at: Option<DateTime<Utc>>,
    pub analysis: Option<AnalysisView>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analysis_failed_at: Option<DateTime<Utc>>,
    pub rating: Option<u8>,
    pub review: Option<String>,
    pub rated_at: Option<DateTime<Utc>>,
    pub sla: SlaView,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DealView {
    fn build(state: &AppState, deal: Deal) -> Self {
        let sla = state.engine.sla(&deal, Utc::now()).into();
        Self {
            id: deal.id,
            contact_id: deal.contact_id,
            conversation_id: deal.conversation_id,
            manager_id: deal.manager_id,
            status: deal.status.as_str().to_string(),
            is_priority: deal.is_priority,
            is_viewed: deal.is_viewed,
            note: deal.note,
            reminder_at: deal.reminder_at,
            last_message_text: deal.last_message_text,
            last_client_message_at: deal.last_client_message_at,
            last_manager_response_at: deal.last_manager_response_at,
            analysis: deal.analysis.map(AnalysisView::from),
            analyzed_at: deal.analyzed_at,
            analysis_failed_at: deal.analysis_failed_at,
            rating: deal.rating,
            review: deal.review,
            rated_at: deal.rated_at,
            sla,
            created_at: deal.created_at,
            updated_at: deal.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DealListParams {
    /// `New`, `InProgress` or `Closed`.
    pub status: Option<String>,
    pub manager_id: Option<Uuid>,
    pub priority: Option<bool>,
    /// Case-insensitive text search over contact, messages, note and analysis.
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignRequest {
    /// `null` unassigns the deal.
    pub manager_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NoteRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReminderRequest {
    pub reminder_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RatingRequest {
    pub rating: u8,
    pub review: Option<String>,
}

fn parse_status(raw: &str) -> Result<DealStatus, ApiError> {
    raw.parse::<DealStatus>().map_err(|e| {
        ApiError::BadRequest(format!("{}; expected New, InProgress or Closed", e))
    })
}

//=========================================================================================
// Handlers
//=========================================================================================

/// List deals, priority first, then most recently updated.
#[utoipa::path(
    get,
    path = "/deals",
    params(DealListParams),
    responses(
        (status = 200, description = "Matching deals", body = [DealView]),
        (status = 400, description = "Invalid filter", body = ErrorBody),
        (status = 401, description = "Not logged in", body = ErrorBody)
    )
)]
pub async fn list_deals_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DealListParams>,
) -> Result<Json<Vec<DealView>>, ApiError> {
    let filter = DealFilter {
        status: params.status.as_deref().map(parse_status).transpose()?,
        manager_id: params.manager_id,
        priority: params.priority,
        query: params
            .q
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty()),
        limit: params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0).max(0),
    };
    let deals = state.db.list_deals(&filter).await?;
    Ok(Json(
        deals
            .into_iter()
            .map(|deal| DealView::build(&state, deal))
            .collect(),
    ))
}

/// Fetch one deal with its current SLA standing.
#[utoipa::path(
    get,
    path = "/deals/{id}",
    params(("id" = Uuid, Path, description = "Deal id")),
    responses(
        (status = 200, description = "The deal", body = DealView),
        (status = 404, description = "No such deal", body = ErrorBody)
    )
)]
pub async fn get_deal_handler(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<Uuid>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state.engine.get(deal_id).await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Take an unassigned deal.
#[utoipa::path(
    post,
    path = "/deals/{id}/claim",
    params(("id" = Uuid, Path, description = "Deal id")),
    responses(
        (status = 200, description = "Deal claimed", body = DealView),
        (status = 409, description = "Already claimed or closed", body = ErrorBody)
    )
)]
pub async fn claim_deal_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state.engine.claim(deal_id, &actor).await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Reassign or unassign a deal (supervisors only).
#[utoipa::path(
    post,
    path = "/deals/{id}/assign",
    params(("id" = Uuid, Path, description = "Deal id")),
    request_body = AssignRequest,
    responses(
        (status = 200, description = "Deal reassigned", body = DealView),
        (status = 403, description = "Not a supervisor", body = ErrorBody),
        (status = 404, description = "No such deal or manager", body = ErrorBody)
    )
)]
pub async fn assign_deal_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state.engine.reassign(deal_id, &actor, req.manager_id).await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Move a deal to another status.
#[utoipa::path(
    post,
    path = "/deals/{id}/status",
    params(("id" = Uuid, Path, description = "Deal id")),
    request_body = StatusRequest,
    responses(
        (status = 200, description = "Status changed", body = DealView),
        (status = 403, description = "Not the assignee", body = ErrorBody),
        (status = 409, description = "Concurrent modification", body = ErrorBody),
        (status = 422, description = "Transition not allowed", body = ErrorBody)
    )
)]
pub async fn set_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<DealView>, ApiError> {
    let to = parse_status(&req.status)?;
    let deal = state.engine.set_status(deal_id, &actor, to).await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Replace or clear the manager note.
#[utoipa::path(
    put,
    path = "/deals/{id}/note",
    params(("id" = Uuid, Path, description = "Deal id")),
    request_body = NoteRequest,
    responses(
        (status = 200, description = "Note saved", body = DealView),
        (status = 403, description = "Not the assignee", body = ErrorBody)
    )
)]
pub async fn update_note_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
    Json(req): Json<NoteRequest>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state
        .engine
        .update_note(deal_id, &actor, req.note.as_deref())
        .await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Set or clear a follow-up reminder.
#[utoipa::path(
    put,
    path = "/deals/{id}/reminder",
    params(("id" = Uuid, Path, description = "Deal id")),
    request_body = ReminderRequest,
    responses(
        (status = 200, description = "Reminder saved", body = DealView),
        (status = 403, description = "Deal belongs to another manager", body = ErrorBody)
    )
)]
pub async fn set_reminder_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
    Json(req): Json<ReminderRequest>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state
        .engine
        .set_reminder(deal_id, &actor, req.reminder_at)
        .await?;
    Ok(Json(DealView::build(&state, deal)))
}

#[utoipa::path(
    post,
    path = "/deals/{id}/viewed",
    params(("id" = Uuid, Path, description = "Deal id")),
    responses(
        (status = 200, description = "Deal marked as viewed", body = DealView),
        (status = 403, description = "Deal belongs to another manager", body = ErrorBody)
    )
)]
pub async fn mark_viewed_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state.engine.mark_viewed(deal_id, &actor).await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Rate a closed deal, once.
#[utoipa::path(
    post,
    path = "/deals/{id}/rating",
    params(("id" = Uuid, Path, description = "Deal id")),
    request_body = RatingRequest,
    responses(
        (status = 200, description = "Rating stored", body = DealView),
        (status = 409, description = "Not closed or already rated", body = ErrorBody),
        (status = 422, description = "Rating out of range", body = ErrorBody)
    )
)]
pub async fn rate_deal_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
    Json(req): Json<RatingRequest>,
) -> Result<Json<DealView>, ApiError> {
    let deal = state
        .engine
        .rate(deal_id, &actor, req.rating, req.review.as_deref())
        .await?;
    Ok(Json(DealView::build(&state, deal)))
}

/// Queue an AI analysis now, regardless of the failure cooldown.
#[utoipa::path(
    post,
    path = "/deals/{id}/analysis",
    params(("id" = Uuid, Path, description = "Deal id")),
    responses(
        (status = 202, description = "Analysis queued"),
        (status = 404, description = "No such deal", body = ErrorBody),
        (status = 503, description = "Analysis queue unavailable", body = ErrorBody)
    )
)]
pub async fn request_analysis_handler(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(deal_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.request_analysis(deal_id, &actor).await?;
    Ok(StatusCode::ACCEPTED)
}
