//! services/api/src/web/rest.rs
//!
//! The health endpoint and the master definition for the OpenAPI specification.

use axum::Json;
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::error::{ErrorBody, ErrorDetail};
use crate::web::{activity, auth, deals, managers, webhook};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        auth::signup_handler,
        auth::login_handler,
        auth::logout_handler,
        deals::list_deals_handler,
        deals::get_deal_handler,
        deals::claim_deal_handler,
        deals::assign_deal_handler,
        deals::set_status_handler,
        deals::update_note_handler,
        deals::set_reminder_handler,
        deals::mark_viewed_handler,
        deals::rate_deal_handler,
        deals::request_analysis_handler,
        activity::list_activity_handler,
        managers::current_manager_handler,
        managers::set_role_handler,
        webhook::handshake_handler,
        webhook::delivery_handler,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorBody,
            ErrorDetail,
            auth::SignupRequest,
            auth::LoginRequest,
            auth::AuthResponse,
            deals::DealView,
            deals::AnalysisView,
            deals::SlaView,
            deals::AssignRequest,
            deals::StatusRequest,
            deals::NoteRequest,
            deals::ReminderRequest,
            deals::RatingRequest,
            activity::ActivityView,
            managers::ManagerView,
            managers::RoleRequest,
            webhook::WebhookAck,
        )
    ),
    tags(
        (name = "Deal Desk API", description = "Inbound messaging webhooks and the manager deal desk.")
    )
)]
pub struct ApiDoc;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: &'static str,
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
