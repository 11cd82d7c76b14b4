//! services/api/src/web/webhook.rs
//!
//! Provider-facing webhook endpoints: the subscription handshake and deliveries.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use deal_desk_core::{
    admission::{AdmissionRejection, HandshakeQuery, SIGNATURE_HEADER},
    pipeline::DeliveryError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::error::ErrorBody;
use crate::web::{middleware::request_origin, state::AppState};

/// Ledger source name for Meta (Messenger and Instagram) deliveries.
pub const META_SOURCE: &str = "meta";

const MAX_DELIVERY_BYTES: usize = 1024 * 1024;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HandshakeParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Acknowledgement of a delivery. Counts are per provider event in the body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub status: String,
    pub processed: usize,
    pub duplicates: usize,
    pub unrecognized: usize,
    pub failed: usize,
}

fn rejection_response(rejection: AdmissionRejection) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorBody::new(rejection.code(), rejection.to_string())),
    )
        .into_response()
}

//=========================================================================================
// Handlers
//=========================================================================================

/// GET /webhooks/meta - Subscription handshake
#[utoipa::path(
    get,
    path = "/webhooks/meta",
    params(HandshakeParams),
    responses(
        (status = 200, description = "Challenge echoed", body = String),
        (status = 403, description = "Verification token mismatch", body = ErrorBody)
    )
)]
pub async fn handshake_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HandshakeParams>,
    req: Request,
) -> Response {
    let origin = request_origin(&req, state.config.trust_forwarded_for);
    let query = HandshakeQuery {
        mode: params.mode,
        verify_token: params.verify_token,
        challenge: params.challenge,
    };
    match state
        .pipeline
        .handle_handshake(META_SOURCE, &query, origin.ip.as_deref())
        .await
    {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(rejection) => rejection_response(rejection),
    }
}

/// POST /webhooks/meta - Message delivery
///
/// The raw body is verified against `X-Hub-Signature-256` before it is parsed.
#[utoipa::path(
    post,
    path = "/webhooks/meta",
    request_body(content = String, content_type = "application/json", description = "Raw provider payload"),
    params(
        ("x-hub-signature-256" = Option<String>, Header, description = "sha256=<hex HMAC of the body>")
    ),
    responses(
        (status = 200, description = "Delivery acknowledged", body = WebhookAck),
        (status = 403, description = "Signature missing or invalid", body = ErrorBody),
        (status = 500, description = "Idempotency ledger unavailable", body = ErrorBody)
    )
)]
pub async fn delivery_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let origin = request_origin(&req, state.config.trust_forwarded_for);
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: Bytes = match axum::body::to_bytes(req.into_body(), MAX_DELIVERY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("unreadable_body", e.to_string())),
            )
                .into_response()
        }
    };

    match state
        .pipeline
        .handle_delivery(META_SOURCE, signature.as_deref(), &body, &origin)
        .await
    {
        Ok(report) => Json(WebhookAck {
            status: "ok".to_string(),
            processed: report.processed(),
            duplicates: report.duplicates(),
            unrecognized: report.unrecognized(),
            failed: report.failed(),
        })
        .into_response(),
        Err(DeliveryError::Rejected(rejection)) => rejection_response(rejection),
        Err(DeliveryError::LedgerUnavailable(e)) => {
            error!("Webhook delivery not recorded: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new(
                    "ledger_unavailable",
                    "delivery could not be recorded; retry later",
                )),
            )
                .into_response()
        }
    }
}
