//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use deal_desk_core::domain::{Actor, RequestOrigin};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::web::state::AppState;

/// Reads the `session` cookie value, if any.
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .find_map(|c| c.trim().strip_prefix("session="))
        .filter(|id| !id.is_empty())
}

/// Client address and user agent.
///
/// `x-forwarded-for` is only read when `trust_forwarded_for` is set; otherwise the
/// socket address is recorded and the header is ignored.
pub fn request_origin(req: &Request, trust_forwarded_for: bool) -> RequestOrigin {
    let headers = req.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .filter(|_| trust_forwarded_for)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);
    let socket = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    RequestOrigin {
        ip: forwarded.or(socket),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

/// Middleware that validates the auth session cookie and resolves the acting manager.
///
/// If valid, inserts an `Actor` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_session_id = session_cookie(req.headers()).ok_or(ApiError::Unauthorized)?;

    let manager_id = state
        .db
        .validate_auth_session(auth_session_id)
        .await
        .map_err(|e| {
            debug!("Rejected auth session: {:?}", e);
            ApiError::Unauthorized
        })?;

    let manager = state.db.get_manager(manager_id).await.map_err(|e| {
        error!("Session points at a missing manager: {:?}", e);
        ApiError::Unauthorized
    })?;

    let actor = Actor {
        id: manager.id,
        role: manager.role,
        origin: request_origin(&req, state.config.trust_forwarded_for),
    };
    req.extensions_mut().insert(actor);

    Ok(next.run(req).await)
}
