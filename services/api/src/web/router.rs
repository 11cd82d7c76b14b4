//! services/api/src/web/router.rs
//!
//! Assembles the HTTP application: public, webhook and manager routes.

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::web::{
    activity::list_activity_handler,
    auth::{login_handler, logout_handler, signup_handler},
    deals::{
        assign_deal_handler, claim_deal_handler, get_deal_handler, list_deals_handler,
        mark_viewed_handler, rate_deal_handler, request_analysis_handler, set_reminder_handler,
        set_status_handler, update_note_handler,
    },
    managers::{current_manager_handler, set_role_handler},
    middleware::require_auth,
    rest::{health_handler, ApiDoc},
    state::AppState,
    webhook::{delivery_handler, handshake_handler},
};

fn cors_layer(origin: Option<&str>) -> Option<CorsLayer> {
    let origin = origin?;
    match origin.parse::<HeaderValue>() {
        Ok(origin) => Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
                .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]),
        ),
        Err(e) => {
            warn!("Ignoring invalid CORS_ORIGIN '{}': {}", origin, e);
            None
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/webhooks/meta", get(handshake_handler).post(delivery_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/deals", get(list_deals_handler))
        .route("/deals/{id}", get(get_deal_handler))
        .route("/deals/{id}/claim", post(claim_deal_handler))
        .route("/deals/{id}/assign", post(assign_deal_handler))
        .route("/deals/{id}/status", post(set_status_handler))
        .route("/deals/{id}/note", put(update_note_handler))
        .route("/deals/{id}/reminder", put(set_reminder_handler))
        .route("/deals/{id}/viewed", post(mark_viewed_handler))
        .route("/deals/{id}/rating", post(rate_deal_handler))
        .route("/deals/{id}/analysis", post(request_analysis_handler))
        .route("/activity", get(list_activity_handler))
        .route("/managers/me", get(current_manager_handler))
        .route("/managers/{id}/role", put(set_role_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    let mut api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024));
    if let Some(cors) = cors_layer(state.config.cors_origin.as_deref()) {
        api_router = api_router.layer(cors);
    }
    let api_router = api_router.with_state(state);

    // Merge the API router with the Swagger UI router for a complete application.
    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
