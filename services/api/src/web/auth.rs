//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for manager signup, login, and logout.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use deal_desk_core::{domain::ActorRole, ports::PortError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::error::{ApiError, ErrorBody};
use crate::web::{middleware::session_cookie, state::AppState};

const SESSION_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 8;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub manager_id: Uuid,
    pub email: String,
    pub role: String,
}

//=========================================================================================
// Helpers
//=========================================================================================

async fn start_session(state: &AppState, manager_id: Uuid) -> Result<String, ApiError> {
    let auth_session_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(SESSION_DAYS);
    state
        .db
        .create_auth_session(&auth_session_id, manager_id, expires_at)
        .await?;
    Ok(format!(
        "session={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        auth_session_id,
        Duration::days(SESSION_DAYS).num_seconds()
    ))
}

fn invalid_credentials() -> ApiError {
    ApiError::Port(PortError::Unauthorized)
}

/// Hashes a password into an Argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            ApiError::Internal("Failed to hash password".to_string())
        })
}

//=========================================================================================
// Supervisor Bootstrap
//=========================================================================================

/// Creates the supervisor accounts named in `SUPERVISOR_EMAILS` that do not exist yet,
/// using `SUPERVISOR_PASSWORD_HASH` as their password. Returns how many were created.
///
/// Existing accounts are never promoted here; a manager that registered one of these
/// addresses stays a manager until a supervisor changes the role.
pub async fn seed_supervisors(state: &AppState) -> Result<usize, ApiError> {
    let emails = &state.config.supervisor_emails;
    let Some(password_hash) = state.config.supervisor_password_hash.as_deref() else {
        if !emails.is_empty() {
            warn!("SUPERVISOR_EMAILS is set without SUPERVISOR_PASSWORD_HASH; no supervisors seeded.");
        }
        return Ok(0);
    };
    PasswordHash::new(password_hash).map_err(|e| {
        ConfigError::InvalidValue("SUPERVISOR_PASSWORD_HASH".to_string(), e.to_string())
    })?;

    let mut created = 0;
    for email in emails {
        match state.db.get_manager_credentials_by_email(email).await {
            Ok(creds) => {
                let existing = state.db.get_manager(creds.manager_id).await?;
                if existing.role != ActorRole::Supervisor {
                    warn!(
                        manager_id = %existing.id,
                        "{} is registered as a manager; promote it through the role endpoint.",
                        email
                    );
                }
            }
            Err(PortError::NotFound(_)) => {
                match state
                    .db
                    .create_manager(email, password_hash, None, ActorRole::Supervisor)
                    .await
                {
                    Ok(manager) => {
                        info!(manager_id = %manager.id, "Supervisor account seeded.");
                        created += 1;
                    }
                    Err(PortError::Conflict(_)) => {
                        warn!("{} was registered while seeding; left unchanged.", email)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(created)
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a new manager account
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Manager created successfully", body = AuthResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 409, description = "Email already registered", body = ErrorBody)
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ApiError::BadRequest("A valid email is required".to_string()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let password_hash = hash_password(&req.password)?;
    let role = ActorRole::Manager;
    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let manager = state
        .db
        .create_manager(&email, &password_hash, display_name, role)
        .await?;
    info!(manager_id = %manager.id, role = role.as_str(), "Manager signed up.");

    let cookie = start_session(&state, manager.id).await?;
    let response = AuthResponse {
        manager_id: manager.id,
        email: manager.email,
        role: manager.role.as_str().to_string(),
    };
    Ok((StatusCode::CREATED, [(header::SET_COOKIE, cookie)], Json(response)))
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody)
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let creds = state
        .db
        .get_manager_credentials_by_email(&email)
        .await
        .map_err(|e| match e {
            PortError::NotFound(_) => invalid_credentials(),
            other => ApiError::Port(other),
        })?;

    let parsed_hash = PasswordHash::new(&creds.hashed_password).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        ApiError::Internal("Authentication error".to_string())
    })?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        return Err(invalid_credentials());
    }

    let manager = state.db.get_manager(creds.manager_id).await?;
    let cookie = start_session(&state, manager.id).await?;
    let response = AuthResponse {
        manager_id: manager.id,
        email: manager.email,
        role: manager.role.as_str().to_string(),
    };
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(response)))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session", body = ErrorBody)
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth_session_id = session_cookie(&headers).ok_or(ApiError::Unauthorized)?;
    state.db.delete_auth_session(auth_session_id).await?;

    let cookie = "session=; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=0";
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie.to_string())]))
}
