//! services/api/tests/rest_api.rs
//!
//! The manager-facing REST surface: cookie sessions, deal endpoints and the
//! error body shape.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use api_lib::web::auth::seed_supervisors;
use common::{json_body, test_config, TestApp, SUPERVISOR_EMAIL, SUPERVISOR_PASSWORD};
use serde_json::{json, Value};
use uuid::Uuid;

struct Session {
    cookie: String,
    manager_id: Uuid,
}

async fn signup(app: &TestApp, email: &str) -> Session {
    open_session(app, "/auth/signup", email, "correct horse", StatusCode::CREATED).await
}

async fn login(app: &TestApp, email: &str, password: &str) -> Session {
    open_session(app, "/auth/login", email, password, StatusCode::OK).await
}

async fn open_session(
    app: &TestApp,
    uri: &str,
    email: &str,
    password: &str,
    expected: StatusCode,
) -> Session {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "email": email, "password": password }).to_string(),
        ))
        .expect("request");
    let response = tower::ServiceExt::oneshot(app.router.clone(), request)
        .await
        .expect("response");
    assert_eq!(response.status(), expected);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .expect("session cookie")
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let manager_id = json_body(&body)["manager_id"]
        .as_str()
        .and_then(|id| id.parse().ok())
        .expect("manager id");
    Session { cookie, manager_id }
}

async fn call(
    app: &TestApp,
    method: &str,
    uri: &str,
    session: Option<&Session>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, &session.cookie);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");
    let (status, bytes) = app.send(request).await;
    (status, json_body(&bytes))
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new();
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn deal_routes_require_a_session() {
    let app = TestApp::new();
    let (status, body) = call(&app, "GET", "/deals", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let forged = Session {
        cookie: "session=not-a-session".into(),
        manager_id: Uuid::new_v4(),
    };
    let (status, _) = call(&app, "GET", "/deals", Some(&forged), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signup_login_and_logout() {
    let app = TestApp::new();
    let session = signup(&app, "Anna@Example.com").await;

    let (status, me) = call(&app, "GET", "/managers/me", Some(&session), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "anna@example.com");
    assert_eq!(me["role"], "manager");

    let (status, body) = call(
        &app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "email": "anna@example.com", "password": "another one" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, _) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "email": "anna@example.com", "password": "wrong password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "email": "ANNA@example.com", "password": "correct horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["manager_id"], session.manager_id.to_string());

    let (status, _) = call(&app, "POST", "/auth/logout", Some(&session), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/deals", Some(&session), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signup_validates_input() {
    let app = TestApp::new();
    let (status, body) = call(
        &app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "email": "short@example.com", "password": "1234" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(
        &app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "email": "no-at-sign", "password": "long enough" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn claim_and_status_over_http() {
    let app = TestApp::new();
    let deal = app.client_message("mid:h1", "psid-1", "сколько стоит?").await;
    let a = signup(&app, "a@example.com").await;
    let b = signup(&app, "b@example.com").await;

    let (status, deals) = call(&app, "GET", "/deals?priority=true", Some(&a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deals.as_array().map(Vec::len), Some(1));
    assert_eq!(deals[0]["status"], "New");
    assert_eq!(deals[0]["sla"]["breached"], false);

    let claim_uri = format!("/deals/{}/claim", deal.id);
    let (status, view) = call(&app, "POST", &claim_uri, Some(&a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["manager_id"], a.manager_id.to_string());

    let (status, body) = call(&app, "POST", &claim_uri, Some(&b), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_claimed");

    let status_uri = format!("/deals/{}/status", deal.id);
    let (status, body) = call(
        &app,
        "POST",
        &status_uri,
        Some(&b),
        Some(json!({ "status": "InProgress" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "not_assignee");

    let (status, _) = call(
        &app,
        "POST",
        &status_uri,
        Some(&a),
        Some(json!({ "status": "closed-ish" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, view) = call(
        &app,
        "POST",
        &status_uri,
        Some(&a),
        Some(json!({ "status": "Closed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "Closed");

    let (status, body) = call(
        &app,
        "POST",
        &status_uri,
        Some(&a),
        Some(json!({ "status": "InProgress" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "invalid_status_transition");

    let rating_uri = format!("/deals/{}/rating", deal.id);
    let (status, _) = call(&app, "POST", &rating_uri, Some(&a), Some(json!({ "rating": 9 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, view) = call(&app, "POST", &rating_uri, Some(&a), Some(json!({ "rating": 5 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["rating"], 5);

    let activity_uri = format!("/activity?deal_id={}&action=status_changed", deal.id);
    let (status, entries) = call(&app, "GET", &activity_uri, Some(&a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().map(Vec::len), Some(1));
    assert_eq!(entries[0]["actor_id"], a.manager_id.to_string());
}

#[tokio::test]
async fn supervisor_endpoints() {
    let app = TestApp::new();
    let deal = app.client_message("mid:h2", "psid-2", "hello").await;
    assert_eq!(seed_supervisors(&app.state).await.expect("seed"), 1);
    let lead = login(&app, SUPERVISOR_EMAIL, SUPERVISOR_PASSWORD).await;
    let a = signup(&app, "a@example.com").await;

    let (_, me) = call(&app, "GET", "/managers/me", Some(&lead), None).await;
    assert_eq!(me["role"], "supervisor");

    let assign_uri = format!("/deals/{}/assign", deal.id);
    let body = json!({ "manager_id": a.manager_id });
    let (status, err) = call(&app, "POST", &assign_uri, Some(&a), Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"]["code"], "forbidden");
    let (status, view) = call(&app, "POST", &assign_uri, Some(&lead), Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["manager_id"], a.manager_id.to_string());

    let role_uri = format!("/managers/{}/role", a.manager_id);
    let (status, _) = call(&app, "PUT", &role_uri, Some(&a), Some(json!({ "role": "supervisor" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, view) = call(&app, "PUT", &role_uri, Some(&lead), Some(json!({ "role": "supervisor" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["role"], "supervisor");
}

#[tokio::test]
async fn unknown_deal_and_manual_analysis() {
    let app = TestApp::new();
    let session = signup(&app, "a@example.com").await;

    let (status, body) = call(&app, "GET", &format!("/deals/{}", Uuid::new_v4()), Some(&session), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "deal_not_found");

    let deal = app.client_message("mid:h3", "psid-3", "hello").await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/deals/{}/analysis", deal.id),
        Some(&session),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(app.queue.jobs(), vec![deal.id, deal.id]);
}

#[tokio::test]
async fn supervisor_addresses_cannot_be_taken_through_signup() {
    let app = TestApp::new();
    seed_supervisors(&app.state).await.expect("seed");
    let (status, body) = call(
        &app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "email": SUPERVISOR_EMAIL, "password": "attacker pass" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    // Seeding again neither duplicates nor resets the account.
    assert_eq!(seed_supervisors(&app.state).await.expect("reseed"), 0);
    let lead = login(&app, SUPERVISOR_EMAIL, SUPERVISOR_PASSWORD).await;
    let (_, me) = call(&app, "GET", "/managers/me", Some(&lead), None).await;
    assert_eq!(me["role"], "supervisor");
}

#[tokio::test]
async fn signup_never_grants_the_supervisor_role() {
    let app = TestApp::with_config(test_config(&[("SUPERVISOR_PASSWORD_HASH", "")]));
    assert_eq!(seed_supervisors(&app.state).await.expect("seed"), 0);

    let early = signup(&app, SUPERVISOR_EMAIL).await;
    let (_, me) = call(&app, "GET", "/managers/me", Some(&early), None).await;
    assert_eq!(me["role"], "manager");

    let deal = app.client_message("mid:h4", "psid-4", "hello").await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/deals/{}/assign", deal.id),
        Some(&early),
        Some(json!({ "manager_id": early.manager_id })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn existing_managers_are_not_promoted_by_seeding() {
    let app = TestApp::new();
    let early = signup(&app, SUPERVISOR_EMAIL).await;
    assert_eq!(seed_supervisors(&app.state).await.expect("seed"), 0);
    let (_, me) = call(&app, "GET", "/managers/me", Some(&early), None).await;
    assert_eq!(me["role"], "manager");
}
