//! services/api/tests/common/mod.rs
//!
//! Shared harness: the full application wired over the in-memory store, with a
//! recording analysis queue and notifier in place of the background worker.

#![allow(dead_code)]

use api_lib::{
    adapters::MemoryAdapter,
    config::Config,
    web::{auth::hash_password, build_router, state::AppState},
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use deal_desk_core::{
    admission::{sign_body, SIGNATURE_HEADER},
    domain::{
        ActivityFilter, ActivityLogEntry, Actor, ActorRole, Deal, ManagerAlert, RequestOrigin,
    },
    ports::{AnalysisQueue, DatabaseService, NotificationService, QueueError},
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const VERIFY_TOKEN: &str = "verify-me";
pub const APP_SECRET: &str = "s3cret";
pub const SUPERVISOR_EMAIL: &str = "lead@example.com";
pub const SUPERVISOR_PASSWORD: &str = "lead password";
pub const PAGE_ID: &str = "page-1";

#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<Uuid>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<Uuid> {
        self.jobs.lock().expect("queue lock").clone()
    }
}

impl AnalysisQueue for RecordingQueue {
    fn enqueue(&self, deal_id: Uuid) -> Result<(), QueueError> {
        self.jobs.lock().expect("queue lock").push(deal_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<ManagerAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<ManagerAlert> {
        self.alerts.lock().expect("notifier lock").clone()
    }
}

impl NotificationService for RecordingNotifier {
    fn notify(&self, alert: ManagerAlert) {
        self.alerts.lock().expect("notifier lock").push(alert);
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub db: Arc<MemoryAdapter>,
    pub queue: Arc<RecordingQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub router: Router,
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let supervisor_hash = hash_password(SUPERVISOR_PASSWORD).expect("supervisor hash");
    let mut vars: HashMap<String, String> = [
        ("DATABASE_URL", "memory:"),
        ("WEBHOOK_VERIFY_TOKEN", VERIFY_TOKEN),
        ("WEBHOOK_APP_SECRET", APP_SECRET),
        ("TRUST_FORWARDED_FOR", "true"),
        ("SUPERVISOR_EMAILS", SUPERVISOR_EMAIL),
        ("SUPERVISOR_PASSWORD_HASH", supervisor_hash.as_str()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).expect("test config")
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config(&[]))
    }

    pub fn with_config(config: Config) -> Self {
        let db = Arc::new(MemoryAdapter::new());
        let queue = Arc::new(RecordingQueue::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let state = Arc::new(
            AppState::new(Arc::new(config), db.clone(), queue.clone(), notifier.clone())
                .expect("app state"),
        );
        let router = build_router(state.clone());
        Self {
            state,
            db,
            queue,
            notifier,
            router,
        }
    }

    /// Sends one request through the full router.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec())
    }

    /// Posts a correctly signed delivery and returns the status and JSON body.
    pub async fn deliver(&self, payload: &Value) -> (StatusCode, Value) {
        let body = payload.to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/meta")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign_body(APP_SECRET, body.as_bytes()))
            .body(Body::from(body))
            .expect("request");
        let (status, bytes) = self.send(request).await;
        (status, json_body(&bytes))
    }

    /// Delivers a client message and returns the deal it landed on.
    pub async fn client_message(&self, mid: &str, psid: &str, text: &str) -> Deal {
        let (status, _) = self.deliver(&meta_message(mid, psid, text, false)).await;
        assert_eq!(status, StatusCode::OK);
        self.open_deal_for(psid).expect("open deal")
    }

    pub fn open_deal_for(&self, psid: &str) -> Option<Deal> {
        let conversation = self
            .db
            .conversation_by_provider_id(&format!("{}:{}", PAGE_ID, psid))?;
        self.db
            .deals()
            .into_iter()
            .find(|d| d.conversation_id == conversation.id && !d.status.is_closed())
    }

    /// Creates a manager account directly in the store.
    pub async fn actor(&self, email: &str, role: ActorRole) -> Actor {
        let manager = self
            .db
            .create_manager(email, "not-a-real-hash", None, role)
            .await
            .expect("manager");
        Actor {
            id: manager.id,
            role,
            origin: RequestOrigin::default(),
        }
    }

    pub async fn activity_for(&self, deal_id: Uuid) -> Vec<ActivityLogEntry> {
        self.db
            .list_activity(&ActivityFilter {
                deal_id: Some(deal_id),
                limit: 100,
                ..Default::default()
            })
            .await
            .expect("activity")
    }
}

/// A Meta Messenger delivery with one messaging item.
pub fn meta_message(mid: &str, psid: &str, text: &str, is_echo: bool) -> Value {
    let (sender, recipient) = if is_echo { (PAGE_ID, psid) } else { (psid, PAGE_ID) };
    json!({
        "object": "page",
        "entry": [{
            "id": PAGE_ID,
            "time": Utc::now().timestamp_millis(),
            "messaging": [meta_item(mid, sender, recipient, text, is_echo)]
        }]
    })
}

pub fn meta_item(mid: &str, sender: &str, recipient: &str, text: &str, is_echo: bool) -> Value {
    json!({
        "sender": { "id": sender },
        "recipient": { "id": recipient },
        "timestamp": Utc::now().timestamp_millis(),
        "message": { "mid": mid, "text": text, "is_echo": is_echo }
    })
}

pub fn json_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
