//! crates/deal_desk_core/src/activity.rs
//!
//! Append-only audit trail. Writes are a best-effort side channel: a failed
//! append is logged and swallowed, never undoing the mutation it describes.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{ActionKind, ActivityFilter, ActivityLogEntry, Actor, RequestOrigin};
use crate::ports::{DatabaseService, PortResult};

pub const DEFAULT_ACTIVITY_LIMIT: i64 = 100;
pub const MAX_ACTIVITY_LIMIT: i64 = 500;

impl ActivityLogEntry {
    /// A system-originated entry with no deal, actor or metadata yet.
    pub fn new(action: ActionKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            deal_id: None,
            actor_id: None,
            action,
            description: description.into(),
            metadata: Value::Object(Default::default()),
            origin: RequestOrigin::default(),
            created_at: Utc::now(),
        }
    }

    pub fn for_deal(mut self, deal_id: Uuid) -> Self {
        self.deal_id = Some(deal_id);
        self
    }

    /// Attributes the entry to `actor`, including the request origin.
    pub fn by(mut self, actor: &Actor) -> Self {
        self.actor_id = Some(actor.id);
        self.origin = actor.origin.clone();
        self
    }

    pub fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct ActivityLog {
    db: Arc<dyn DatabaseService>,
}

impl ActivityLog {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: ActivityLogEntry) {
        if let Err(e) = self.db.insert_activity(&entry).await {
            warn!(
                deal_id = ?entry.deal_id,
                action = entry.action.as_str(),
                "Failed to append activity entry: {:?}",
                e
            );
        }
    }

    /// Newest first; the limit is clamped to `1..=MAX_ACTIVITY_LIMIT`.
    pub async fn list(&self, mut filter: ActivityFilter) -> PortResult<Vec<ActivityLogEntry>> {
        filter.limit = clamp_limit(filter.limit);
        self.db.list_activity(&filter).await
    }
}

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_ACTIVITY_LIMIT
    } else {
        limit.min(MAX_ACTIVITY_LIMIT)
    }
}
