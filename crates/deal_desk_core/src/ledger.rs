//! crates/deal_desk_core/src/ledger.rs
//!
//! The idempotency ledger. Admission is a single insert-if-absent against the
//! storage-level uniqueness of `(source, event_key)`; there is no application lock.

use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::domain::{IdempotencyLedgerEntry, LedgerOutcome};
use crate::ports::{DatabaseService, PortResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDecision {
    Fresh,
    Duplicate,
}

pub struct IdempotencyLedger {
    db: Arc<dyn DatabaseService>,
}

impl IdempotencyLedger {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    /// Records the event before any side effect. A uniqueness conflict is a
    /// `Duplicate`, not an error; only storage failures are errors.
    pub async fn admit(&self, source: &str, event_key: &str) -> PortResult<LedgerDecision> {
        let entry = IdempotencyLedgerEntry {
            source: source.to_string(),
            event_key: event_key.to_string(),
            received_at: Utc::now(),
            outcome: LedgerOutcome::Received,
            outcome_detail: None,
        };
        if self.db.insert_ledger_entry(&entry).await? {
            Ok(LedgerDecision::Fresh)
        } else {
            Ok(LedgerDecision::Duplicate)
        }
    }

    /// Best-effort outcome bookkeeping; the admission itself already stands.
    pub async fn record_outcome(
        &self,
        source: &str,
        event_key: &str,
        outcome: LedgerOutcome,
        detail: Option<&str>,
    ) {
        if let Err(e) = self
            .db
            .update_ledger_outcome(source, event_key, outcome, detail)
            .await
        {
            warn!(source, event_key, "Failed to record ledger outcome: {:?}", e);
        }
    }
}
