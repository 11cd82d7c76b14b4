//! crates/deal_desk_core/src/pipeline.rs
//!
//! Orchestrates one webhook delivery: admission, then for every provider event in
//! the body the ledger, normalization, identity resolution and the lifecycle engine.
//!
//! Items of a batch are handled independently. Only a ledger that cannot be
//! reached fails the whole delivery, so the provider retries it; every later
//! failure is recorded on the ledger row and acknowledged.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::admission::{Admission, AdmissionGate, AdmissionRejection, HandshakeQuery};
use crate::domain::{
    ActionKind, ActivityLogEntry, InboundMessageEvent, LedgerOutcome, MessageDirection, RequestOrigin,
};
use crate::ledger::{IdempotencyLedger, LedgerDecision};
use crate::lifecycle::DealLifecycleEngine;
use crate::normalizer::{self, UnrecognizedReason};
use crate::ports::{DatabaseService, PortError, PortResult};
use crate::resolver::{DealPolicy, DealResolver};
use crate::settings::SettingsHandle;

/// What happened to one provider event of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed { deal_id: Uuid, deal_created: bool },
    Duplicate,
    Unrecognized { reason: UnrecognizedReason },
    /// A business-side echo for a conversation with no open deal.
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub admission: Option<Admission>,
    pub items: Vec<ItemOutcome>,
}

impl DeliveryReport {
    /// Applied events, skipped echoes included.
    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Processed { .. } | ItemOutcome::Skipped))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Duplicate))
    }

    pub fn unrecognized(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Unrecognized { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|o| pred(o)).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejection),
    #[error("idempotency ledger unavailable: {0}")]
    LedgerUnavailable(PortError),
}

pub struct IngestionPipeline {
    settings: SettingsHandle,
    gate: AdmissionGate,
    ledger: IdempotencyLedger,
    resolver: DealResolver,
    activity: ActivityLog,
    engine: Arc<DealLifecycleEngine>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        settings: SettingsHandle,
        engine: Arc<DealLifecycleEngine>,
    ) -> Self {
        Self {
            settings,
            gate: AdmissionGate::new(db.clone()),
            ledger: IdempotencyLedger::new(db.clone()),
            resolver: DealResolver::new(db.clone()),
            activity: ActivityLog::new(db),
            engine,
        }
    }

    pub async fn handle_handshake(
        &self,
        source: &str,
        query: &HandshakeQuery,
        ip: Option<&str>,
    ) -> Result<String, AdmissionRejection> {
        let settings = self.settings.snapshot();
        let challenge = self.gate.check_handshake(&settings, source, query, ip).await?;
        info!(source, "Webhook subscription verified.");
        Ok(challenge)
    }

    pub async fn handle_delivery(
        &self,
        source: &str,
        signature: Option<&str>,
        body: &[u8],
        origin: &RequestOrigin,
    ) -> Result<DeliveryReport, DeliveryError> {
        let settings = self.settings.snapshot();
        let admission = self
            .gate
            .check_delivery(&settings, source, signature, body, origin.ip.as_deref())
            .await?;

        let mut report = DeliveryReport {
            admission: Some(admission),
            items: Vec::new(),
        };
        for raw in normalizer::split(body) {
            let event_key = raw.event_key();
            let decision = self
                .ledger
                .admit(source, &event_key)
                .await
                .map_err(DeliveryError::LedgerUnavailable)?;
            if decision == LedgerDecision::Duplicate {
                debug!(source, event_key = %event_key, "Duplicate webhook event ignored.");
                report.items.push(ItemOutcome::Duplicate);
                continue;
            }

            let outcome = match normalizer::normalize(&raw) {
                Err(unrecognized) => {
                    info!(source, event_key = %event_key, "Unrecognized webhook event: {}", unrecognized);
                    self.ledger
                        .record_outcome(
                            source,
                            &event_key,
                            LedgerOutcome::Unrecognized,
                            Some(unrecognized.reason.as_str()),
                        )
                        .await;
                    ItemOutcome::Unrecognized {
                        reason: unrecognized.reason,
                    }
                }
                Ok(event) => match self.apply(&event, origin).await {
                    Ok(outcome) => {
                        let detail = matches!(outcome, ItemOutcome::Skipped).then_some("no_open_deal");
                        self.ledger
                            .record_outcome(source, &event_key, LedgerOutcome::Processed, detail)
                            .await;
                        outcome
                    }
                    Err(e) => {
                        warn!(source, event_key = %event_key, "Failed to apply webhook event: {:?}", e);
                        let reason = e.to_string();
                        self.ledger
                            .record_outcome(source, &event_key, LedgerOutcome::Failed, Some(&reason))
                            .await;
                        ItemOutcome::Failed { reason }
                    }
                },
            };
            report.items.push(outcome);
        }
        Ok(report)
    }

    /// Resolves identities and hands the event to the lifecycle engine, then writes
    /// exactly one activity entry for it, stamped with the delivery's origin.
    async fn apply(
        &self,
        event: &InboundMessageEvent,
        origin: &RequestOrigin,
    ) -> PortResult<ItemOutcome> {
        let policy = match event.direction {
            MessageDirection::Client => DealPolicy::OpenIfMissing,
            MessageDirection::Manager => DealPolicy::ExistingOnly,
        };
        let resolution = self.resolver.resolve(event, policy).await?;
        let Some(deal) = resolution.deal else {
            debug!(conversation = %event.conversation_id, "Echo without an open deal skipped.");
            return Ok(ItemOutcome::Skipped);
        };

        let entry = match event.direction {
            MessageDirection::Client => {
                if resolution.deal_created {
                    info!(deal_id = %deal.id, conversation = %event.conversation_id, "New deal opened.");
                    self.engine
                        .announce_new_deal(&deal, resolution.contact.display_name());
                }
                let outcome = self
                    .engine
                    .record_client_message(&deal, &event.text, event.timestamp)
                    .await?;
                let (action, description) = if resolution.deal_created {
                    (ActionKind::DealCreated, "Deal opened from a new conversation")
                } else {
                    (ActionKind::ClientMessage, "Client message received")
                };
                ActivityLogEntry::new(action, description).with_metadata(json!({
                    "platform": event.platform.as_str(),
                    "priority": outcome.deal.is_priority,
                    "priority_raised": outcome.priority_raised,
                    "matched_keywords": outcome.matched_keywords,
                    "analysis_scheduled": outcome.analysis_scheduled,
                    "contact_created": resolution.contact_created,
                    "conversation_created": resolution.conversation_created,
                }))
            }
            MessageDirection::Manager => {
                self.engine.record_manager_reply(&deal, event.timestamp).await?;
                ActivityLogEntry::new(ActionKind::ManagerReply, "Manager reply sent").with_metadata(
                    json!({
                        "platform": event.platform.as_str(),
                        "contact_created": resolution.contact_created,
                    }),
                )
            }
        };
        self.activity
            .append(entry.for_deal(deal.id).with_origin(origin.clone()))
            .await;

        Ok(ItemOutcome::Processed {
            deal_id: deal.id,
            deal_created: resolution.deal_created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_skipped_echoes_as_processed() {
        let report = DeliveryReport {
            admission: Some(Admission::Verified),
            items: vec![
                ItemOutcome::Processed {
                    deal_id: Uuid::new_v4(),
                    deal_created: true,
                },
                ItemOutcome::Skipped,
                ItemOutcome::Duplicate,
                ItemOutcome::Unrecognized {
                    reason: UnrecognizedReason::NotAMessage,
                },
                ItemOutcome::Failed {
                    reason: "boom".into(),
                },
            ],
        };
        assert_eq!(report.processed(), 2);
        assert_eq!(report.duplicates(), 1);
        assert_eq!(report.unrecognized(), 1);
        assert_eq!(report.failed(), 1);
    }
}
