//! crates/deal_desk_core/src/resolver.rs
//!
//! Identity resolution: contact and conversation upserts keyed by provider ids,
//! then the open deal for the conversation, created when there is none.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Contact, Conversation, Deal, InboundMessageEvent};
use crate::ports::{DatabaseService, PortError, PortResult};

/// Everything the lifecycle engine and activity log need about one event's records.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub contact: Contact,
    pub conversation: Conversation,
    /// `None` only when resolution was asked not to open a deal and none existed.
    pub deal: Option<Deal>,
    pub contact_created: bool,
    pub conversation_created: bool,
    pub deal_created: bool,
}

/// Whether resolution may open a new deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealPolicy {
    OpenIfMissing,
    ExistingOnly,
}

pub struct DealResolver {
    db: Arc<dyn DatabaseService>,
}

impl DealResolver {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    pub async fn resolve(
        &self,
        event: &InboundMessageEvent,
        policy: DealPolicy,
    ) -> PortResult<Resolution> {
        let now = Utc::now();
        let contact = self
            .db
            .upsert_contact(&event.contact_id, &event.profile, now)
            .await?;
        let conversation = self
            .db
            .upsert_conversation(
                &event.conversation_id,
                event.platform,
                event.timestamp,
                event.labels.as_deref(),
                now,
            )
            .await?;

        let (deal, deal_created) = match policy {
            DealPolicy::OpenIfMissing => {
                let (deal, created) = self.open_deal(contact.value.id, conversation.value.id).await?;
                (Some(deal), created)
            }
            DealPolicy::ExistingOnly => (self.db.find_open_deal(conversation.value.id).await?, false),
        };

        Ok(Resolution {
            contact: contact.value,
            conversation: conversation.value,
            deal,
            contact_created: contact.created,
            conversation_created: conversation.created,
            deal_created,
        })
    }

    /// Reuses the conversation's open deal or inserts one. Storage allows a single
    /// open deal per conversation, so a lost insert race re-reads the winner's row.
    async fn open_deal(&self, contact_id: Uuid, conversation_id: Uuid) -> PortResult<(Deal, bool)> {
        for _ in 0..2 {
            if let Some(deal) = self.db.find_open_deal(conversation_id).await? {
                return Ok((deal, false));
            }
            let deal = Deal::open(contact_id, conversation_id, Utc::now());
            if self.db.insert_open_deal(&deal).await? {
                return Ok((deal, true));
            }
        }
        Err(PortError::Conflict(format!(
            "Could not settle the open deal for conversation {}",
            conversation_id
        )))
    }
}
