//! services/api/src/adapters/history.rs
//!
//! Conversation history for AI analysis, served from what the deal row already
//! caches. Providers that expose a message API can replace this adapter.

use async_trait::async_trait;
use deal_desk_core::{
    domain::{Deal, HistoryMessage, MessageDirection},
    ports::{MessageHistoryService, PortResult},
};

#[derive(Clone, Default)]
pub struct CachedHistoryAdapter;

#[async_trait]
impl MessageHistoryService for CachedHistoryAdapter {
    async fn recent_messages(&self, deal: &Deal, limit: usize) -> PortResult<Vec<HistoryMessage>> {
        let cached = deal
            .last_message_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(|text| HistoryMessage {
                direction: MessageDirection::Client,
                text: text.to_string(),
                sent_at: deal.last_client_message_at,
            });
        Ok(cached.into_iter().take(limit).collect())
    }
}
