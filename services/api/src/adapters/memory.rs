//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of `DatabaseService`, selected with
//! `DATABASE_URL=memory:` and used by the integration tests.
//!
//! All state sits behind one mutex, so every method is atomic and the uniqueness
//! rules and conditional writes of the Postgres schema hold here as well.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deal_desk_core::domain::{
    ActivityFilter, ActivityLogEntry, ActorRole, AiAnalysis, Contact, Conversation, Deal,
    DealFilter, DealStatus, IdempotencyLedgerEntry, LedgerOutcome, Manager, ManagerCredentials,
    Platform, ProfileFields, WebhookRejection,
};
use deal_desk_core::ports::{DatabaseService, PortError, PortResult, Upserted};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    managers: HashMap<Uuid, (Manager, String)>,
    auth_sessions: HashMap<String, (Uuid, DateTime<Utc>)>,
    ledger: HashMap<(String, String), IdempotencyLedgerEntry>,
    rejections: Vec<WebhookRejection>,
    contacts: HashMap<String, Contact>,
    conversations: HashMap<String, Conversation>,
    deals: HashMap<Uuid, Deal>,
    activity: Vec<ActivityLogEntry>,
}

impl MemoryState {
    fn deal_mut(&mut self, deal_id: Uuid) -> PortResult<&mut Deal> {
        self.deals
            .get_mut(&deal_id)
            .ok_or_else(|| PortError::NotFound(format!("Deal {} not found", deal_id)))
    }

    fn has_other_open_deal(&self, conversation_id: Uuid, except: Uuid) -> bool {
        self.deals.values().any(|d| {
            d.conversation_id == conversation_id && d.id != except && !d.status.is_closed()
        })
    }
}

#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    ledger_unavailable: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PortResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PortError::Unexpected("in-memory store lock poisoned".to_string()))
    }

    /// Makes ledger writes fail as if the database were unreachable.
    pub fn set_ledger_unavailable(&self, unavailable: bool) {
        self.ledger_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn ledger_entry(&self, source: &str, event_key: &str) -> Option<IdempotencyLedgerEntry> {
        self.lock()
            .ok()?
            .ledger
            .get(&(source.to_string(), event_key.to_string()))
            .cloned()
    }

    pub fn rejections(&self) -> Vec<WebhookRejection> {
        self.lock().map(|s| s.rejections.clone()).unwrap_or_default()
    }

    pub fn deals(&self) -> Vec<Deal> {
        self.lock()
            .map(|s| s.deals.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contact_by_provider_id(&self, provider_id: &str) -> Option<Contact> {
        self.lock().ok()?.contacts.get(provider_id).cloned()
    }

    pub fn conversation_by_provider_id(&self, provider_conversation_id: &str) -> Option<Conversation> {
        self.lock()
            .ok()?
            .conversations
            .get(provider_conversation_id)
            .cloned()
    }

    /// Test and fixture helper: overwrites a stored deal.
    pub fn put_deal(&self, deal: Deal) -> PortResult<()> {
        self.lock()?.deals.insert(deal.id, deal);
        Ok(())
    }
}

fn max_time(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> DateTime<Utc> {
    current.map_or(at, |c| c.max(at))
}

#[async_trait]
impl DatabaseService for MemoryAdapter {
    // --- Manager Management ---

    async fn create_manager(
        &self,
        email: &str,
        hashed_password: &str,
        display_name: Option<&str>,
        role: ActorRole,
    ) -> PortResult<Manager> {
        let email = email.trim().to_lowercase();
        let mut state = self.lock()?;
        if state.managers.values().any(|(m, _)| m.email == email) {
            return Err(PortError::Conflict(format!("Email {} is already registered", email)));
        }
        let manager = Manager {
            id: Uuid::new_v4(),
            email,
            display_name: display_name.map(str::to_string),
            role,
            created_at: Utc::now(),
        };
        state
            .managers
            .insert(manager.id, (manager.clone(), hashed_password.to_string()));
        Ok(manager)
    }

    async fn get_manager_credentials_by_email(&self, email: &str) -> PortResult<ManagerCredentials> {
        let email = email.trim().to_lowercase();
        self.lock()?
            .managers
            .values()
            .find(|(m, _)| m.email == email)
            .map(|(m, hash)| ManagerCredentials {
                manager_id: m.id,
                email: m.email.clone(),
                hashed_password: hash.clone(),
            })
            .ok_or_else(|| PortError::NotFound(format!("Manager {} not found", email)))
    }

    async fn get_manager(&self, manager_id: Uuid) -> PortResult<Manager> {
        self.lock()?
            .managers
            .get(&manager_id)
            .map(|(m, _)| m.clone())
            .ok_or_else(|| PortError::NotFound(format!("Manager {} not found", manager_id)))
    }

    async fn set_manager_role(&self, manager_id: Uuid, role: ActorRole) -> PortResult<Manager> {
        let mut state = self.lock()?;
        let (manager, _) = state
            .managers
            .get_mut(&manager_id)
            .ok_or_else(|| PortError::NotFound(format!("Manager {} not found", manager_id)))?;
        manager.role = role;
        Ok(manager.clone())
    }

    // --- Auth Methods ---

    async fn create_auth_session(
        &self,
        session_id: &str,
        manager_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.lock()?
            .auth_sessions
            .insert(session_id.to_string(), (manager_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        match self.lock()?.auth_sessions.get(session_id) {
            Some((manager_id, expires_at)) if *expires_at > Utc::now() => Ok(*manager_id),
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.lock()?.auth_sessions.remove(session_id);
        Ok(())
    }

    // --- Ingestion Records ---

    async fn insert_ledger_entry(&self, entry: &IdempotencyLedgerEntry) -> PortResult<bool> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("ledger storage unavailable".to_string()));
        }
        let mut state = self.lock()?;
        let key = (entry.source.clone(), entry.event_key.clone());
        if state.ledger.contains_key(&key) {
            return Ok(false);
        }
        state.ledger.insert(key, entry.clone());
        Ok(true)
    }

    async fn update_ledger_outcome(
        &self,
        source: &str,
        event_key: &str,
        outcome: LedgerOutcome,
        detail: Option<&str>,
    ) -> PortResult<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state
            .ledger
            .get_mut(&(source.to_string(), event_key.to_string()))
        {
            entry.outcome = outcome;
            entry.outcome_detail = detail.map(str::to_string);
        }
        Ok(())
    }

    async fn insert_webhook_rejection(&self, rejection: &WebhookRejection) -> PortResult<()> {
        self.lock()?.rejections.push(rejection.clone());
        Ok(())
    }

    // --- Contacts and Conversations ---

    async fn upsert_contact(
        &self,
        provider_id: &str,
        profile: &ProfileFields,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Contact>> {
        let mut state = self.lock()?;
        if let Some(contact) = state.contacts.get_mut(provider_id) {
            if profile.first_name.is_some() {
                contact.first_name = profile.first_name.clone();
            }
            if profile.last_name.is_some() {
                contact.last_name = profile.last_name.clone();
            }
            contact.updated_at = now;
            return Ok(Upserted {
                value: contact.clone(),
                created: false,
            });
        }
        let contact = Contact {
            id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            created_at: now,
            updated_at: now,
        };
        state.contacts.insert(provider_id.to_string(), contact.clone());
        Ok(Upserted {
            value: contact,
            created: true,
        })
    }

    async fn get_contact(&self, contact_id: Uuid) -> PortResult<Contact> {
        self.lock()?
            .contacts
            .values()
            .find(|c| c.id == contact_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Contact {} not found", contact_id)))
    }

    async fn upsert_conversation(
        &self,
        provider_conversation_id: &str,
        platform: Platform,
        activity_at: DateTime<Utc>,
        labels: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Conversation>> {
        let mut state = self.lock()?;
        if let Some(conversation) = state.conversations.get_mut(provider_conversation_id) {
            conversation.last_activity_at = conversation.last_activity_at.max(activity_at);
            if let Some(labels) = labels {
                conversation.labels = labels.to_vec();
            }
            return Ok(Upserted {
                value: conversation.clone(),
                created: false,
            });
        }
        let conversation = Conversation {
            id: Uuid::new_v4(),
            provider_conversation_id: provider_conversation_id.to_string(),
            platform,
            last_activity_at: activity_at,
            labels: labels.map(<[String]>::to_vec).unwrap_or_default(),
            created_at: now,
        };
        state
            .conversations
            .insert(provider_conversation_id.to_string(), conversation.clone());
        Ok(Upserted {
            value: conversation,
            created: true,
        })
    }

    // --- Deal Management ---

    async fn find_open_deal(&self, conversation_id: Uuid) -> PortResult<Option<Deal>> {
        Ok(self
            .lock()?
            .deals
            .values()
            .find(|d| d.conversation_id == conversation_id && !d.status.is_closed())
            .cloned())
    }

    async fn insert_open_deal(&self, deal: &Deal) -> PortResult<bool> {
        let mut state = self.lock()?;
        if state.has_other_open_deal(deal.conversation_id, deal.id) {
            return Ok(false);
        }
        state.deals.insert(deal.id, deal.clone());
        Ok(true)
    }

    async fn get_deal(&self, deal_id: Uuid) -> PortResult<Deal> {
        Ok(self.lock()?.deal_mut(deal_id)?.clone())
    }

    async fn list_deals(&self, filter: &DealFilter) -> PortResult<Vec<Deal>> {
        let query = filter.query.as_deref().map(str::to_lowercase);
        let mut deals: Vec<Deal> = self
            .lock()?
            .deals
            .values()
            .filter(|d| filter.status.map_or(true, |s| d.status == s))
            .filter(|d| filter.manager_id.map_or(true, |m| d.manager_id == Some(m)))
            .filter(|d| filter.priority.map_or(true, |p| d.is_priority == p))
            .filter(|d| query.as_deref().map_or(true, |q| d.search_text.contains(q)))
            .cloned()
            .collect();
        deals.sort_by(|a, b| {
            b.is_priority
                .cmp(&a.is_priority)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        Ok(deals
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_client_message(
        &self,
        deal_id: Uuid,
        text: &str,
        at: DateTime<Utc>,
        flag_priority: bool,
    ) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        if deal.last_client_message_at.map_or(true, |last| last <= at) {
            deal.last_message_text = Some(text.to_string());
        }
        deal.last_client_message_at = Some(max_time(deal.last_client_message_at, at));
        if flag_priority && !deal.status.is_closed() {
            deal.is_priority = true;
        }
        deal.updated_at = Utc::now();
        Ok(deal.clone())
    }

    async fn update_manager_response(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.last_manager_response_at = Some(max_time(deal.last_manager_response_at, at));
        deal.updated_at = Utc::now();
        Ok(deal.clone())
    }

    async fn claim_deal(
        &self,
        deal_id: Uuid,
        manager_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let mut state = self.lock()?;
        let Some(deal) = state.deals.get_mut(&deal_id) else {
            return Ok(None);
        };
        if deal.manager_id.is_some() || deal.status.is_closed() {
            return Ok(None);
        }
        deal.manager_id = Some(manager_id);
        deal.updated_at = now;
        Ok(Some(deal.clone()))
    }

    async fn assign_deal(
        &self,
        deal_id: Uuid,
        manager_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.manager_id = manager_id;
        deal.updated_at = now;
        Ok(deal.clone())
    }

    async fn update_status(
        &self,
        deal_id: Uuid,
        from: DealStatus,
        to: DealStatus,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let mut state = self.lock()?;
        let Some(current) = state.deals.get(&deal_id) else {
            return Ok(None);
        };
        if current.status != from {
            return Ok(None);
        }
        if from.is_closed() && !to.is_closed() && state.has_other_open_deal(current.conversation_id, deal_id) {
            return Err(PortError::Conflict(format!(
                "Deal {} would be a second open deal for its conversation",
                deal_id
            )));
        }
        let deal = state.deal_mut(deal_id)?;
        deal.status = to;
        deal.last_manager_response_at = Some(max_time(deal.last_manager_response_at, responded_at));
        deal.updated_at = responded_at;
        Ok(Some(deal.clone()))
    }

    async fn update_note(
        &self,
        deal_id: Uuid,
        note: Option<&str>,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.note = note.map(str::to_string);
        deal.last_manager_response_at = Some(max_time(deal.last_manager_response_at, responded_at));
        deal.updated_at = responded_at;
        Ok(deal.clone())
    }

    async fn update_reminder(
        &self,
        deal_id: Uuid,
        reminder_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.reminder_at = reminder_at;
        deal.updated_at = now;
        Ok(deal.clone())
    }

    async fn mark_viewed(&self, deal_id: Uuid, now: DateTime<Utc>) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.is_viewed = true;
        deal.updated_at = now;
        Ok(deal.clone())
    }

    async fn store_analysis(
        &self,
        deal_id: Uuid,
        analysis: &AiAnalysis,
        at: DateTime<Utc>,
    ) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.analysis = Some(analysis.clone());
        deal.analyzed_at = Some(at);
        deal.analysis_failed_at = None;
        deal.updated_at = at;
        Ok(deal.clone())
    }

    async fn store_analysis_failure(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal> {
        let mut state = self.lock()?;
        let deal = state.deal_mut(deal_id)?;
        deal.analysis_failed_at = Some(at);
        Ok(deal.clone())
    }

    async fn rate_deal(
        &self,
        deal_id: Uuid,
        rating: u8,
        review: Option<&str>,
        at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let mut state = self.lock()?;
        let Some(deal) = state.deals.get_mut(&deal_id) else {
            return Ok(None);
        };
        if !deal.status.is_closed() || deal.rating.is_some() {
            return Ok(None);
        }
        deal.rating = Some(rating);
        deal.review = review.map(str::to_string);
        deal.rated_at = Some(at);
        deal.updated_at = at;
        Ok(Some(deal.clone()))
    }

    async fn update_search_text(&self, deal_id: Uuid, search_text: &str) -> PortResult<()> {
        self.lock()?.deal_mut(deal_id)?.search_text = search_text.to_string();
        Ok(())
    }

    async fn deals_due_for_analysis_retry(
        &self,
        failed_before: DateTime<Utc>,
        limit: i64,
    ) -> PortResult<Vec<Uuid>> {
        let state = self.lock()?;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .deals
            .values()
            .filter(|d| !d.status.is_closed())
            .filter_map(|d| d.analysis_failed_at.map(|at| (at, d.id)))
            .filter(|(at, _)| *at <= failed_before)
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    // --- Activity Log ---

    async fn insert_activity(&self, entry: &ActivityLogEntry) -> PortResult<()> {
        self.lock()?.activity.push(entry.clone());
        Ok(())
    }

    async fn list_activity(&self, filter: &ActivityFilter) -> PortResult<Vec<ActivityLogEntry>> {
        let state = self.lock()?;
        let mut entries: Vec<ActivityLogEntry> = state
            .activity
            .iter()
            .filter(|e| filter.deal_id.map_or(true, |id| e.deal_id == Some(id)))
            .filter(|e| filter.actor_id.map_or(true, |id| e.actor_id == Some(id)))
            .filter(|e| filter.action.map_or(true, |a| e.action == a))
            .filter(|e| filter.from.map_or(true, |from| e.created_at >= from))
            .filter(|e| filter.to.map_or(true, |to| e.created_at < to))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for entries sharing a timestamp.
        entries.reverse();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(filter.limit.max(0) as usize);
        Ok(entries)
    }
}
