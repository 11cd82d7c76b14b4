//! crates/deal_desk_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ActivityFilter, ActivityLogEntry, ActorRole, AiAnalysis, AnalysisRequest, Contact,
    Conversation, Deal, DealFilter, DealStatus, HistoryMessage, IdempotencyLedgerEntry,
    LedgerOutcome, Manager, ManagerAlert, ManagerCredentials, Platform, ProfileFields,
    WebhookRejection,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// A row returned by an upsert, with whether this call inserted it.
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub value: T,
    pub created: bool,
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Persistence contract. Uniqueness and conditional writes documented below must be
/// enforced by the implementation itself, not by callers.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Manager Management ---
    async fn create_manager(
        &self,
        email: &str,
        hashed_password: &str,
        display_name: Option<&str>,
        role: ActorRole,
    ) -> PortResult<Manager>;

    async fn get_manager_credentials_by_email(&self, email: &str) -> PortResult<ManagerCredentials>;

    async fn get_manager(&self, manager_id: Uuid) -> PortResult<Manager>;

    async fn set_manager_role(&self, manager_id: Uuid, role: ActorRole) -> PortResult<Manager>;

    // --- Auth Methods ---
    async fn create_auth_session(
        &self,
        session_id: &str,
        manager_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Ingestion Records ---

    /// Inserts the entry unless `(source, event_key)` already exists.
    /// Returns `false` on a uniqueness conflict.
    async fn insert_ledger_entry(&self, entry: &IdempotencyLedgerEntry) -> PortResult<bool>;

    async fn update_ledger_outcome(
        &self,
        source: &str,
        event_key: &str,
        outcome: LedgerOutcome,
        detail: Option<&str>,
    ) -> PortResult<()>;

    async fn insert_webhook_rejection(&self, rejection: &WebhookRejection) -> PortResult<()>;

    // --- Contacts and Conversations ---
    async fn upsert_contact(
        &self,
        provider_id: &str,
        profile: &ProfileFields,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Contact>>;

    async fn get_contact(&self, contact_id: Uuid) -> PortResult<Contact>;

    /// `last_activity_at` never moves backwards; labels are replaced only when `Some`.
    async fn upsert_conversation(
        &self,
        provider_conversation_id: &str,
        platform: Platform,
        activity_at: DateTime<Utc>,
        labels: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Conversation>>;

    // --- Deal Management ---
    async fn find_open_deal(&self, conversation_id: Uuid) -> PortResult<Option<Deal>>;

    /// Inserts a new deal. Returns `false` when the conversation already has a
    /// non-Closed deal (at most one may exist).
    async fn insert_open_deal(&self, deal: &Deal) -> PortResult<bool>;

    async fn get_deal(&self, deal_id: Uuid) -> PortResult<Deal>;

    async fn list_deals(&self, filter: &DealFilter) -> PortResult<Vec<Deal>>;

    /// Moves `last_client_message_at`/`last_message_text` forward (never backwards) and
    /// raises the priority flag when `flag_priority` is set and the deal is not Closed.
    async fn update_client_message(
        &self,
        deal_id: Uuid,
        text: &str,
        at: DateTime<Utc>,
        flag_priority: bool,
    ) -> PortResult<Deal>;

    async fn update_manager_response(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal>;

    /// `SET manager_id = $manager WHERE manager_id IS NULL AND status <> 'Closed'`.
    /// `None` when no row matched.
    async fn claim_deal(
        &self,
        deal_id: Uuid,
        manager_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Option<Deal>>;

    async fn assign_deal(
        &self,
        deal_id: Uuid,
        manager_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal>;

    /// Applies the change only while the stored status still equals `from`.
    async fn update_status(
        &self,
        deal_id: Uuid,
        from: DealStatus,
        to: DealStatus,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>>;

    async fn update_note(
        &self,
        deal_id: Uuid,
        note: Option<&str>,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Deal>;

    async fn update_reminder(
        &self,
        deal_id: Uuid,
        reminder_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal>;

    async fn mark_viewed(&self, deal_id: Uuid, now: DateTime<Utc>) -> PortResult<Deal>;

    /// Stores a successful analysis and clears any failure timestamp.
    async fn store_analysis(
        &self,
        deal_id: Uuid,
        analysis: &AiAnalysis,
        at: DateTime<Utc>,
    ) -> PortResult<Deal>;

    /// Stores only the failure timestamp; prior analysis fields are untouched.
    async fn store_analysis_failure(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal>;

    /// `WHERE status = 'Closed' AND rating IS NULL`. `None` when no row matched.
    async fn rate_deal(
        &self,
        deal_id: Uuid,
        rating: u8,
        review: Option<&str>,
        at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>>;

    async fn update_search_text(&self, deal_id: Uuid, search_text: &str) -> PortResult<()>;

    /// Open deals whose last analysis attempt failed before `failed_before`.
    async fn deals_due_for_analysis_retry(
        &self,
        failed_before: DateTime<Utc>,
        limit: i64,
    ) -> PortResult<Vec<Uuid>>;

    // --- Activity Log ---
    async fn insert_activity(&self, entry: &ActivityLogEntry) -> PortResult<()>;

    async fn list_activity(&self, filter: &ActivityFilter) -> PortResult<Vec<ActivityLogEntry>>;
}

/// Why a scoring run produced no usable analysis.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisFailure {
    #[error("analysis provider failed: {0}")]
    Provider(String),
    #[error("analysis response was malformed: {0}")]
    MalformedResponse(String),
    #[error("no messages available to analyze")]
    EmptyHistory,
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Scores a conversation excerpt.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AiAnalysis, AnalysisFailure>;
}

#[async_trait]
pub trait MessageHistoryService: Send + Sync {
    /// Returns up to `limit` most recent messages of the deal's conversation, oldest first.
    async fn recent_messages(&self, deal: &Deal, limit: usize) -> PortResult<Vec<HistoryMessage>>;
}

/// Manager alerts. Implementations must return immediately; delivery failures are
/// theirs to log, and callers never wait on or retry them.
pub trait NotificationService: Send + Sync {
    fn notify(&self, alert: ManagerAlert);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("analysis queue is full")]
    Full,
    #[error("analysis queue is closed")]
    Closed,
}

/// Non-blocking hand-off of analysis work to a background worker.
pub trait AnalysisQueue: Send + Sync {
    fn enqueue(&self, deal_id: Uuid) -> Result<(), QueueError>;
}
