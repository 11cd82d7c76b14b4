//! crates/deal_desk_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database; the few enums that cross the
//! wire carry stable string tokens through `as_str` / `FromStr`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Customer Identity
//=========================================================================================

/// An external customer, keyed by the provider-scoped id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: Uuid,
    /// Stable id within the messaging provider. Never changes once stored.
    pub provider_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Joins first and last name; `None` until the provider has enriched the profile.
    pub fn display_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// The messaging platforms a conversation can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Messenger,
    Instagram,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Messenger => "messenger",
            Platform::Instagram => "instagram",
        }
    }
}

impl FromStr for Platform {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "messenger" | "facebook" | "page" => Ok(Platform::Messenger),
            "instagram" => Ok(Platform::Instagram),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// A provider-side thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub provider_conversation_id: String,
    pub platform: Platform,
    pub last_activity_at: DateTime<Utc>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Deal
//=========================================================================================

/// Lifecycle status of a deal. The string tokens are stable storage and API values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealStatus {
    New,
    InProgress,
    Closed,
}

impl DealStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::New => "New",
            DealStatus::InProgress => "InProgress",
            DealStatus::Closed => "Closed",
        }
    }

    pub fn is_closed(self) -> bool {
        self == DealStatus::Closed
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(DealStatus::New),
            "InProgress" => Ok(DealStatus::InProgress),
            "Closed" => Ok(DealStatus::Closed),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// Returned when a stored or submitted token does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown token '{0}'")]
pub struct UnknownToken(pub String);

/// Result of one successful AI analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub summary: String,
    /// Purchase likelihood, 0..=100.
    pub score: u8,
    pub intent: String,
    pub objections: Vec<String>,
    pub next_action: String,
}

/// The unit of work for a manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub conversation_id: Uuid,
    pub manager_id: Option<Uuid>,
    pub status: DealStatus,
    pub is_priority: bool,
    pub is_viewed: bool,
    pub note: Option<String>,
    pub reminder_at: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
    pub last_client_message_at: Option<DateTime<Utc>>,
    pub last_manager_response_at: Option<DateTime<Utc>>,
    pub analysis: Option<AiAnalysis>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analysis_failed_at: Option<DateTime<Utc>>,
    pub rating: Option<u8>,
    pub review: Option<String>,
    pub rated_at: Option<DateTime<Utc>>,
    pub search_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// A fresh, unassigned deal in status `New`.
    pub fn open(contact_id: Uuid, conversation_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            conversation_id,
            manager_id: None,
            status: DealStatus::New,
            is_priority: false,
            is_viewed: false,
            note: None,
            reminder_at: None,
            last_message_text: None,
            last_client_message_at: None,
            last_manager_response_at: None,
            analysis: None,
            analyzed_at: None,
            analysis_failed_at: None,
            rating: None,
            review: None,
            rated_at: None,
            search_text: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Criteria for listing deals.
#[derive(Debug, Clone, Default)]
pub struct DealFilter {
    pub status: Option<DealStatus>,
    pub manager_id: Option<Uuid>,
    pub priority: Option<bool>,
    /// Substring matched against the search projection.
    pub query: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

//=========================================================================================
// Actors
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Manager,
    Supervisor,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Manager => "manager",
            ActorRole::Supervisor => "supervisor",
        }
    }
}

impl FromStr for ActorRole {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(ActorRole::Manager),
            "supervisor" => Ok(ActorRole::Supervisor),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// Where a request came from, recorded on activity entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// The authenticated person performing a manager-facing action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
    pub origin: RequestOrigin,
}

impl Actor {
    pub fn is_privileged(&self) -> bool {
        self.role == ActorRole::Supervisor
    }
}

// Represents a manager account - used throughout app
#[derive(Debug, Clone)]
pub struct Manager {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: ActorRole,
    pub created_at: DateTime<Utc>,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct ManagerCredentials {
    pub manager_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

//=========================================================================================
// Activity Log
//=========================================================================================

/// Kinds of observable mutation recorded in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DealCreated,
    ClientMessage,
    ManagerReply,
    Assigned,
    StatusChanged,
    NoteUpdated,
    ReminderSet,
    Viewed,
    AiAnalyzed,
    AiAnalysisFailed,
    Rated,
    RoleChanged,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::DealCreated => "deal_created",
            ActionKind::ClientMessage => "client_message",
            ActionKind::ManagerReply => "manager_reply",
            ActionKind::Assigned => "assigned",
            ActionKind::StatusChanged => "status_changed",
            ActionKind::NoteUpdated => "note_updated",
            ActionKind::ReminderSet => "reminder_set",
            ActionKind::Viewed => "viewed",
            ActionKind::AiAnalyzed => "ai_analyzed",
            ActionKind::AiAnalysisFailed => "ai_analysis_failed",
            ActionKind::Rated => "rated",
            ActionKind::RoleChanged => "role_changed",
        }
    }
}

impl FromStr for ActionKind {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "deal_created" => ActionKind::DealCreated,
            "client_message" => ActionKind::ClientMessage,
            "manager_reply" => ActionKind::ManagerReply,
            "assigned" => ActionKind::Assigned,
            "status_changed" => ActionKind::StatusChanged,
            "note_updated" => ActionKind::NoteUpdated,
            "reminder_set" => ActionKind::ReminderSet,
            "viewed" => ActionKind::Viewed,
            "ai_analyzed" => ActionKind::AiAnalyzed,
            "ai_analysis_failed" => ActionKind::AiAnalysisFailed,
            "rated" => ActionKind::Rated,
            "role_changed" => ActionKind::RoleChanged,
            other => return Err(UnknownToken(other.to_string())),
        };
        Ok(kind)
    }
}

/// An immutable audit fact.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub deal_id: Option<Uuid>,
    /// `None` for system-originated facts (webhook ingestion, AI worker).
    pub actor_id: Option<Uuid>,
    pub action: ActionKind,
    pub description: String,
    pub metadata: serde_json::Value,
    pub origin: RequestOrigin,
    pub created_at: DateTime<Utc>,
}

/// Read-side filter for the activity log. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub deal_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub action: Option<ActionKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
}

//=========================================================================================
// Ingestion Records
//=========================================================================================

/// What finally happened to a ledger-admitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Received,
    Processed,
    Unrecognized,
    Failed,
}

impl LedgerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerOutcome::Received => "received",
            LedgerOutcome::Processed => "processed",
            LedgerOutcome::Unrecognized => "unrecognized",
            LedgerOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyLedgerEntry {
    pub source: String,
    pub event_key: String,
    pub received_at: DateTime<Utc>,
    pub outcome: LedgerOutcome,
    pub outcome_detail: Option<String>,
}

/// Persisted on every failed admission.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRejection {
    pub id: Uuid,
    pub source: String,
    pub reason: String,
    pub ip: Option<String>,
    pub body_preview: String,
    pub created_at: DateTime<Utc>,
}

/// Which side of the conversation authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Sent by the customer.
    Client,
    /// Sent from the business side and echoed back by the provider.
    Manager,
}

/// Optional profile data some payload shapes carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Canonical, provider-independent shape of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessageEvent {
    pub conversation_id: String,
    pub platform: Platform,
    pub contact_id: String,
    pub direction: MessageDirection,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub profile: ProfileFields,
    /// `Some` only when the payload carries a label set.
    pub labels: Option<Vec<String>>,
}

//=========================================================================================
// Analysis and Alerts
//=========================================================================================

/// One message handed to the scoring model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub direction: MessageDirection,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Input to the scoring model.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub deal_id: Uuid,
    pub messages: Vec<HistoryMessage>,
}

/// Fire-and-forget notifications for managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAlert {
    NewDeal { deal_id: Uuid, contact_name: Option<String> },
    PriorityDeal { deal_id: Uuid, excerpt: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tokens_round_trip_through_wire_strings() {
        for status in [DealStatus::New, DealStatus::InProgress, DealStatus::Closed] {
            assert_eq!(status.as_str().parse::<DealStatus>(), Ok(status));
        }
        assert!("closed".parse::<DealStatus>().is_err());
    }

    #[test]
    fn display_name_is_absent_until_enriched() {
        let now = Utc::now();
        let mut contact = Contact {
            id: Uuid::new_v4(),
            provider_id: "psid-1".into(),
            first_name: None,
            last_name: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(contact.display_name(), None);
        contact.first_name = Some("Anna".into());
        assert_eq!(contact.display_name().as_deref(), Some("Anna"));
        contact.last_name = Some("Petrova".into());
        assert_eq!(contact.display_name().as_deref(), Some("Anna Petrova"));
    }
}
