//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Uniqueness and every conditional write live in SQL: the ledger primary key, the
//! partial unique index allowing one open deal per conversation, and the guarded
//! `UPDATE ... WHERE` statements behind claim, status change and rating.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deal_desk_core::domain::{
    ActivityFilter, ActivityLogEntry, ActorRole, AiAnalysis, Contact, Conversation, Deal,
    DealFilter, DealStatus, IdempotencyLedgerEntry, LedgerOutcome, Manager, ManagerCredentials,
    Platform, ProfileFields, RequestOrigin, WebhookRejection,
};
use deal_desk_core::ports::{DatabaseService, PortError, PortResult, Upserted};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

macro_rules! deal_columns {
    () => {
        "id, contact_id, conversation_id, manager_id, status, is_priority, is_viewed, note, \
         reminder_at, last_message_text, last_client_message_at, last_manager_response_at, \
         analysis, analyzed_at, analysis_failed_at, rating, review, rated_at, search_text, \
         created_at, updated_at"
    };
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn fetch_deal(&self, sql: &str, deal_id: Uuid) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(sql)
            .bind(deal_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| deal_error(e, deal_id))?
            .to_domain()
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct ManagerRecord {
    id: Uuid,
    email: String,
    display_name: Option<String>,
    role: String,
    created_at: DateTime<Utc>,
}
impl ManagerRecord {
    fn to_domain(self) -> PortResult<Manager> {
        Ok(Manager {
            id: self.id,
            email: self.email,
            display_name: self.display_name,
            role: self.role.parse().map_err(corrupt)?,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    id: Uuid,
    email: String,
    hashed_password: String,
}
impl CredentialsRecord {
    fn to_domain(self) -> ManagerCredentials {
        ManagerCredentials {
            manager_id: self.id,
            email: self.email,
            hashed_password: self.hashed_password,
        }
    }
}

#[derive(FromRow)]
struct ContactRecord {
    id: Uuid,
    provider_id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl ContactRecord {
    fn to_domain(self) -> Contact {
        Contact {
            id: self.id,
            provider_id: self.provider_id,
            first_name: self.first_name,
            last_name: self.last_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct UpsertedContactRecord {
    #[sqlx(flatten)]
    contact: ContactRecord,
    inserted: bool,
}

#[derive(FromRow)]
struct ConversationRecord {
    id: Uuid,
    provider_conversation_id: String,
    platform: String,
    last_activity_at: DateTime<Utc>,
    labels: Vec<String>,
    created_at: DateTime<Utc>,
}
impl ConversationRecord {
    fn to_domain(self) -> PortResult<Conversation> {
        Ok(Conversation {
            id: self.id,
            provider_conversation_id: self.provider_conversation_id,
            platform: self.platform.parse::<Platform>().map_err(corrupt)?,
            last_activity_at: self.last_activity_at,
            labels: self.labels,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct UpsertedConversationRecord {
    #[sqlx(flatten)]
    conversation: ConversationRecord,
    inserted: bool,
}

#[derive(FromRow)]
struct DealRecord {
    id: Uuid,
    contact_id: Uuid,
    conversation_id: Uuid,
    manager_id: Option<Uuid>,
    status: String,
    is_priority: bool,
    is_viewed: bool,
    note: Option<String>,
    reminder_at: Option<DateTime<Utc>>,
    last_message_text: Option<String>,
    last_client_message_at: Option<DateTime<Utc>>,
    last_manager_response_at: Option<DateTime<Utc>>,
    analysis: Option<Json<AiAnalysis>>,
    analyzed_at: Option<DateTime<Utc>>,
    analysis_failed_at: Option<DateTime<Utc>>,
    rating: Option<i16>,
    review: Option<String>,
    rated_at: Option<DateTime<Utc>>,
    search_text: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl DealRecord {
    fn to_domain(self) -> PortResult<Deal> {
        Ok(Deal {
            id: self.id,
            contact_id: self.contact_id,
            conversation_id: self.conversation_id,
            manager_id: self.manager_id,
            status: self.status.parse::<DealStatus>().map_err(corrupt)?,
            is_priority: self.is_priority,
            is_viewed: self.is_viewed,
            note: self.note,
            reminder_at: self.reminder_at,
            last_message_text: self.last_message_text,
            last_client_message_at: self.last_client_message_at,
            last_manager_response_at: self.last_manager_response_at,
            analysis: self.analysis.map(|Json(a)| a),
            analyzed_at: self.analyzed_at,
            analysis_failed_at: self.analysis_failed_at,
            rating: self.rating.and_then(|r| u8::try_from(r).ok()),
            review: self.review,
            rated_at: self.rated_at,
            search_text: self.search_text,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ActivityRecord {
    id: Uuid,
    deal_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    action: String,
    description: String,
    metadata: serde_json::Value,
    ip: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
}
impl ActivityRecord {
    fn to_domain(self) -> PortResult<ActivityLogEntry> {
        Ok(ActivityLogEntry {
            id: self.id,
            deal_id: self.deal_id,
            actor_id: self.actor_id,
            action: self.action.parse().map_err(corrupt)?,
            description: self.description,
            metadata: self.metadata,
            origin: RequestOrigin {
                ip: self.ip,
                user_agent: self.user_agent,
            },
            created_at: self.created_at,
        })
    }
}

//=========================================================================================
// Error Mapping
//=========================================================================================

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> PortError {
    PortError::Unexpected(format!("Stored value is invalid: {}", e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn deal_error(e: sqlx::Error, deal_id: Uuid) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound(format!("Deal {} not found", deal_id)),
        e if is_unique_violation(&e) => PortError::Conflict(format!(
            "Deal {} would be a second open deal for its conversation",
            deal_id
        )),
        e => unexpected(e),
    }
}

fn optional_deal(record: Option<DealRecord>) -> PortResult<Option<Deal>> {
    record.map(DealRecord::to_domain).transpose()
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    // --- Manager Management ---

    async fn create_manager(
        &self,
        email: &str,
        hashed_password: &str,
        display_name: Option<&str>,
        role: ActorRole,
    ) -> PortResult<Manager> {
        let record = sqlx::query_as::<_, ManagerRecord>(
            "INSERT INTO managers (id, email, hashed_password, display_name, role) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, email, display_name, role, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(email.trim().to_lowercase())
        .bind(hashed_password)
        .bind(display_name)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PortError::Conflict(format!("Email {} is already registered", email))
            } else {
                unexpected(e)
            }
        })?;
        record.to_domain()
    }

    async fn get_manager_credentials_by_email(&self, email: &str) -> PortResult<ManagerCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT id, email, hashed_password FROM managers WHERE email = $1",
        )
        .bind(email.trim().to_lowercase())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Manager {} not found", email)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_manager(&self, manager_id: Uuid) -> PortResult<Manager> {
        sqlx::query_as::<_, ManagerRecord>(
            "SELECT id, email, display_name, role, created_at FROM managers WHERE id = $1",
        )
        .bind(manager_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Manager {} not found", manager_id)),
            _ => unexpected(e),
        })?
        .to_domain()
    }

    async fn set_manager_role(&self, manager_id: Uuid, role: ActorRole) -> PortResult<Manager> {
        sqlx::query_as::<_, ManagerRecord>(
            "UPDATE managers SET role = $2 WHERE id = $1 \
             RETURNING id, email, display_name, role, created_at",
        )
        .bind(manager_id)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Manager {} not found", manager_id)),
            _ => unexpected(e),
        })?
        .to_domain()
    }

    // --- Auth Methods ---

    async fn create_auth_session(
        &self,
        session_id: &str,
        manager_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, manager_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(manager_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT manager_id FROM auth_sessions WHERE id = $1 AND expires_at > now()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    // --- Ingestion Records ---

    async fn insert_ledger_entry(&self, entry: &IdempotencyLedgerEntry) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO idempotency_ledger (source, event_key, received_at, outcome, outcome_detail) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (source, event_key) DO NOTHING",
        )
        .bind(&entry.source)
        .bind(&entry.event_key)
        .bind(entry.received_at)
        .bind(entry.outcome.as_str())
        .bind(entry.outcome_detail.as_deref())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_ledger_outcome(
        &self,
        source: &str,
        event_key: &str,
        outcome: LedgerOutcome,
        detail: Option<&str>,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE idempotency_ledger SET outcome = $3, outcome_detail = $4 \
             WHERE source = $1 AND event_key = $2",
        )
        .bind(source)
        .bind(event_key)
        .bind(outcome.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn insert_webhook_rejection(&self, rejection: &WebhookRejection) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO webhook_rejections (id, source, reason, ip, body_preview, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(rejection.id)
        .bind(&rejection.source)
        .bind(&rejection.reason)
        .bind(rejection.ip.as_deref())
        .bind(&rejection.body_preview)
        .bind(rejection.created_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    // --- Contacts and Conversations ---

    async fn upsert_contact(
        &self,
        provider_id: &str,
        profile: &ProfileFields,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Contact>> {
        // `xmax = 0` only holds for a row this statement inserted.
        let record = sqlx::query_as::<_, UpsertedContactRecord>(
            "INSERT INTO contacts (id, provider_id, first_name, last_name, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT (provider_id) DO UPDATE SET \
                first_name = COALESCE(EXCLUDED.first_name, contacts.first_name), \
                last_name = COALESCE(EXCLUDED.last_name, contacts.last_name), \
                updated_at = EXCLUDED.updated_at \
             RETURNING id, provider_id, first_name, last_name, created_at, updated_at, \
                (xmax = 0) AS inserted",
        )
        .bind(Uuid::new_v4())
        .bind(provider_id)
        .bind(profile.first_name.as_deref())
        .bind(profile.last_name.as_deref())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(Upserted {
            value: record.contact.to_domain(),
            created: record.inserted,
        })
    }

    async fn get_contact(&self, contact_id: Uuid) -> PortResult<Contact> {
        let record = sqlx::query_as::<_, ContactRecord>(
            "SELECT id, provider_id, first_name, last_name, created_at, updated_at \
             FROM contacts WHERE id = $1",
        )
        .bind(contact_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Contact {} not found", contact_id)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn upsert_conversation(
        &self,
        provider_conversation_id: &str,
        platform: Platform,
        activity_at: DateTime<Utc>,
        labels: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> PortResult<Upserted<Conversation>> {
        let record = sqlx::query_as::<_, UpsertedConversationRecord>(
            "INSERT INTO conversations \
                (id, provider_conversation_id, platform, last_activity_at, labels, created_at) \
             VALUES ($1, $2, $3, $4, $5, $7) \
             ON CONFLICT (provider_conversation_id) DO UPDATE SET \
                last_activity_at = GREATEST(conversations.last_activity_at, EXCLUDED.last_activity_at), \
                labels = CASE WHEN $6 THEN EXCLUDED.labels ELSE conversations.labels END \
             RETURNING id, provider_conversation_id, platform, last_activity_at, labels, created_at, \
                (xmax = 0) AS inserted",
        )
        .bind(Uuid::new_v4())
        .bind(provider_conversation_id)
        .bind(platform.as_str())
        .bind(activity_at)
        .bind(labels.map(<[String]>::to_vec).unwrap_or_default())
        .bind(labels.is_some())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(Upserted {
            value: record.conversation.to_domain()?,
            created: record.inserted,
        })
    }

    // --- Deal Management ---

    async fn find_open_deal(&self, conversation_id: Uuid) -> PortResult<Option<Deal>> {
        let record = sqlx::query_as::<_, DealRecord>(concat!(
            "SELECT ",
            deal_columns!(),
            " FROM deals WHERE conversation_id = $1 AND status <> 'Closed'"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        optional_deal(record)
    }

    async fn insert_open_deal(&self, deal: &Deal) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO deals (id, contact_id, conversation_id, status, search_text, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (conversation_id) WHERE status <> 'Closed' DO NOTHING",
        )
        .bind(deal.id)
        .bind(deal.contact_id)
        .bind(deal.conversation_id)
        .bind(deal.status.as_str())
        .bind(&deal.search_text)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_deal(&self, deal_id: Uuid) -> PortResult<Deal> {
        self.fetch_deal(
            concat!("SELECT ", deal_columns!(), " FROM deals WHERE id = $1"),
            deal_id,
        )
        .await
    }

    async fn list_deals(&self, filter: &DealFilter) -> PortResult<Vec<Deal>> {
        let records = sqlx::query_as::<_, DealRecord>(concat!(
            "SELECT ",
            deal_columns!(),
            " FROM deals \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::uuid IS NULL OR manager_id = $2) \
               AND ($3::bool IS NULL OR is_priority = $3) \
               AND ($4::text IS NULL OR strpos(search_text, $4) > 0) \
             ORDER BY is_priority DESC, updated_at DESC \
             LIMIT $5 OFFSET $6"
        ))
        .bind(filter.status.map(DealStatus::as_str))
        .bind(filter.manager_id)
        .bind(filter.priority)
        .bind(filter.query.as_deref().map(str::to_lowercase))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(DealRecord::to_domain).collect()
    }

    async fn update_client_message(
        &self,
        deal_id: Uuid,
        text: &str,
        at: DateTime<Utc>,
        flag_priority: bool,
    ) -> PortResult<Deal> {
        // Column references in SET see the pre-update row.
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET \
                last_message_text = CASE \
                    WHEN last_client_message_at IS NULL OR last_client_message_at <= $3 THEN $2 \
                    ELSE last_message_text END, \
                last_client_message_at = GREATEST(last_client_message_at, $3), \
                is_priority = is_priority OR ($4 AND status <> 'Closed'), \
                updated_at = now() \
             WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(text)
        .bind(at)
        .bind(flag_priority)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn update_manager_response(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET \
                last_manager_response_at = GREATEST(last_manager_response_at, $2), \
                updated_at = now() \
             WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn claim_deal(
        &self,
        deal_id: Uuid,
        manager_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let record = sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET manager_id = $2, updated_at = $3 \
             WHERE id = $1 AND manager_id IS NULL AND status <> 'Closed' RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(manager_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        optional_deal(record)
    }

    async fn assign_deal(
        &self,
        deal_id: Uuid,
        manager_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET manager_id = $2, updated_at = $3 WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(manager_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn update_status(
        &self,
        deal_id: Uuid,
        from: DealStatus,
        to: DealStatus,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let record = sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET status = $3, \
                last_manager_response_at = GREATEST(last_manager_response_at, $4), \
                updated_at = $4 \
             WHERE id = $1 AND status = $2 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(responded_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?;
        optional_deal(record)
    }

    async fn update_note(
        &self,
        deal_id: Uuid,
        note: Option<&str>,
        responded_at: DateTime<Utc>,
    ) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET note = $2, \
                last_manager_response_at = GREATEST(last_manager_response_at, $3), \
                updated_at = $3 \
             WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(note)
        .bind(responded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn update_reminder(
        &self,
        deal_id: Uuid,
        reminder_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET reminder_at = $2, updated_at = $3 WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(reminder_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn mark_viewed(&self, deal_id: Uuid, now: DateTime<Utc>) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET is_viewed = TRUE, updated_at = $2 WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn store_analysis(
        &self,
        deal_id: Uuid,
        analysis: &AiAnalysis,
        at: DateTime<Utc>,
    ) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET analysis = $2, analyzed_at = $3, analysis_failed_at = NULL, \
                updated_at = $3 \
             WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(Json(analysis))
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn store_analysis_failure(&self, deal_id: Uuid, at: DateTime<Utc>) -> PortResult<Deal> {
        sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET analysis_failed_at = $2 WHERE id = $1 RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| deal_error(e, deal_id))?
        .to_domain()
    }

    async fn rate_deal(
        &self,
        deal_id: Uuid,
        rating: u8,
        review: Option<&str>,
        at: DateTime<Utc>,
    ) -> PortResult<Option<Deal>> {
        let record = sqlx::query_as::<_, DealRecord>(concat!(
            "UPDATE deals SET rating = $2, review = $3, rated_at = $4, updated_at = $4 \
             WHERE id = $1 AND status = 'Closed' AND rating IS NULL RETURNING ",
            deal_columns!()
        ))
        .bind(deal_id)
        .bind(i16::from(rating))
        .bind(review)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        optional_deal(record)
    }

    async fn update_search_text(&self, deal_id: Uuid, search_text: &str) -> PortResult<()> {
        sqlx::query("UPDATE deals SET search_text = $2 WHERE id = $1")
            .bind(deal_id)
            .bind(search_text)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn deals_due_for_analysis_retry(
        &self,
        failed_before: DateTime<Utc>,
        limit: i64,
    ) -> PortResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM deals \
             WHERE status <> 'Closed' AND analysis_failed_at IS NOT NULL AND analysis_failed_at <= $1 \
             ORDER BY analysis_failed_at \
             LIMIT $2",
        )
        .bind(failed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)
    }

    // --- Activity Log ---

    async fn insert_activity(&self, entry: &ActivityLogEntry) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO activity_log \
                (id, deal_id, actor_id, action, description, metadata, ip, user_agent, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.deal_id)
        .bind(entry.actor_id)
        .bind(entry.action.as_str())
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.origin.ip.as_deref())
        .bind(entry.origin.user_agent.as_deref())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn list_activity(&self, filter: &ActivityFilter) -> PortResult<Vec<ActivityLogEntry>> {
        let records = sqlx::query_as::<_, ActivityRecord>(
            "SELECT id, deal_id, actor_id, action, description, metadata, ip, user_agent, created_at \
             FROM activity_log \
             WHERE ($1::uuid IS NULL OR deal_id = $1) \
               AND ($2::uuid IS NULL OR actor_id = $2) \
               AND ($3::text IS NULL OR action = $3) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
               AND ($5::timestamptz IS NULL OR created_at < $5) \
             ORDER BY created_at DESC \
             LIMIT $6",
        )
        .bind(filter.deal_id)
        .bind(filter.actor_id)
        .bind(filter.action.map(|a| a.as_str()))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(ActivityRecord::to_domain).collect()
    }
}
