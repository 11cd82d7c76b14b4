//! crates/deal_desk_core/src/lifecycle.rs
//!
//! The deal lifecycle engine: every state change a deal can go through, guarded by
//! the acting `Actor` and the deal's current state.
//!
//! Status and assignment are separate axes. Status follows the transition table
//! below; assignment is taken with `claim` (a conditional write that exactly one
//! concurrent caller can win) or changed by a supervisor with `reassign`.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::domain::{
    ActionKind, ActivityLogEntry, Actor, AiAnalysis, Deal, DealStatus, ManagerAlert,
};
use crate::ports::{
    AnalysisFailure, AnalysisQueue, DatabaseService, NotificationService, PortError, PortResult,
};
use crate::search;
use crate::settings::SettingsHandle;
use crate::sla::{sla_state, SlaState};

/// Transitions open to the assigned manager. Supervisors may move between any two
/// distinct statuses.
const ASSIGNEE_TRANSITIONS: [(DealStatus, DealStatus); 4] = [
    (DealStatus::New, DealStatus::InProgress),
    (DealStatus::New, DealStatus::Closed),
    (DealStatus::InProgress, DealStatus::Closed),
    (DealStatus::InProgress, DealStatus::New),
];

pub fn transition_allowed(from: DealStatus, to: DealStatus, privileged: bool) -> bool {
    if from == to {
        return false;
    }
    privileged || ASSIGNEE_TRANSITIONS.contains(&(from, to))
}

/// Whether a deal should be (re)scored now.
pub fn needs_analysis(deal: &Deal, now: DateTime<Utc>, cooldown: Duration) -> bool {
    if let Some(failed_at) = deal.analysis_failed_at {
        if failed_at + cooldown > now {
            return false;
        }
    }
    match (&deal.analysis, deal.analyzed_at, deal.last_client_message_at) {
        (None, _, _) | (_, None, _) => true,
        (Some(_), Some(analyzed), Some(last_message)) => analyzed < last_message,
        (Some(_), Some(_), None) => false,
    }
}

/// Policy faults surfaced to the acting manager.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Deal {0} not found")]
    NotFound(Uuid),
    #[error("Manager {0} not found")]
    UnknownManager(Uuid),
    #[error("Deal is already claimed")]
    AlreadyClaimed,
    #[error("Deal is closed")]
    DealClosed,
    #[error("Only a supervisor may perform this action")]
    Forbidden,
    #[error("Deal is not assigned to the acting manager")]
    NotAssignee,
    #[error("Status transition {from} -> {to} is not allowed")]
    InvalidStatusTransition { from: DealStatus, to: DealStatus },
    #[error("Deal was modified concurrently; reload and retry")]
    Conflict,
    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("Deal must be closed before it can be rated")]
    NotClosed,
    #[error("Deal has already been rated")]
    AlreadyRated,
    #[error("Analysis could not be scheduled: {0}")]
    AnalysisUnavailable(String),
    #[error(transparent)]
    Port(#[from] PortError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// What `record_client_message` changed besides the timestamps.
#[derive(Debug, Clone)]
pub struct ClientMessageOutcome {
    pub deal: Deal,
    pub priority_raised: bool,
    pub analysis_scheduled: bool,
    pub matched_keywords: Vec<String>,
}

pub struct DealLifecycleEngine {
    db: Arc<dyn DatabaseService>,
    activity: ActivityLog,
    queue: Arc<dyn AnalysisQueue>,
    notifier: Arc<dyn NotificationService>,
    settings: SettingsHandle,
}

impl DealLifecycleEngine {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        queue: Arc<dyn AnalysisQueue>,
        notifier: Arc<dyn NotificationService>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            activity: ActivityLog::new(db.clone()),
            db,
            queue,
            notifier,
            settings,
        }
    }

    pub async fn get(&self, deal_id: Uuid) -> LifecycleResult<Deal> {
        self.db.get_deal(deal_id).await.map_err(|e| match e {
            PortError::NotFound(_) => LifecycleError::NotFound(deal_id),
            other => LifecycleError::Port(other),
        })
    }

    pub fn sla(&self, deal: &Deal, now: DateTime<Utc>) -> SlaState {
        sla_state(deal, now, self.settings.snapshot().sla_threshold)
    }

    //=====================================================================================
    // Inbound Events
    //=====================================================================================

    /// Applies a customer message. Never changes status.
    pub async fn record_client_message(
        &self,
        deal: &Deal,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> PortResult<ClientMessageOutcome> {
        let settings = self.settings.snapshot();
        let matched_keywords: Vec<String> = settings
            .priority_keywords
            .matched(text)
            .into_iter()
            .map(str::to_string)
            .collect();
        let flag_priority = !matched_keywords.is_empty() && !deal.status.is_closed();

        let updated = self
            .db
            .update_client_message(deal.id, text, timestamp, flag_priority)
            .await?;

        let priority_raised = updated.is_priority && !deal.is_priority;
        if priority_raised {
            info!(deal_id = %deal.id, keywords = ?matched_keywords, "Deal flagged as priority.");
            self.notifier.notify(ManagerAlert::PriorityDeal {
                deal_id: deal.id,
                excerpt: text.chars().take(140).collect(),
            });
        }

        self.refresh_search(&updated).await;

        let analysis_scheduled = needs_analysis(&updated, Utc::now(), settings.analysis_cooldown)
            && self.schedule_analysis(updated.id);

        Ok(ClientMessageOutcome {
            deal: updated,
            priority_raised,
            analysis_scheduled,
            matched_keywords,
        })
    }

    /// Applies a business-side message echoed back by the provider.
    pub async fn record_manager_reply(
        &self,
        deal: &Deal,
        timestamp: DateTime<Utc>,
    ) -> PortResult<Deal> {
        self.db.update_manager_response(deal.id, timestamp).await
    }

    pub fn announce_new_deal(&self, deal: &Deal, contact_name: Option<String>) {
        self.notifier.notify(ManagerAlert::NewDeal {
            deal_id: deal.id,
            contact_name,
        });
    }

    //=====================================================================================
    // Assignment
    //=====================================================================================

    /// Takes an unassigned, open deal. Exactly one of several concurrent callers wins.
    pub async fn claim(&self, deal_id: Uuid, actor: &Actor) -> LifecycleResult<Deal> {
        let Some(deal) = self.db.claim_deal(deal_id, actor.id, Utc::now()).await? else {
            let current = self.get(deal_id).await?;
            return Err(if current.status.is_closed() {
                LifecycleError::DealClosed
            } else {
                LifecycleError::AlreadyClaimed
            });
        };

        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::Assigned, "Deal claimed")
                    .for_deal(deal_id)
                    .by(actor)
                    .with_metadata(json!({ "from": null, "to": actor.id, "via": "claim" })),
            )
            .await;
        Ok(deal)
    }

    /// Supervisor-only. Works regardless of the current assignment; `None` unassigns.
    pub async fn reassign(
        &self,
        deal_id: Uuid,
        actor: &Actor,
        new_manager: Option<Uuid>,
    ) -> LifecycleResult<Deal> {
        if !actor.is_privileged() {
            return Err(LifecycleError::Forbidden);
        }
        let current = self.get(deal_id).await?;
        if let Some(manager_id) = new_manager {
            self.db.get_manager(manager_id).await.map_err(|e| match e {
                PortError::NotFound(_) => LifecycleError::UnknownManager(manager_id),
                other => LifecycleError::Port(other),
            })?;
        }

        let deal = self.db.assign_deal(deal_id, new_manager, Utc::now()).await?;
        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::Assigned, "Deal reassigned")
                    .for_deal(deal_id)
                    .by(actor)
                    .with_metadata(json!({
                        "from": current.manager_id,
                        "to": new_manager,
                        "via": "reassign",
                    })),
            )
            .await;
        Ok(deal)
    }

    //=====================================================================================
    // Manager Edits
    //=====================================================================================

    pub async fn set_status(
        &self,
        deal_id: Uuid,
        actor: &Actor,
        to: DealStatus,
    ) -> LifecycleResult<Deal> {
        let current = self.get(deal_id).await?;
        let from = current.status;
        if !transition_allowed(from, to, actor.is_privileged()) {
            return Err(LifecycleError::InvalidStatusTransition { from, to });
        }
        ensure_assignee(&current, actor)?;

        let deal = self
            .db
            .update_status(deal_id, from, to, Utc::now())
            .await?
            .ok_or(LifecycleError::Conflict)?;

        self.activity
            .append(
                ActivityLogEntry::new(
                    ActionKind::StatusChanged,
                    format!("Status changed from {} to {}", from, to),
                )
                .for_deal(deal_id)
                .by(actor)
                .with_metadata(json!({ "from": from.as_str(), "to": to.as_str() })),
            )
            .await;
        Ok(deal)
    }

    pub async fn update_note(
        &self,
        deal_id: Uuid,
        actor: &Actor,
        note: Option<&str>,
    ) -> LifecycleResult<Deal> {
        let current = self.get(deal_id).await?;
        ensure_assignee(&current, actor)?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());

        let deal = self.db.update_note(deal_id, note, Utc::now()).await?;
        self.refresh_search(&deal).await;
        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::NoteUpdated, "Note updated")
                    .for_deal(deal_id)
                    .by(actor)
                    .with_metadata(json!({ "cleared": note.is_none() })),
            )
            .await;
        Ok(deal)
    }

    pub async fn set_reminder(
        &self,
        deal_id: Uuid,
        actor: &Actor,
        reminder_at: Option<DateTime<Utc>>,
    ) -> LifecycleResult<Deal> {
        let current = self.get(deal_id).await?;
        ensure_assignee_or_unassigned(&current, actor)?;

        let deal = self.db.update_reminder(deal_id, reminder_at, Utc::now()).await?;
        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::ReminderSet, "Reminder updated")
                    .for_deal(deal_id)
                    .by(actor)
                    .with_metadata(json!({ "reminder_at": reminder_at })),
            )
            .await;
        Ok(deal)
    }

    pub async fn mark_viewed(&self, deal_id: Uuid, actor: &Actor) -> LifecycleResult<Deal> {
        let current = self.get(deal_id).await?;
        ensure_assignee_or_unassigned(&current, actor)?;
        if current.is_viewed {
            return Ok(current);
        }

        let deal = self.db.mark_viewed(deal_id, Utc::now()).await?;
        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::Viewed, "Deal viewed")
                    .for_deal(deal_id)
                    .by(actor),
            )
            .await;
        Ok(deal)
    }

    /// Post-closure rating; accepted once.
    pub async fn rate(
        &self,
        deal_id: Uuid,
        actor: &Actor,
        rating: u8,
        review: Option<&str>,
    ) -> LifecycleResult<Deal> {
        if !(1..=5).contains(&rating) {
            return Err(LifecycleError::InvalidRating(rating));
        }
        let review = review.map(str::trim).filter(|r| !r.is_empty());

        let Some(deal) = self.db.rate_deal(deal_id, rating, review, Utc::now()).await? else {
            let current = self.get(deal_id).await?;
            return Err(if current.status.is_closed() {
                LifecycleError::AlreadyRated
            } else {
                LifecycleError::NotClosed
            });
        };

        self.activity
            .append(
                ActivityLogEntry::new(ActionKind::Rated, format!("Deal rated {}", rating))
                    .for_deal(deal_id)
                    .by(actor)
                    .with_metadata(json!({ "rating": rating, "has_review": review.is_some() })),
            )
            .await;
        Ok(deal)
    }

    //=====================================================================================
    // AI Analysis
    //=====================================================================================

    /// Manual request; bypasses the failure cooldown.
    pub async fn request_analysis(&self, deal_id: Uuid, actor: &Actor) -> LifecycleResult<()> {
        self.get(deal_id).await?;
        self.queue
            .enqueue(deal_id)
            .map_err(|e| LifecycleError::AnalysisUnavailable(e.to_string()))?;
        info!(deal_id = %deal_id, actor_id = %actor.id, "Analysis requested manually.");
        Ok(())
    }

    /// Stores a scoring result, or only the failure time so a cooldown can apply.
    pub async fn apply_ai_analysis(
        &self,
        deal_id: Uuid,
        result: Result<AiAnalysis, AnalysisFailure>,
    ) -> LifecycleResult<Deal> {
        let now = Utc::now();
        match result {
            Ok(mut analysis) => {
                analysis.score = analysis.score.min(100);
                let deal = self.db.store_analysis(deal_id, &analysis, now).await?;
                self.refresh_search(&deal).await;
                self.activity
                    .append(
                        ActivityLogEntry::new(ActionKind::AiAnalyzed, "AI analysis updated")
                            .for_deal(deal_id)
                            .with_metadata(json!({
                                "score": analysis.score,
                                "intent": analysis.intent,
                            })),
                    )
                    .await;
                Ok(deal)
            }
            Err(failure) => {
                warn!(deal_id = %deal_id, "AI analysis failed: {}", failure);
                let deal = self.db.store_analysis_failure(deal_id, now).await?;
                self.activity
                    .append(
                        ActivityLogEntry::new(ActionKind::AiAnalysisFailed, "AI analysis failed")
                            .for_deal(deal_id)
                            .with_metadata(json!({ "error": failure.to_string() })),
                    )
                    .await;
                Ok(deal)
            }
        }
    }

    /// Re-enqueues open deals whose failed analysis has cooled down.
    pub async fn requeue_failed_analyses(&self, now: DateTime<Utc>, limit: i64) -> PortResult<usize> {
        let cooldown = self.settings.snapshot().analysis_cooldown;
        let due = self
            .db
            .deals_due_for_analysis_retry(now - cooldown, limit)
            .await?;
        Ok(due.into_iter().filter(|id| self.schedule_analysis(*id)).count())
    }

    fn schedule_analysis(&self, deal_id: Uuid) -> bool {
        match self.queue.enqueue(deal_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(deal_id = %deal_id, "Analysis not scheduled: {}", e);
                false
            }
        }
    }

    /// Recomputes the search projection; failures leave the old projection in place.
    pub async fn refresh_search(&self, deal: &Deal) {
        let result = async {
            let contact = self.db.get_contact(deal.contact_id).await?;
            let text = search::project(deal, &contact);
            self.db.update_search_text(deal.id, &text).await
        }
        .await;
        if let Err(e) = result {
            warn!(deal_id = %deal.id, "Failed to refresh search projection: {:?}", e);
        }
    }
}

fn ensure_assignee(deal: &Deal, actor: &Actor) -> LifecycleResult<()> {
    if actor.is_privileged() || deal.manager_id == Some(actor.id) {
        Ok(())
    } else {
        Err(LifecycleError::NotAssignee)
    }
}

fn ensure_assignee_or_unassigned(deal: &Deal, actor: &Actor) -> LifecycleResult<()> {
    if deal.manager_id.is_none() {
        return Ok(());
    }
    ensure_assignee(deal, actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use DealStatus::*;

    #[test]
    fn assignee_transitions_follow_the_table() {
        assert!(transition_allowed(New, InProgress, false));
        assert!(transition_allowed(New, Closed, false));
        assert!(transition_allowed(InProgress, Closed, false));
        assert!(transition_allowed(InProgress, New, false));
        assert!(!transition_allowed(Closed, New, false));
        assert!(!transition_allowed(Closed, InProgress, false));
        assert!(!transition_allowed(New, New, false));
    }

    #[test]
    fn supervisors_may_leave_closed() {
        assert!(transition_allowed(Closed, InProgress, true));
        assert!(transition_allowed(Closed, New, true));
        assert!(!transition_allowed(Closed, Closed, true));
    }

    #[test]
    fn analysis_waits_out_the_failure_cooldown() {
        let now = Utc::now();
        let cooldown = Duration::minutes(15);
        let mut deal = Deal::open(Uuid::new_v4(), Uuid::new_v4(), now);
        deal.last_client_message_at = Some(now);
        assert!(needs_analysis(&deal, now, cooldown));

        deal.analysis_failed_at = Some(now - Duration::minutes(5));
        assert!(!needs_analysis(&deal, now, cooldown));

        deal.analysis_failed_at = Some(now - Duration::minutes(16));
        assert!(needs_analysis(&deal, now, cooldown));
    }

    #[test]
    fn analysis_reruns_only_for_newer_activity() {
        let now = Utc::now();
        let mut deal = Deal::open(Uuid::new_v4(), Uuid::new_v4(), now);
        deal.analysis = Some(AiAnalysis {
            summary: "s".into(),
            score: 50,
            intent: "buy".into(),
            objections: vec![],
            next_action: "call".into(),
        });
        deal.analyzed_at = Some(now);
        deal.last_client_message_at = Some(now - Duration::minutes(1));
        assert!(!needs_analysis(&deal, now, Duration::minutes(15)));

        deal.last_client_message_at = Some(now + Duration::seconds(1));
        assert!(needs_analysis(&deal, now, Duration::minutes(15)));
    }
}
