//! services/api/tests/deal_lifecycle.rs
//!
//! Lifecycle guards and the background analysis path, driven through the engine
//! the HTTP handlers use.

mod common;

use api_lib::{
    adapters::CachedHistoryAdapter,
    web::analysis_task::{analysis_channel, AnalysisWorker},
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::TestApp;
use deal_desk_core::{
    domain::{
        ActionKind, ActorRole, AiAnalysis, AnalysisRequest, DealFilter, DealStatus, ManagerAlert,
    },
    lifecycle::LifecycleError,
    ports::{AnalysisFailure, AnalysisQueue, AnalysisService, DatabaseService, PortError, QueueError},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct FixedAnalyzer(Result<AiAnalysis, AnalysisFailure>);

#[async_trait]
impl AnalysisService for FixedAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AiAnalysis, AnalysisFailure> {
        assert!(!request.messages.is_empty());
        self.0.clone()
    }
}

fn sample_analysis(score: u8) -> AiAnalysis {
    AiAnalysis {
        summary: "Wants two units delivered to Kazan".into(),
        score,
        intent: "ready_to_buy".into(),
        objections: vec!["delivery time".into()],
        next_action: "Send the invoice".into(),
    }
}

fn worker(app: &TestApp, result: Result<AiAnalysis, AnalysisFailure>) -> AnalysisWorker {
    AnalysisWorker::new(
        app.state.engine.clone(),
        Arc::new(FixedAnalyzer(result)),
        Arc::new(CachedHistoryAdapter),
        20,
        2,
    )
}

//=========================================================================================
// Assignment
//=========================================================================================

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let app = TestApp::new();
    let deal = app.client_message("mid:c1", "psid-1", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let b = app.actor("b@example.com", ActorRole::Manager).await;

    let engine = &app.state.engine;
    let (first, second) = tokio::join!(engine.claim(deal.id, &a), engine.claim(deal.id, &b));
    let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(LifecycleError::AlreadyClaimed)));

    let stored = engine.get(deal.id).await.expect("deal");
    assert!(stored.manager_id == Some(a.id) || stored.manager_id == Some(b.id));
    let claims = app
        .activity_for(deal.id)
        .await
        .into_iter()
        .filter(|e| e.action == ActionKind::Assigned)
        .count();
    assert_eq!(claims, 1);
}

#[tokio::test]
async fn closed_deal_cannot_be_claimed() {
    let app = TestApp::new();
    let deal = app.client_message("mid:c2", "psid-2", "hello").await;
    let lead = app.actor("lead@example.com", ActorRole::Supervisor).await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;

    let engine = &app.state.engine;
    engine
        .set_status(deal.id, &lead, DealStatus::Closed)
        .await
        .expect("closed");
    assert!(matches!(
        engine.claim(deal.id, &a).await,
        Err(LifecycleError::DealClosed)
    ));
}

#[tokio::test]
async fn reassignment_is_supervisor_only() {
    let app = TestApp::new();
    let deal = app.client_message("mid:c3", "psid-3", "hello").await;
    let lead = app.actor("lead@example.com", ActorRole::Supervisor).await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let b = app.actor("b@example.com", ActorRole::Manager).await;
    let engine = &app.state.engine;

    engine.claim(deal.id, &a).await.expect("claim");
    assert!(matches!(
        engine.reassign(deal.id, &a, Some(b.id)).await,
        Err(LifecycleError::Forbidden)
    ));
    assert_eq!(engine.get(deal.id).await.expect("deal").manager_id, Some(a.id));

    let moved = engine.reassign(deal.id, &lead, Some(b.id)).await.expect("reassign");
    assert_eq!(moved.manager_id, Some(b.id));
    let entry = app
        .activity_for(deal.id)
        .await
        .into_iter()
        .find(|e| e.action == ActionKind::Assigned && e.actor_id == Some(lead.id))
        .expect("reassign entry");
    assert_eq!(entry.metadata["via"], "reassign");
    assert_eq!(entry.metadata["from"], a.id.to_string());

    let ghost = Uuid::new_v4();
    assert!(matches!(
        engine.reassign(deal.id, &lead, Some(ghost)).await,
        Err(LifecycleError::UnknownManager(id)) if id == ghost
    ));

    let cleared = engine.reassign(deal.id, &lead, None).await.expect("unassign");
    assert_eq!(cleared.manager_id, None);
}

//=========================================================================================
// Status and Edits
//=========================================================================================

#[tokio::test]
async fn only_the_assignee_moves_status() {
    let app = TestApp::new();
    let deal = app.client_message("mid:s1", "psid-4", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let b = app.actor("b@example.com", ActorRole::Manager).await;
    let engine = &app.state.engine;

    assert!(matches!(
        engine.set_status(deal.id, &a, DealStatus::InProgress).await,
        Err(LifecycleError::NotAssignee)
    ));
    engine.claim(deal.id, &a).await.expect("claim");
    assert!(matches!(
        engine.set_status(deal.id, &b, DealStatus::InProgress).await,
        Err(LifecycleError::NotAssignee)
    ));
    assert!(matches!(
        engine.set_status(deal.id, &a, DealStatus::New).await,
        Err(LifecycleError::InvalidStatusTransition { .. })
    ));
    let deal = engine
        .set_status(deal.id, &a, DealStatus::InProgress)
        .await
        .expect("in progress");
    assert_eq!(deal.status, DealStatus::InProgress);
    assert!(deal.last_manager_response_at.is_some());
}

#[tokio::test]
async fn supervisor_reopen_respects_the_single_open_deal() {
    let app = TestApp::new();
    let lead = app.actor("lead@example.com", ActorRole::Supervisor).await;
    let engine = &app.state.engine;

    let first = app.client_message("mid:o1", "psid-5", "hello").await;
    engine
        .set_status(first.id, &lead, DealStatus::Closed)
        .await
        .expect("closed");
    let reopened = engine
        .set_status(first.id, &lead, DealStatus::InProgress)
        .await
        .expect("reopened");
    assert_eq!(reopened.status, DealStatus::InProgress);

    engine
        .set_status(first.id, &lead, DealStatus::Closed)
        .await
        .expect("closed again");
    let second = app.client_message("mid:o2", "psid-5", "one more question").await;
    assert_ne!(second.id, first.id);

    assert!(matches!(
        engine.set_status(first.id, &lead, DealStatus::New).await,
        Err(LifecycleError::Port(PortError::Conflict(_)))
    ));
    assert_eq!(
        engine.get(first.id).await.expect("deal").status,
        DealStatus::Closed
    );
}

#[tokio::test]
async fn rating_is_accepted_once_after_closure() {
    let app = TestApp::new();
    let deal = app.client_message("mid:r1", "psid-6", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let engine = &app.state.engine;
    engine.claim(deal.id, &a).await.expect("claim");

    assert!(matches!(
        engine.rate(deal.id, &a, 0, None).await,
        Err(LifecycleError::InvalidRating(0))
    ));
    assert!(matches!(
        engine.rate(deal.id, &a, 4, None).await,
        Err(LifecycleError::NotClosed)
    ));

    engine
        .set_status(deal.id, &a, DealStatus::Closed)
        .await
        .expect("closed");
    let rated = engine
        .rate(deal.id, &a, 4, Some("  polite  "))
        .await
        .expect("rated");
    assert_eq!(rated.rating, Some(4));
    assert_eq!(rated.review.as_deref(), Some("polite"));
    assert!(rated.rated_at.is_some());

    assert!(matches!(
        engine.rate(deal.id, &a, 5, None).await,
        Err(LifecycleError::AlreadyRated)
    ));
}

#[tokio::test]
async fn notes_feed_the_search_projection() {
    let app = TestApp::new();
    let deal = app.client_message("mid:n1", "psid-7", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let engine = &app.state.engine;
    engine.claim(deal.id, &a).await.expect("claim");

    let updated = engine
        .update_note(deal.id, &a, Some("  Call back after Friday "))
        .await
        .expect("note");
    assert_eq!(updated.note.as_deref(), Some("Call back after Friday"));

    let found = app
        .db
        .list_deals(&DealFilter {
            query: Some("call back".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, deal.id);

    let cleared = engine.update_note(deal.id, &a, Some("   ")).await.expect("clear");
    assert_eq!(cleared.note, None);
}

#[tokio::test]
async fn viewing_is_idempotent_and_reminders_follow_assignment() {
    let app = TestApp::new();
    let deal = app.client_message("mid:v1", "psid-8", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    let b = app.actor("b@example.com", ActorRole::Manager).await;
    let engine = &app.state.engine;

    let remind_at = Utc::now() + Duration::hours(2);
    let with_reminder = engine
        .set_reminder(deal.id, &b, Some(remind_at))
        .await
        .expect("unassigned reminder");
    assert_eq!(with_reminder.reminder_at, Some(remind_at));

    engine.claim(deal.id, &a).await.expect("claim");
    assert!(matches!(
        engine.set_reminder(deal.id, &b, None).await,
        Err(LifecycleError::NotAssignee)
    ));

    assert!(engine.mark_viewed(deal.id, &a).await.expect("viewed").is_viewed);
    assert!(engine.mark_viewed(deal.id, &a).await.expect("viewed").is_viewed);
    let views = app
        .activity_for(deal.id)
        .await
        .into_iter()
        .filter(|e| e.action == ActionKind::Viewed)
        .count();
    assert_eq!(views, 1);
}

#[tokio::test]
async fn unanswered_deal_breaches_the_sla() {
    let app = TestApp::new();
    let mut deal = app.client_message("mid:sla", "psid-9", "hello").await;
    let now = Utc::now();
    deal.last_client_message_at = Some(now - Duration::minutes(45));
    deal.last_manager_response_at = None;
    app.db.put_deal(deal.clone()).expect("fixture");

    let sla = app.state.engine.sla(&deal, now);
    assert!(sla.breached);
    assert_eq!(sla.overdue_minutes, 15);

    deal.last_manager_response_at = Some(now - Duration::minutes(1));
    assert!(!app.state.engine.sla(&deal, now).breached);
}

//=========================================================================================
// AI Analysis
//=========================================================================================

#[tokio::test]
async fn worker_stores_a_clamped_analysis() {
    let app = TestApp::new();
    let deal = app.client_message("mid:a1", "psid-10", "хочу купить два").await;

    worker(&app, Ok(sample_analysis(150)))
        .process(deal.id)
        .await
        .expect("process");

    let stored = app.state.engine.get(deal.id).await.expect("deal");
    let analysis = stored.analysis.expect("analysis");
    assert_eq!(analysis.score, 100);
    assert!(stored.analyzed_at.is_some());
    assert!(stored.analysis_failed_at.is_none());
    assert!(stored.search_text.contains("ready_to_buy"));
    let activity = app.activity_for(deal.id).await;
    assert_eq!(activity[0].action, ActionKind::AiAnalyzed);
}

#[tokio::test]
async fn failed_analysis_waits_out_the_cooldown() {
    let app = TestApp::new();
    let deal = app.client_message("mid:f1", "psid-11", "hello").await;
    assert_eq!(app.queue.jobs().len(), 1);

    worker(&app, Err(AnalysisFailure::Provider("timeout".into())))
        .process(deal.id)
        .await
        .expect("process");
    let stored = app.state.engine.get(deal.id).await.expect("deal");
    assert!(stored.analysis.is_none());
    assert!(stored.analysis_failed_at.is_some());
    assert_eq!(
        app.activity_for(deal.id).await[0].action,
        ActionKind::AiAnalysisFailed
    );

    app.client_message("mid:f2", "psid-11", "are you there?").await;
    assert_eq!(app.queue.jobs().len(), 1);

    let engine = &app.state.engine;
    assert_eq!(engine.requeue_failed_analyses(Utc::now(), 100).await.expect("sweep"), 0);
    let later = Utc::now() + Duration::minutes(16);
    assert_eq!(engine.requeue_failed_analyses(later, 100).await.expect("sweep"), 1);
    assert_eq!(app.queue.jobs(), vec![deal.id, deal.id]);
}

#[tokio::test]
async fn manual_request_bypasses_the_cooldown() {
    let app = TestApp::new();
    let deal = app.client_message("mid:m1", "psid-12", "hello").await;
    let a = app.actor("a@example.com", ActorRole::Manager).await;
    worker(&app, Err(AnalysisFailure::MalformedResponse("not json".into())))
        .process(deal.id)
        .await
        .expect("process");

    app.state
        .engine
        .request_analysis(deal.id, &a)
        .await
        .expect("requested");
    assert_eq!(app.queue.jobs().len(), 2);
    assert!(matches!(
        app.state.engine.request_analysis(Uuid::new_v4(), &a).await,
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn closed_deals_are_not_analyzed() {
    let app = TestApp::new();
    let deal = app.client_message("mid:x1", "psid-13", "hello").await;
    let lead = app.actor("lead@example.com", ActorRole::Supervisor).await;
    app.state
        .engine
        .set_status(deal.id, &lead, DealStatus::Closed)
        .await
        .expect("closed");

    worker(&app, Ok(sample_analysis(80)))
        .process(deal.id)
        .await
        .expect("process");
    let stored = app.state.engine.get(deal.id).await.expect("deal");
    assert!(stored.analysis.is_none());
    assert!(stored.analysis_failed_at.is_none());
}

#[tokio::test]
async fn bounded_queue_reports_full_and_closed() {
    let (queue, receiver) = analysis_channel(1);
    let id = Uuid::new_v4();
    assert_eq!(queue.enqueue(id), Ok(()));
    assert_eq!(queue.enqueue(id), Err(QueueError::Full));
    drop(receiver);
    assert_eq!(queue.enqueue(id), Err(QueueError::Closed));
}

#[tokio::test]
async fn running_worker_drains_the_queue_until_cancelled() {
    let app = TestApp::new();
    let deal = app.client_message("mid:w1", "psid-14", "price?").await;
    let (queue, receiver) = analysis_channel(8);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker(&app, Ok(sample_analysis(70))).run(receiver, cancel.clone()));

    queue.enqueue(deal.id).expect("enqueue");
    let mut analyzed = false;
    for _ in 0..100 {
        if app.db.get_deal(deal.id).await.expect("deal").analysis.is_some() {
            analyzed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(analyzed);

    cancel.cancel();
    handle.await.expect("worker task");
}

//=========================================================================================
// Priority
//=========================================================================================

#[tokio::test]
async fn closed_deals_ignore_priority_keywords() {
    let app = TestApp::new();
    let deal = app.client_message("mid:p1", "psid-30", "hello").await;
    assert!(!deal.is_priority);
    let lead = app.actor("lead@example.com", ActorRole::Supervisor).await;
    let engine = &app.state.engine;
    let closed = engine
        .set_status(deal.id, &lead, DealStatus::Closed)
        .await
        .expect("closed");

    let outcome = engine
        .record_client_message(&closed, "сколько стоит", Utc::now())
        .await
        .expect("message recorded");

    assert!(!outcome.deal.is_priority);
    assert!(!outcome.priority_raised);
    assert_eq!(outcome.deal.status, DealStatus::Closed);
    assert!(!app
        .notifier
        .alerts()
        .iter()
        .any(|a| matches!(a, ManagerAlert::PriorityDeal { .. })));
    assert!(!engine.get(deal.id).await.expect("deal").is_priority);
}
