//! services/api/src/web/analysis_task.rs
//!
//! Background AI analysis: a bounded job queue, the worker draining it and the
//! periodic sweep that re-enqueues deals whose last analysis failed.

use deal_desk_core::{
    domain::AnalysisRequest,
    lifecycle::{DealLifecycleEngine, LifecycleError},
    ports::{AnalysisFailure, AnalysisQueue, AnalysisService, MessageHistoryService, QueueError},
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on deals re-enqueued by one sweep.
const RETRY_SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisJob {
    pub deal_id: Uuid,
}

/// The sending half of the job queue, handed to the lifecycle engine.
#[derive(Clone)]
pub struct ChannelAnalysisQueue {
    sender: mpsc::Sender<AnalysisJob>,
}

impl AnalysisQueue for ChannelAnalysisQueue {
    fn enqueue(&self, deal_id: Uuid) -> Result<(), QueueError> {
        self.sender
            .try_send(AnalysisJob { deal_id })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }
}

pub fn analysis_channel(capacity: usize) -> (ChannelAnalysisQueue, mpsc::Receiver<AnalysisJob>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ChannelAnalysisQueue { sender }, receiver)
}

pub struct AnalysisWorker {
    engine: Arc<DealLifecycleEngine>,
    analyzer: Arc<dyn AnalysisService>,
    history: Arc<dyn MessageHistoryService>,
    history_limit: usize,
    concurrency: usize,
}

impl AnalysisWorker {
    pub fn new(
        engine: Arc<DealLifecycleEngine>,
        analyzer: Arc<dyn AnalysisService>,
        history: Arc<dyn MessageHistoryService>,
        history_limit: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            analyzer,
            history,
            history_limit,
            concurrency: concurrency.max(1),
        }
    }

    /// Drains the queue until it closes or `cancel` fires.
    pub async fn run(self, receiver: mpsc::Receiver<AnalysisJob>, cancel: CancellationToken) {
        info!(concurrency = self.concurrency, "Analysis worker started.");
        let jobs = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|job| (job, receiver))
        });
        let worker = &self;
        tokio::select! {
            _ = cancel.cancelled() => info!("Analysis worker cancelled."),
            _ = jobs.for_each_concurrent(self.concurrency, |job| async move {
                if let Err(e) = worker.process(job.deal_id).await {
                    error!(deal_id = %job.deal_id, "Analysis job failed: {}", e);
                }
            }) => info!("Analysis queue closed; worker stopping."),
        }
    }

    /// Scores one deal and stores the outcome, success or failure.
    pub async fn process(&self, deal_id: Uuid) -> Result<(), LifecycleError> {
        let deal = match self.engine.get(deal_id).await {
            Ok(deal) => deal,
            Err(LifecycleError::NotFound(_)) => {
                warn!(deal_id = %deal_id, "Deal vanished before analysis.");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if deal.status.is_closed() {
            debug!(deal_id = %deal_id, "Skipping analysis of a closed deal.");
            return Ok(());
        }

        let result = match self.history.recent_messages(&deal, self.history_limit).await {
            Ok(messages) if messages.is_empty() => Err(AnalysisFailure::EmptyHistory),
            Ok(messages) => {
                self.analyzer
                    .analyze(&AnalysisRequest { deal_id, messages })
                    .await
            }
            Err(e) => Err(AnalysisFailure::Provider(format!(
                "message history unavailable: {}",
                e
            ))),
        };
        self.engine.apply_ai_analysis(deal_id, result).await?;
        Ok(())
    }
}

/// Periodically re-enqueues open deals whose failed analysis has cooled down.
pub async fn run_retry_sweep(
    engine: Arc<DealLifecycleEngine>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match engine.requeue_failed_analyses(chrono::Utc::now(), RETRY_SWEEP_BATCH).await {
                    Ok(0) => {}
                    Ok(n) => info!(requeued = n, "Re-enqueued failed analyses."),
                    Err(e) => warn!("Analysis retry sweep failed: {:?}", e),
                }
            }
        }
    }
}

/// Waits for spawned background tasks after shutdown and logs the ones that
/// panicked or were aborted. Returns how many failed.
pub async fn join_background_tasks(tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, "Background task failed: {}", e);
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_tasks_are_counted() {
        let healthy = tokio::spawn(async {});
        let broken = tokio::spawn(async { panic!("worker blew up") });
        let failed = join_background_tasks(vec![("healthy", healthy), ("broken", broken)]).await;
        assert_eq!(failed, 1);
    }
}
