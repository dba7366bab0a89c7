//! Periodic consumers of the completed-session queues
//!
//! A pass walks the queue once in insertion order. A session whose handler
//! succeeds is removed; one that fails is logged and left for the next pass,
//! and the walk carries on with the remaining tokens. Handlers must be safe to
//! run again on the same session.
//!
//! A token can be visible before its session is filed (rotation queues first).
//! Handlers report that as `ConsumeError::NotFiled`; the token is kept and the
//! pass counts it as deferred rather than failed.

use crate::domain::types::SessionId;
use crate::infra::db::{StoreError, StoreResult};
use crate::infra::supervisor::Liveness;
use crate::io::chart::ChartError;
use crate::io::export::ExportError;
use crate::services::queue::DurableQueue;
use crate::services::stage::{await_answering, killed};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to create directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Chart(#[from] ChartError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("session {0} is still open")]
    NotFiled(SessionId),
}

/// Outcome of one pass over a queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub processed: usize,
    pub failed: usize,
    /// Tokens that do not name a session; dropped
    pub malformed: usize,
    /// Sessions queued but not yet filed; kept for a later pass
    pub deferred: usize,
}

/// Walk `queue` once, removing each token `handle` succeeds on
pub async fn drain_queue<F, Fut>(queue: &DurableQueue, mut handle: F) -> StoreResult<PassSummary>
where
    F: FnMut(SessionId) -> Fut,
    Fut: Future<Output = Result<(), ConsumeError>>,
{
    let mut summary = PassSummary::default();

    for token in queue.as_list()? {
        let Some(session) = SessionId::from_token(&token) else {
            warn!(queue = %queue.name(), token = %token, "queue_token_malformed_dropped");
            queue.remove(&token)?;
            summary.malformed += 1;
            continue;
        };

        match handle(session).await {
            Ok(()) => {
                queue.remove(&token)?;
                summary.processed += 1;
            }
            Err(ConsumeError::NotFiled(_)) => {
                debug!(queue = %queue.name(), session_id = %session, "queue_item_not_filed_deferred");
                summary.deferred += 1;
            }
            Err(e) => {
                error!(queue = %queue.name(), session_id = %session, error = %e, "queue_item_failed");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// A queue-draining worker
#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    /// Stage name used for liveness and logs
    fn name(&self) -> &'static str;

    /// One pass over the pending sessions
    async fn process_pending(&self) -> StoreResult<PassSummary>;
}

/// Drives a consumer on a fixed period
pub struct ConsumerStage<C> {
    consumer: Arc<C>,
    period: Duration,
}

impl<C: QueueConsumer> ConsumerStage<C> {
    pub fn new(consumer: C, period: Duration) -> Self {
        Self { consumer: Arc::new(consumer), period }
    }

    /// Passes run on their own task so probes are answered during long ones
    pub async fn run(self, mut liveness: Liveness, mut kill: watch::Receiver<bool>) {
        let name = self.consumer.name();
        info!(stage = %name, period_secs = self.period.as_secs(), "consumer_started");

        let mut ticker = interval(self.period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = killed(&mut kill) => break,
                _ = liveness.probed() => liveness.reply(),
                _ = ticker.tick() => {
                    let consumer = self.consumer.clone();
                    let pass = tokio::spawn(async move { consumer.process_pending().await });

                    match await_answering(pass, &mut liveness).await {
                        Ok(Ok(summary)) if summary == PassSummary::default() => {
                            debug!(stage = %name, "consumer_pass_idle");
                        }
                        Ok(Ok(summary)) => info!(
                            stage = %name,
                            processed = summary.processed,
                            failed = summary.failed,
                            malformed = summary.malformed,
                            deferred = summary.deferred,
                            "consumer_pass_complete"
                        ),
                        Ok(Err(e)) => error!(stage = %name, error = %e, "consumer_pass_failed"),
                        Err(e) => error!(stage = %name, error = %e, "consumer_pass_panicked"),
                    }
                }
            }
        }

        info!(stage = %name, "consumer_stopped");
    }
}
