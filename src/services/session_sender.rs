//! Remote export of completed sessions
//!
//! Consumes the `sends` queue. A session is removed only once every chunk of
//! its records has been accepted; with export disabled the queue is left alone
//! so nothing is lost when it is turned back on.

use crate::domain::types::{Record, SessionId, SessionLabels};
use crate::infra::db::StoreResult;
use crate::infra::metrics::Metrics;
use crate::infra::store::DurationStore;
use crate::io::export::BatchExporter;
use crate::services::consumer::{drain_queue, ConsumeError, PassSummary, QueueConsumer};
use crate::services::queue::DurableQueue;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SessionSender {
    store: DurationStore,
    queue: DurableQueue,
    exporter: BatchExporter,
    endpoint: String,
    labels: SessionLabels,
    enabled: bool,
    metrics: Arc<Metrics>,
}

impl SessionSender {
    pub fn new(
        store: DurationStore,
        queue: DurableQueue,
        exporter: BatchExporter,
        endpoint: &str,
        labels: SessionLabels,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            exporter,
            endpoint: endpoint.to_string(),
            labels,
            enabled: true,
            metrics,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Flat records for one session, in patron order
    pub fn records_for(&self, session: SessionId) -> StoreResult<Vec<Record>> {
        Ok(self
            .store
            .durations_for_session(session)?
            .iter()
            .map(|d| d.to_record(&self.labels))
            .collect())
    }

    async fn send_session(&self, session: SessionId) -> Result<(), ConsumeError> {
        if !self.store.is_filed(session)? {
            return Err(ConsumeError::NotFiled(session));
        }
        let records = self.records_for(session)?;
        let result = self.exporter.export(&self.endpoint, &records).await;
        self.metrics.record_export(result.is_ok(), records.len());

        let index = result?;
        info!(session_id = %session, records = records.len(), index = index, "session_exported");
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for SessionSender {
    fn name(&self) -> &'static str {
        "sends"
    }

    async fn process_pending(&self) -> StoreResult<PassSummary> {
        if !self.enabled {
            debug!(pending = self.queue.len()?, "export_disabled_skipping");
            return Ok(PassSummary::default());
        }
        drain_queue(&self.queue, |session| self.send_session(session)).await
    }
}
