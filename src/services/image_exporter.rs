//! Chart rendering for completed sessions
//!
//! Consumes the `images` queue. The file name carries the clock's local date
//! at render time, so a retry on a later day writes under the later date.

use crate::domain::types::{SessionId, SessionLabels};
use crate::infra::clock::Clock;
use crate::infra::db::StoreResult;
use crate::infra::metrics::Metrics;
use crate::infra::store::DurationStore;
use crate::io::chart::{image_filename, write_chart};
use crate::services::consumer::{drain_queue, ConsumeError, PassSummary, QueueConsumer};
use crate::services::queue::DurableQueue;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct ImageExporter {
    store: DurationStore,
    queue: DurableQueue,
    clock: Arc<dyn Clock>,
    www_root: PathBuf,
    images_dir: PathBuf,
    labels: SessionLabels,
    metrics: Arc<Metrics>,
}

impl ImageExporter {
    pub fn new(
        store: DurationStore,
        queue: DurableQueue,
        clock: Arc<dyn Clock>,
        www_root: &Path,
        images_dir: &Path,
        labels: SessionLabels,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            www_root: www_root.to_path_buf(),
            images_dir: images_dir.to_path_buf(),
            labels,
            metrics,
        }
    }

    /// Where the chart for `session` goes if rendered now
    pub fn image_path(&self, session: SessionId) -> PathBuf {
        self.images_dir.join(image_filename(
            self.clock.local_date(),
            session,
            &self.labels.fcfs_seq_id,
            &self.labels.device_tag,
        ))
    }

    fn ensure_dirs(&self) -> Result<(), ConsumeError> {
        for dir in [&self.www_root, &self.images_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConsumeError::Directory {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    async fn render_session(&self, session: SessionId) -> Result<(), ConsumeError> {
        if !self.store.is_filed(session)? {
            return Err(ConsumeError::NotFiled(session));
        }
        let durations = self.store.durations_for_session(session)?;
        self.ensure_dirs()?;

        let path = self.image_path(session);
        let target = path.clone();
        let patrons = durations.len();
        let result = tokio::task::spawn_blocking(move || write_chart(&target, &durations)).await;

        let outcome = match result {
            Ok(rendered) => rendered.map_err(ConsumeError::from),
            Err(e) => Err(ConsumeError::Worker(e.to_string())),
        };
        self.metrics.record_image(outcome.is_ok());
        outcome?;

        info!(session_id = %session, patrons = patrons, path = %path.display(), "session_image_written");
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for ImageExporter {
    fn name(&self) -> &'static str {
        "images"
    }

    async fn process_pending(&self) -> StoreResult<PassSummary> {
        drain_queue(&self.queue, |session| self.render_session(session)).await
    }
}
