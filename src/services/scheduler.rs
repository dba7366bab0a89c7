//! Capture scheduling
//!
//! Each cycle runs the capture tool for a fixed duration and turns its output
//! into a snapshot of identifiers. The adapter is re-resolved on the first
//! cycle and every `rediscover_every` cycles after that; when discovery finds
//! nothing the previous adapter is kept.
//!
//! In the stage loop the capture runs on its own task so probes are answered
//! while it is in flight. A failed capture produces no snapshot at all: an
//! empty snapshot would close every open interval.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::supervisor::Liveness;
use crate::io::capture::{split_identifiers, Capture, CaptureError};
use crate::io::discovery::AdapterDiscovery;
use crate::services::stage::{await_answering, forward, killed, Forward};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("capture failed {failures} times in a row, last error: {last}")]
    CaptureFailing {
        failures: u32,
        #[source]
        last: CaptureError,
    },
}

/// Scheduler settings, normally taken from `Config`
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub adapter: String,
    pub duration: Duration,
    pub cycle_interval: Duration,
    pub rediscover_every: u32,
    pub min_identifier_len: usize,
    pub max_consecutive_failures: u32,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            adapter: config.capture_adapter().to_string(),
            duration: config.capture_duration(),
            cycle_interval: config.capture_cycle_interval(),
            rediscover_every: config.capture_rediscover_every(),
            min_identifier_len: config.min_identifier_len(),
            max_consecutive_failures: config.max_consecutive_capture_failures(),
        }
    }
}

pub struct CaptureScheduler {
    capture: Arc<dyn Capture>,
    discovery: Arc<dyn AdapterDiscovery>,
    settings: SchedulerSettings,
    adapter: String,
    cycles: u64,
    metrics: Arc<Metrics>,
}

impl CaptureScheduler {
    pub fn new(
        capture: Arc<dyn Capture>,
        discovery: Arc<dyn AdapterDiscovery>,
        settings: SchedulerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let adapter = settings.adapter.clone();
        Self { capture, discovery, settings, adapter, cycles: 0, metrics }
    }

    /// Adapter the next capture will use
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Advance the cycle counter, rediscovering the adapter when due
    fn begin_cycle(&mut self) -> String {
        let every = u64::from(self.settings.rediscover_every.max(1));
        if self.cycles % every == 0 {
            match self.discovery.discover() {
                Some(found) if found != self.adapter => {
                    info!(previous = %self.adapter, adapter = %found, "capture_adapter_changed");
                    self.adapter = found;
                }
                Some(_) => {}
                None => {
                    warn!(adapter = %self.adapter, "capture_adapter_not_found_keeping_previous");
                }
            }
        }
        self.cycles += 1;
        self.adapter.clone()
    }

    fn snapshot(&self, raw: &str, started: Instant) -> Vec<String> {
        let identifiers = split_identifiers(raw, self.settings.min_identifier_len);
        self.metrics.record_capture(identifiers.len(), started.elapsed().as_millis() as u64);
        identifiers
    }

    /// One capture cycle, blocking for the capture duration
    pub async fn run_cycle(&mut self) -> Result<Vec<String>, CaptureError> {
        let adapter = self.begin_cycle();
        let started = Instant::now();
        let raw = self.capture.capture(&adapter, self.settings.duration).await?;
        Ok(self.snapshot(&raw, started))
    }

    /// Stage loop
    ///
    /// Ends with an error after `max_consecutive_failures` failed captures.
    pub async fn run(
        mut self,
        snapshots_tx: mpsc::Sender<Vec<String>>,
        mut liveness: Liveness,
        mut kill: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        info!(
            adapter = %self.adapter,
            duration_secs = self.settings.duration.as_secs(),
            rediscover_every = self.settings.rediscover_every,
            "capture_scheduler_started"
        );

        let mut ticker = interval(self.settings.cycle_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = killed(&mut kill) => break,
                _ = liveness.probed() => liveness.reply(),
                _ = ticker.tick() => {
                    let adapter = self.begin_cycle();
                    let started = Instant::now();
                    let capture = self.capture.clone();
                    let duration = self.settings.duration;
                    let job = tokio::spawn(async move { capture.capture(&adapter, duration).await });

                    let outcome = match await_answering(job, &mut liveness).await {
                        Ok(result) => result,
                        Err(e) => Err(CaptureError::Aborted(e.to_string())),
                    };

                    match outcome {
                        Ok(raw) => {
                            failures = 0;
                            let snapshot = self.snapshot(&raw, started);
                            debug!(
                                cycle = self.cycles,
                                identifiers = snapshot.len(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "capture_cycle_complete"
                            );
                            if forward(&snapshots_tx, snapshot, &mut liveness, &mut kill).await
                                != Forward::Sent
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            self.metrics.record_capture_failure();
                            warn!(
                                cycle = self.cycles,
                                failures = failures,
                                adapter = %self.adapter,
                                error = %e,
                                "capture_failed"
                            );
                            if failures >= self.settings.max_consecutive_failures {
                                error!(failures = failures, "capture_failing_giving_up");
                                return Err(SchedulerError::CaptureFailing { failures, last: e });
                            }
                        }
                    }
                }
            }
        }

        info!(cycles = self.cycles, "capture_scheduler_stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replays canned results and records the adapter of every call
    struct ScriptedCapture {
        results: Mutex<Vec<Result<String, CaptureError>>>,
        adapters: Mutex<Vec<String>>,
    }

    impl ScriptedCapture {
        fn new(mut results: Vec<Result<String, CaptureError>>) -> Self {
            results.reverse();
            Self { results: Mutex::new(results), adapters: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Capture for ScriptedCapture {
        async fn capture(&self, adapter: &str, _duration: Duration) -> Result<String, CaptureError> {
            self.adapters.lock().push(adapter.to_string());
            self.results.lock().pop().unwrap_or_else(|| Ok(String::new()))
        }
    }

    /// Reports a fixed sequence of discovery results, then nothing
    struct ScriptedDiscovery(Mutex<Vec<Option<String>>>);

    impl AdapterDiscovery for ScriptedDiscovery {
        fn discover(&self) -> Option<String> {
            let mut answers = self.0.lock();
            if answers.is_empty() {
                None
            } else {
                answers.remove(0)
            }
        }
    }

    fn settings(rediscover_every: u32, max_failures: u32) -> SchedulerSettings {
        SchedulerSettings {
            adapter: "wlan1".to_string(),
            duration: Duration::from_secs(1),
            cycle_interval: Duration::from_millis(1),
            rediscover_every,
            min_identifier_len: 17,
            max_consecutive_failures: max_failures,
        }
    }

    fn failure() -> Result<String, CaptureError> {
        Err(CaptureError::Exit { code: Some(1), stderr: "permission denied".to_string() })
    }

    #[tokio::test]
    async fn test_run_cycle_filters_short_identifiers() {
        let capture = Arc::new(ScriptedCapture::new(vec![Ok(
            "AA:AA:AA:AA:AA:AA\nshort\n\nBB:BB:BB:BB:BB:BB\n".to_string(),
        )]));
        let discovery = Arc::new(ScriptedDiscovery(Mutex::new(vec![])));
        let mut scheduler =
            CaptureScheduler::new(capture, discovery, settings(10, 3), Arc::new(Metrics::new()));

        let snapshot = scheduler.run_cycle().await.unwrap();
        assert_eq!(snapshot, vec!["AA:AA:AA:AA:AA:AA", "BB:BB:BB:BB:BB:BB"]);
    }

    #[tokio::test]
    async fn test_rediscovery_cadence_and_retention() {
        let capture = Arc::new(ScriptedCapture::new(vec![]));
        let discovery = Arc::new(ScriptedDiscovery(Mutex::new(vec![
            Some("wlan2".to_string()),
            None,
            Some("wlan3".to_string()),
        ])));
        let mut scheduler = CaptureScheduler::new(
            capture.clone(),
            discovery,
            settings(2, 3),
            Arc::new(Metrics::new()),
        );

        for _ in 0..6 {
            scheduler.run_cycle().await.unwrap();
        }

        // Discovery runs on cycles 0, 2 and 4; the miss on cycle 2 keeps wlan2
        assert_eq!(
            *capture.adapters.lock(),
            vec!["wlan2", "wlan2", "wlan2", "wlan2", "wlan3", "wlan3"]
        );
    }

    #[tokio::test]
    async fn test_failed_capture_is_an_error_not_empty() {
        let capture = Arc::new(ScriptedCapture::new(vec![failure()]));
        let discovery = Arc::new(ScriptedDiscovery(Mutex::new(vec![])));
        let mut scheduler =
            CaptureScheduler::new(capture, discovery, settings(10, 3), Arc::new(Metrics::new()));

        assert!(scheduler.run_cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_stage_skips_failures_then_gives_up() {
        let capture = Arc::new(ScriptedCapture::new(vec![
            failure(),
            Ok("AA:AA:AA:AA:AA:AA\n".to_string()),
            failure(),
            failure(),
        ]));
        let discovery = Arc::new(ScriptedDiscovery(Mutex::new(vec![])));
        let metrics = Arc::new(Metrics::new());
        let scheduler = CaptureScheduler::new(capture, discovery, settings(10, 2), metrics.clone());

        let (tx, mut rx) = mpsc::channel(1);
        let (_kill_tx, kill_rx) = watch::channel(false);
        let stage = tokio::spawn(scheduler.run(tx, Liveness::detached(), kill_rx));

        // Only the successful cycle produced a snapshot
        assert_eq!(rx.recv().await.unwrap(), vec!["AA:AA:AA:AA:AA:AA"]);

        let result = stage.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::CaptureFailing { failures: 2, .. })));
        assert!(rx.recv().await.is_none());
        assert_eq!(metrics.report().capture_failures_total, 3);
    }
}
