//! Liveness watchdog for the pipeline stages
//!
//! Each stage subscribes with a name and a reply budget and gets a `Liveness`
//! handle. The supervisor probes every stage on a fixed interval; a stage
//! answers by replying with its own name. A stage that stays silent past its
//! budget is considered stalled and `run` returns `SupervisorError::Stalled`,
//! which the binary treats as fatal.
//!
//! Probe channels hold a single probe, so a busy stage sees at most one pending
//! probe rather than a backlog.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("stage '{stage}' silent for {silent_ms}ms (budget {timeout_ms}ms)")]
    Stalled { stage: String, silent_ms: u64, timeout_ms: u64 },
}

/// Stage side of a subscription
pub struct Liveness {
    link: Option<Link>,
}

struct Link {
    name: String,
    probe_rx: mpsc::Receiver<()>,
    reply_tx: mpsc::Sender<String>,
}

impl Liveness {
    /// Handle that never sees a probe (tests end stages via the kill signal)
    pub fn detached() -> Self {
        Self { link: None }
    }

    /// Wait for the next probe; pends forever when detached or orphaned
    pub async fn probed(&mut self) {
        loop {
            match self.link.as_mut() {
                None => std::future::pending::<()>().await,
                Some(link) => {
                    if link.probe_rx.recv().await.is_some() {
                        return;
                    }
                    debug!(stage = %link.name, "liveness_supervisor_gone");
                    self.link = None;
                }
            }
        }
    }

    /// Answer a probe with this stage's name
    pub fn reply(&self) {
        if let Some(link) = &self.link {
            let _ = link.reply_tx.try_send(link.name.clone());
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }
}

struct Registration {
    name: String,
    timeout: Duration,
    probe_tx: mpsc::Sender<()>,
    reply_rx: mpsc::Receiver<String>,
    last_reply: Instant,
}

/// Registry of stage subscriptions
pub struct Supervisor {
    registrations: Vec<Registration>,
    probe_interval: Duration,
}

impl Supervisor {
    pub fn new(probe_interval: Duration) -> Self {
        Self { registrations: Vec::new(), probe_interval }
    }

    /// Register a stage and return its probe/reply handle
    pub fn subscribe(&mut self, name: &str, timeout: Duration) -> Liveness {
        let (probe_tx, probe_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(4);

        info!(stage = %name, timeout_ms = timeout.as_millis() as u64, "liveness_subscribed");

        self.registrations.push(Registration {
            name: name.to_string(),
            timeout,
            probe_tx,
            reply_rx,
            last_reply: Instant::now(),
        });

        Liveness {
            link: Some(Link { name: name.to_string(), probe_rx, reply_tx }),
        }
    }

    pub fn stages(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Probe all stages until killed or a stage stalls
    pub async fn run(mut self, mut kill: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        info!(
            stages = ?self.stages(),
            probe_interval_ms = self.probe_interval.as_millis() as u64,
            "supervisor_started"
        );

        let start = Instant::now();
        for reg in &mut self.registrations {
            reg.last_reply = start;
        }

        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = kill.changed() => {
                    if *kill.borrow() {
                        info!("supervisor_shutdown");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Instant::now()) {
                        error!(error = %e, "stage_stalled");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Collect replies, check budgets, then send the next round of probes
    pub fn sweep(&mut self, now: Instant) -> Result<(), SupervisorError> {
        for reg in &mut self.registrations {
            while let Ok(reply) = reg.reply_rx.try_recv() {
                if reply == reg.name {
                    reg.last_reply = now;
                } else {
                    warn!(stage = %reg.name, reply = %reply, "liveness_reply_mismatch");
                }
            }

            let silent = now.saturating_duration_since(reg.last_reply);
            if silent > reg.timeout {
                return Err(SupervisorError::Stalled {
                    stage: reg.name.clone(),
                    silent_ms: silent.as_millis() as u64,
                    timeout_ms: reg.timeout.as_millis() as u64,
                });
            }

            // Full means the previous probe is still unread; that is fine
            if let Err(mpsc::error::TrySendError::Closed(_)) = reg.probe_tx.try_send(()) {
                debug!(stage = %reg.name, "liveness_stage_exited");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replying_stage_stays_healthy() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let mut liveness = supervisor.subscribe("capture", Duration::from_secs(5));

        let t0 = Instant::now();
        supervisor.sweep(t0).unwrap();

        liveness.probed().await;
        liveness.reply();

        // Reply collected at t1 restarts the budget
        let t1 = t0 + Duration::from_secs(4);
        supervisor.sweep(t1).unwrap();
        let t2 = t1 + Duration::from_secs(4);
        assert!(supervisor.sweep(t2).is_ok());
    }

    #[tokio::test]
    async fn test_silent_stage_reported() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let _quiet = supervisor.subscribe("resolver", Duration::from_secs(5));

        let t0 = Instant::now();
        supervisor.sweep(t0).unwrap();

        let err = supervisor.sweep(t0 + Duration::from_secs(6)).unwrap_err();
        match err {
            SupervisorError::Stalled { stage, timeout_ms, .. } => {
                assert_eq!(stage, "resolver");
                assert_eq!(timeout_ms, 5000);
            }
        }
    }

    #[tokio::test]
    async fn test_reply_with_wrong_name_ignored() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let capture = supervisor.subscribe("capture", Duration::from_secs(5));

        // Reply naming another stage on the capture channel
        let link = capture.link.as_ref().unwrap();
        link.reply_tx.try_send("resolver".to_string()).unwrap();
        let t0 = Instant::now();
        supervisor.sweep(t0).unwrap();
        assert!(supervisor.sweep(t0 + Duration::from_secs(6)).is_err());
    }

    #[tokio::test]
    async fn test_probes_coalesce() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let liveness = supervisor.subscribe("sessionizer", Duration::from_secs(60));

        let t0 = Instant::now();
        for i in 0..5 {
            supervisor.sweep(t0 + Duration::from_secs(i)).unwrap();
        }

        let mut link = liveness.link.unwrap();
        assert!(link.probe_rx.try_recv().is_ok());
        assert!(link.probe_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detached_liveness_never_probed() {
        let mut liveness = Liveness::detached();
        assert!(!liveness.is_attached());
        liveness.reply();

        let probed = tokio::time::timeout(Duration::from_millis(20), liveness.probed()).await;
        assert!(probed.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_kill() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let _liveness = supervisor.subscribe("images", Duration::from_secs(60));
        let (kill_tx, kill_rx) = watch::channel(false);

        let handle = tokio::spawn(supervisor.run(kill_rx));
        kill_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_escalates_stalled_stage() {
        let mut supervisor = Supervisor::new(Duration::from_millis(100));
        let _silent = supervisor.subscribe("capture", Duration::from_millis(250));
        let (_kill_tx, kill_rx) = watch::channel(false);

        let result = supervisor.run(kill_rx).await;
        assert!(matches!(result, Err(SupervisorError::Stalled { stage, .. }) if stage == "capture"));
    }
}
