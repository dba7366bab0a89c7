//! Presence interval reconstruction and session rotation
//!
//! Each observation extends the open interval of every identifier it contains
//! (or opens one at `now`) and closes the open interval of every identifier it
//! does not. A closed interval is never reopened: a later sighting starts a
//! new one, however short the gap.
//!
//! A session ends when the local calendar day changes or, when configured,
//! after a fixed number of seconds. Rotation enqueues the session on the
//! image and send queues first and only then files its intervals, so a crash
//! in between leaves a queued session that the consumers process again.

use crate::domain::types::{SessionId, UNKNOWN_MANUFACTURER};
use crate::infra::clock::{local_date_of, Clock};
use crate::infra::db::StoreResult;
use crate::infra::metrics::Metrics;
use crate::infra::store::{DurationStore, IntervalChanges, SessionState};
use crate::infra::supervisor::Liveness;
use crate::services::queue::DurableQueue;
use crate::services::resolver::Entries;
use crate::services::stage::killed;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Work out which rows an observation touches
///
/// `open` maps identifier to open interval id; `seen` lists
/// (identifier, manufacturer) pairs in observation order. Repeats in `seen`
/// are folded so a snapshot never opens two intervals for one identifier.
pub fn plan_observation(open: &FxHashMap<String, i64>, seen: &[(&str, &str)]) -> IntervalChanges {
    let mut changes = IntervalChanges::default();
    let mut present: FxHashSet<&str> = FxHashSet::default();

    for &(identifier, manufacturer) in seen {
        if !present.insert(identifier) {
            continue;
        }
        match open.get(identifier) {
            Some(&id) => changes.extend.push(id),
            None => changes.create.push((identifier.to_string(), manufacturer.to_string())),
        }
    }

    changes.close = open
        .iter()
        .filter(|(identifier, _)| !present.contains(identifier.as_str()))
        .map(|(_, &id)| id)
        .collect();
    changes.close.sort_unstable();
    changes.extend.sort_unstable();
    changes
}

pub struct Sessionizer {
    store: DurationStore,
    completed: Vec<DurableQueue>,
    clock: Arc<dyn Clock>,
    reset_interval_secs: Option<u64>,
    metrics: Arc<Metrics>,
}

impl Sessionizer {
    /// `completed` receives the token of every rotated session
    pub fn new(
        store: DurationStore,
        completed: Vec<DurableQueue>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, completed, clock, reset_interval_secs: None, metrics }
    }

    /// Also rotate after this many seconds
    pub fn with_reset_interval(mut self, secs: Option<u64>) -> Self {
        self.reset_interval_secs = secs;
        self
    }

    pub fn store(&self) -> &DurationStore {
        &self.store
    }

    fn apply(&self, seen: &[(&str, &str)], now: i64) -> StoreResult<()> {
        let open = self.store.open_intervals()?;
        let changes = plan_observation(&open, seen);
        self.store.apply_changes(&changes, now)?;
        self.metrics.record_intervals(changes.create.len(), changes.close.len());
        Ok(())
    }

    /// Record one snapshot of identifiers seen at `now`
    pub fn observe(&self, snapshot: &BTreeSet<String>, now: i64) -> StoreResult<()> {
        let seen: Vec<(&str, &str)> =
            snapshot.iter().map(|id| (id.as_str(), UNKNOWN_MANUFACTURER)).collect();
        self.apply(&seen, now)
    }

    /// `observe` for resolver output; new intervals keep the manufacturer
    pub fn observe_entries(&self, entries: &Entries, now: i64) -> StoreResult<()> {
        let mut seen: Vec<(&str, &str)> = entries
            .values()
            .map(|e| (e.identifier.as_str(), e.manufacturer.as_str()))
            .collect();
        // Stable row order for new intervals
        seen.sort_unstable();
        self.apply(&seen, now)
    }

    pub fn should_rotate(&self, state: &SessionState, now: i64) -> bool {
        if local_date_of(state.started_at) != local_date_of(now) {
            return true;
        }
        match self.reset_interval_secs {
            Some(secs) => now - state.started_at >= secs as i64,
            None => false,
        }
    }

    /// Close `session` at `now`; returns the number of durations filed
    pub fn rotate(&self, session: SessionId, now: i64) -> StoreResult<usize> {
        let token = session.token();
        for queue in &self.completed {
            queue.enqueue(&token)?;
        }
        let filed = self.store.close_session(session, now)?;
        self.metrics.record_session_rotated();
        info!(session_id = %session, durations = filed, "session_rotated");
        Ok(filed)
    }

    /// Rotate if the current session is due; returns the closed session
    pub fn rotate_if_due(&self) -> StoreResult<Option<SessionId>> {
        let now = self.clock.unix();
        let state = self.store.session_state_or_init(now)?;
        if !self.should_rotate(&state, now) {
            return Ok(None);
        }
        self.rotate(state.id, now)?;
        Ok(Some(state.id))
    }

    /// Stage loop: rotate when due, then record each batch at the clock's now
    pub async fn run(
        self,
        mut entries_rx: mpsc::Receiver<Entries>,
        reset_check: Duration,
        mut liveness: Liveness,
        mut kill: watch::Receiver<bool>,
    ) {
        info!(
            reset_check_secs = reset_check.as_secs(),
            reset_interval_secs = ?self.reset_interval_secs,
            "sessionizer_started"
        );

        let mut ticker = interval(reset_check.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = killed(&mut kill) => break,
                _ = liveness.probed() => liveness.reply(),
                _ = ticker.tick() => {
                    if let Err(e) = self.rotate_if_due() {
                        error!(error = %e, "session_rotation_failed");
                    }
                }
                batch = entries_rx.recv() => {
                    let Some(entries) = batch else {
                        debug!("sessionizer_input_closed");
                        break;
                    };
                    // New day's sightings belong to the new session
                    if let Err(e) = self.rotate_if_due() {
                        error!(error = %e, "session_rotation_failed");
                    }
                    let now = self.clock.unix();
                    match self.observe_entries(&entries, now) {
                        Ok(()) => debug!(identifiers = entries.len(), now = now, "snapshot_observed"),
                        Err(e) => error!(error = %e, identifiers = entries.len(), "observe_failed"),
                    }
                }
            }
        }

        info!("sessionizer_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Entry;
    use crate::infra::clock::MockClock;
    use crate::infra::db::Db;
    use crate::services::queue::{IMAGES_QUEUE, SENDS_QUEUE};

    fn open(pairs: &[(&str, i64)]) -> FxHashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn sessionizer(clock: Arc<MockClock>) -> Sessionizer {
        let db = Db::in_memory().unwrap();
        let store = DurationStore::new(db.clone()).unwrap();
        let queues = vec![
            DurableQueue::new(db.clone(), IMAGES_QUEUE).unwrap(),
            DurableQueue::new(db, SENDS_QUEUE).unwrap(),
        ];
        Sessionizer::new(store, queues, clock, Arc::new(Metrics::new()))
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_extends_creates_and_closes() {
        let changes = plan_observation(
            &open(&[("AA", 1), ("BB", 2)]),
            &[("AA", "unknown"), ("CC", "Apple"), ("AA", "unknown")],
        );
        assert_eq!(changes.extend, vec![1]);
        assert_eq!(changes.create, vec![("CC".to_string(), "Apple".to_string())]);
        assert_eq!(changes.close, vec![2]);
    }

    #[test]
    fn test_plan_empty_snapshot_closes_everything() {
        let changes = plan_observation(&open(&[("AA", 1), ("BB", 2)]), &[]);
        assert!(changes.extend.is_empty() && changes.create.is_empty());
        assert_eq!(changes.close, vec![1, 2]);
    }

    #[test]
    fn test_observe_entries_keeps_manufacturer() {
        let s = sessionizer(Arc::new(MockClock::at_unix(1_000)));
        let mut entries = Entries::default();
        entries.insert(
            "F0:18:98:00:00:01".to_string(),
            Entry {
                identifier: "F0:18:98:00:00:01".to_string(),
                manufacturer: "Apple".to_string(),
                count: 4,
            },
        );

        s.observe_entries(&entries, 1_000).unwrap();
        let rows = s.store().intervals_for("F0:18:98:00:00:01").unwrap();
        assert_eq!(rows[0].manufacturer, "Apple");
    }

    #[test]
    fn test_gap_starts_new_interval() {
        let s = sessionizer(Arc::new(MockClock::at_unix(0)));
        s.observe(&ids(&["AA"]), 100).unwrap();
        s.observe(&ids(&[]), 160).unwrap();
        s.observe(&ids(&["AA"]), 220).unwrap();

        let rows = s.store().intervals_for("AA").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].start, rows[0].end, rows[0].open), (100, 100, false));
        assert_eq!((rows[1].start, rows[1].end, rows[1].open), (220, 220, true));
    }

    #[test]
    fn test_reset_interval_rotation_enqueues_then_files() {
        let clock = Arc::new(MockClock::at_unix(10_000));
        let s = sessionizer(clock.clone()).with_reset_interval(Some(600));

        assert_eq!(s.rotate_if_due().unwrap(), None);
        s.observe(&ids(&["AA", "BB"]), 10_000).unwrap();

        clock.advance(Duration::from_secs(300));
        assert_eq!(s.rotate_if_due().unwrap(), None);

        clock.advance(Duration::from_secs(300));
        assert_eq!(s.rotate_if_due().unwrap(), Some(SessionId(1)));

        for queue in &s.completed {
            assert_eq!(queue.as_list().unwrap(), vec!["1"]);
        }
        assert_eq!(s.store().durations_for_session(SessionId(1)).unwrap().len(), 2);
        assert!(s.store().all_intervals().unwrap().is_empty());

        // The next session starts at the rotation time
        assert_eq!(s.rotate_if_due().unwrap(), None);
        let state = s.store().session_state_or_init(0).unwrap();
        assert_eq!(state, SessionState { id: SessionId(2), started_at: 10_600 });
    }

    #[test]
    fn test_day_change_rotates() {
        let s = sessionizer(Arc::new(MockClock::at_unix(0)));
        let state = SessionState { id: SessionId(1), started_at: 1_000_000 };
        assert!(!s.should_rotate(&state, 1_000_000));
        // Two days later is a different local date in every time zone
        assert!(s.should_rotate(&state, 1_000_000 + 2 * 86_400));
    }

    #[tokio::test]
    async fn test_stage_records_batches() {
        let clock = Arc::new(MockClock::at_unix(5_000));
        let s = sessionizer(clock.clone());
        let store = s.store().clone();

        let (tx, rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = watch::channel(false);
        let stage = tokio::spawn(s.run(rx, Duration::from_secs(3600), Liveness::detached(), kill_rx));

        let mut entries = Entries::default();
        entries.insert(
            "AA:AA:AA:AA:AA:AA".to_string(),
            Entry {
                identifier: "AA:AA:AA:AA:AA:AA".to_string(),
                manufacturer: "unknown".to_string(),
                count: 1,
            },
        );
        tx.send(entries.clone()).await.unwrap();
        while store.open_intervals().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        clock.advance(Duration::from_secs(60));
        tx.send(entries).await.unwrap();
        // Closing the input ends the stage after the queued batch
        drop(tx);
        stage.await.unwrap();
        drop(kill_tx);

        let rows = store.intervals_for("AA:AA:AA:AA:AA:AA").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].start, rows[0].end), (5_000, 5_060));
    }
}
