//! Integration tests for interval reconstruction and session hand-off

use chrono::DateTime;
use presence_counter::domain::{SessionId, SessionLabels};
use presence_counter::infra::{Clock, Db, DurationStore, Liveness, Metrics, MockClock};
use presence_counter::io::mock_collector::{serve, CollectorState};
use presence_counter::io::BatchExporter;
use presence_counter::services::queue::{IMAGES_QUEUE, SENDS_QUEUE};
use presence_counter::services::{
    ConsumerStage, DurableQueue, IdentifierResolver, ImageExporter, QueueConsumer, SessionSender,
    Sessionizer,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn unix(rfc3339: &str) -> i64 {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().timestamp()
}

fn ids(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

struct Fixture {
    sessionizer: Sessionizer,
    store: DurationStore,
    images: DurableQueue,
    sends: DurableQueue,
}

fn fixture(clock: Arc<MockClock>) -> Fixture {
    let durations = Db::in_memory().unwrap();
    let queues = Db::in_memory().unwrap();
    let store = DurationStore::new(durations).unwrap();
    let images = DurableQueue::new(queues.clone(), IMAGES_QUEUE).unwrap();
    let sends = DurableQueue::new(queues, SENDS_QUEUE).unwrap();
    let sessionizer = Sessionizer::new(
        store.clone(),
        vec![images.clone(), sends.clone()],
        clock,
        Arc::new(Metrics::new()),
    );
    Fixture { sessionizer, store, images, sends }
}

#[test]
fn test_scenario_a_both_extended() {
    let f = fixture(Arc::new(MockClock::at_unix(0)));
    let eight = unix("1975-10-11T08:00:00-04:00");
    let nine = unix("1975-10-11T09:00:00-04:00");

    f.sessionizer.observe(&ids(&["AA", "BB"]), eight).unwrap();
    f.sessionizer.observe(&ids(&["AA", "BB"]), nine).unwrap();

    for id in ["AA", "BB"] {
        let rows = f.store.intervals_for(id).unwrap();
        assert_eq!(rows.len(), 1, "{id}");
        assert_eq!((rows[0].start, rows[0].end), (eight, nine), "{id}");
    }
}

#[test]
fn test_scenario_b_missed_identifier_frozen() {
    let f = fixture(Arc::new(MockClock::at_unix(0)));
    let eight = unix("1975-10-11T08:00:00-04:00");
    let nine = unix("1975-10-11T09:00:00-04:00");

    f.sessionizer.observe(&ids(&["AA", "BB"]), eight).unwrap();
    f.sessionizer.observe(&ids(&["AA"]), nine).unwrap();

    let aa = f.store.intervals_for("AA").unwrap();
    assert_eq!((aa[0].start, aa[0].end), (eight, nine));
    let bb = f.store.intervals_for("BB").unwrap();
    assert_eq!((bb[0].start, bb[0].end, bb[0].open), (eight, eight, false));
}

#[test]
fn test_observe_is_idempotent() {
    let f = fixture(Arc::new(MockClock::at_unix(0)));
    f.sessionizer.observe(&ids(&["AA", "BB"]), 1_000).unwrap();
    f.sessionizer.observe(&ids(&["AA", "BB"]), 1_000).unwrap();

    let all = f.store.all_intervals().unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|d| d.start == 1_000 && d.end == 1_000 && d.open));
}

#[test]
fn test_no_merge_across_miss_and_large_gaps_tolerated() {
    let f = fixture(Arc::new(MockClock::at_unix(0)));
    f.sessionizer.observe(&ids(&["AA"]), 100).unwrap();
    f.sessionizer.observe(&ids(&["AA"]), 160).unwrap();
    f.sessionizer.observe(&ids(&[]), 220).unwrap();
    f.sessionizer.observe(&ids(&["AA"]), 280).unwrap();
    // Days between calls; no cap on interval length
    f.sessionizer.observe(&ids(&["AA"]), 280 + 5 * 86_400).unwrap();

    let rows = f.store.intervals_for("AA").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].start, rows[0].end), (100, 160));
    assert_eq!((rows[1].start, rows[1].end), (280, 280 + 5 * 86_400));
}

#[test]
fn test_resolver_totality_through_sessionizer() {
    let f = fixture(Arc::new(MockClock::at_unix(0)));
    let resolver = IdentifierResolver::builtin();

    let mut counts = FxHashMap::default();
    counts.insert("F0:18:98:00:00:01".to_string(), 2);
    counts.insert("12:34:56:78:9A:BC".to_string(), 1);
    let entries = resolver.resolve(&counts);
    assert_eq!(entries.len(), 2);

    f.sessionizer.observe_entries(&entries, 500).unwrap();
    assert_eq!(f.store.intervals_for("F0:18:98:00:00:01").unwrap()[0].manufacturer, "Apple");
    assert_eq!(f.store.intervals_for("12:34:56:78:9A:BC").unwrap()[0].manufacturer, "unknown");
}

#[tokio::test]
async fn test_rotated_session_survives_failed_export_then_clears() {
    let clock = Arc::new(MockClock::at_unix(unix("1975-10-11T08:00:00-04:00")));
    let f = fixture(clock.clone());
    let f = Fixture { sessionizer: f.sessionizer.with_reset_interval(Some(3600)), ..f };

    f.sessionizer.rotate_if_due().unwrap();
    let names: Vec<String> = (0..25).map(|i| format!("AA:BB:CC:00:00:{i:02X}")).collect();
    let snapshot: BTreeSet<String> = names.iter().cloned().collect();
    f.sessionizer.observe(&snapshot, clock.unix()).unwrap();

    clock.advance(Duration::from_secs(3600));
    assert_eq!(f.sessionizer.rotate_if_due().unwrap(), Some(SessionId(1)));
    assert_eq!(f.sends.as_list().unwrap(), vec!["1"]);
    assert_eq!(f.images.as_list().unwrap(), vec!["1"]);

    // Collector rejects the second chunk: the whole export fails
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}/durations/", listener.local_addr().unwrap());
    let state = Arc::new(CollectorState::new(Some("key")).failing_on(2));
    let (_kill_tx, kill_rx) = watch::channel(false);
    tokio::spawn(serve(listener, state.clone(), kill_rx));

    let labels = SessionLabels { fcfs_seq_id: "ME0000-001".to_string(), device_tag: "lobby".to_string() };
    let sender = SessionSender::new(
        f.store.clone(),
        f.sends.clone(),
        BatchExporter::new("key").unwrap(),
        &endpoint,
        labels.clone(),
        Arc::new(Metrics::new()),
    );

    let first = sender.process_pending().await.unwrap();
    assert_eq!((first.processed, first.failed), (0, 1));
    assert_eq!(f.sends.as_list().unwrap(), vec!["1"]);

    // Retry: the injected failure was a one-off, so every chunk goes through
    let second = sender.process_pending().await.unwrap();
    assert_eq!((second.processed, second.failed), (1, 0));
    assert!(f.sends.is_empty().unwrap());
    assert_eq!(state.chunk_sizes(), vec![20, 5, 20, 5]);

    // Images queue is independent of the export outcome
    let dir = tempdir().unwrap();
    let images = ImageExporter::new(
        f.store.clone(),
        f.images.clone(),
        clock.clone(),
        dir.path(),
        &dir.path().join("images"),
        labels,
        Arc::new(Metrics::new()),
    );
    let pass = images.process_pending().await.unwrap();
    assert_eq!(pass.processed, 1);
    assert!(images.image_path(SessionId(1)).exists());
    assert!(f.images.is_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rotation_during_running_sender_loses_nothing() {
    let clock = Arc::new(MockClock::at_unix(unix("1975-10-11T08:00:00-04:00")));
    let f = fixture(clock.clone());
    let sessionizer = f.sessionizer.with_reset_interval(Some(60));

    sessionizer.rotate_if_due().unwrap();
    let snapshot: BTreeSet<String> = (0..7).map(|i| format!("AA:BB:CC:00:01:{i:02X}")).collect();
    sessionizer.observe(&snapshot, clock.unix()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}/durations/", listener.local_addr().unwrap());
    let state = Arc::new(CollectorState::new(None));
    let (kill_tx, kill_rx) = watch::channel(false);
    tokio::spawn(serve(listener, state.clone(), kill_rx.clone()));

    let labels = SessionLabels { fcfs_seq_id: "ME0000-001".to_string(), device_tag: "lobby".to_string() };
    let sender = SessionSender::new(
        f.store.clone(),
        f.sends.clone(),
        BatchExporter::new("any").unwrap(),
        &endpoint,
        labels,
        Arc::new(Metrics::new()),
    );
    // Passes back to back, so some land while the rotation is half done
    let stage = tokio::spawn(
        ConsumerStage::new(sender, Duration::from_millis(1)).run(Liveness::detached(), kill_rx),
    );

    clock.advance(Duration::from_secs(60));
    let rotated = tokio::task::spawn_blocking(move || sessionizer.rotate_if_due())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rotated, Some(SessionId(1)));

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !f.sends.is_empty().unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    assert_eq!(state.chunk_sizes(), vec![7]);

    kill_tx.send(true).unwrap();
    stage.await.unwrap();
}
