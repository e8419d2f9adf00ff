//! Full-cycle scenarios against in-memory and filesystem storage.

use std::collections::BTreeSet;
use std::sync::Arc;

use automat_conditions::{AutomationCondition, InMemoryInstance, NodeStatus};
use automat_core::{AssetKey, DaemonConfig, PartitionSubset, PartitionsDefinition};
use automat_daemon::{
    AssetDefinition, AutomationDaemon, DaemonError, InstanceSink, RecordingSink, RunRequestSink, SinkError,
};
use automat_storage::{
    EvaluationStore, FileScheduleStorage, InMemoryScheduleStorage, PersistenceError, RunRequest,
    ScheduleStorage, TickStatus,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn config() -> DaemonConfig {
    DaemonConfig {
        worker_threads: 2,
        ..DaemonConfig::default()
    }
}

fn key(name: &str) -> AssetKey {
    AssetKey::from(name)
}

/// a, b unpartitioned; p, q static over [x, y] with q/y already materialized.
fn mixed_instance() -> Arc<InMemoryInstance> {
    let instance = Arc::new(InMemoryInstance::new());
    instance.add_asset(key("a"), None, vec![]).unwrap();
    instance.add_asset(key("b"), None, vec![]).unwrap();
    instance
        .add_asset(key("p"), Some(PartitionsDefinition::static_keys(["x", "y"])), vec![])
        .unwrap();
    instance
        .add_asset(key("q"), Some(PartitionsDefinition::static_keys(["x", "y"])), vec![])
        .unwrap();
    instance
        .record_materialization(&key("q"), Some("y"), now() - Duration::hours(1))
        .unwrap();
    instance
}

fn missing_everywhere(names: &[&str]) -> Vec<AssetDefinition> {
    names
        .iter()
        .map(|n| AssetDefinition::new(*n, AutomationCondition::missing()))
        .collect()
}

struct Harness {
    storage: Arc<InMemoryScheduleStorage>,
    sink: Arc<RecordingSink>,
    daemon: AutomationDaemon,
}

fn harness(config: DaemonConfig, definitions: Vec<AssetDefinition>, instance: Arc<InMemoryInstance>) -> Harness {
    let storage = Arc::new(InMemoryScheduleStorage::new());
    let sink = Arc::new(RecordingSink::new());
    let daemon = AutomationDaemon::new(config, definitions, storage.clone(), instance, sink.clone()).unwrap();
    Harness { storage, sink, daemon }
}

// ── Requests ────────────────────────────────────────────────

#[test]
fn runs_are_grouped_and_recorded() {
    let h = harness(config(), missing_everywhere(&["a", "b", "p", "q"]), mixed_instance());
    let report = h.daemon.run_cycle(now()).unwrap();

    let tick = &report.tick;
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.evaluation_id, 1);
    let shape: Vec<(Option<&str>, Vec<String>)> = tick
        .run_requests
        .iter()
        .map(|r| {
            (
                r.partition_key.as_deref(),
                r.asset_selection.iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            (None, vec!["a".to_string(), "b".to_string()]),
            (Some("x"), vec!["p".to_string(), "q".to_string()]),
            (Some("y"), vec!["p".to_string()]),
        ]
    );
    assert_eq!(tick.run_ids.len(), 3);
    assert_eq!(tick.requested_asset_materialization_count, 5);
    assert_eq!(tick.requested_asset_keys.len(), 4);

    let submitted: Vec<String> = h.sink.submitted().into_iter().map(|(id, _)| id).collect();
    assert_eq!(submitted, tick.run_ids);

    let store = EvaluationStore::new(h.storage.as_ref());
    let records = store.get_by_evaluation_id(1).unwrap();
    assert_eq!(records.len(), 4);
    let p = records.iter().find(|r| r.asset_key == key("p")).unwrap();
    assert_eq!(p.num_requested, 2);
    assert_eq!(p.run_ids.len(), 2);
    let q = records.iter().find(|r| r.asset_key == key("q")).unwrap();
    assert_eq!(q.num_requested, 1);

    let cursor = h.storage.get_cursor(&key("p")).unwrap().unwrap();
    assert_eq!(cursor.latest_requested(), Some(&PartitionSubset::from_keys(["x", "y"])));
}

#[test]
fn in_flight_runs_are_not_requested_twice() {
    let instance = mixed_instance();
    let storage = Arc::new(InMemoryScheduleStorage::new());
    let daemon = AutomationDaemon::new(
        config(),
        missing_everywhere(&["a", "p"]),
        storage.clone(),
        instance.clone(),
        Arc::new(InstanceSink::new(instance.clone())),
    )
    .unwrap();

    let first = daemon.run_cycle(now()).unwrap();
    assert_eq!(first.tick.status, TickStatus::Success);
    assert_eq!(first.submitted.len(), 3);

    let second = daemon.run_cycle(now() + Duration::seconds(30)).unwrap();
    assert_eq!(second.tick.status, TickStatus::Skipped);
    assert_eq!(second.tick.evaluation_id, 2);

    // In-flight partitions are not candidates, so the root skips them.
    let verdict = EvaluationStore::new(storage.as_ref())
        .get_for_partition(&key("p"), "x", 2)
        .unwrap()
        .unwrap();
    assert_eq!(verdict.nodes[0].status, NodeStatus::Skipped);

    for (run_id, _) in &first.submitted {
        instance.complete_run(run_id, now() + Duration::seconds(45)).unwrap();
    }
    let third = daemon.run_cycle(now() + Duration::seconds(60)).unwrap();
    assert_eq!(third.tick.status, TickStatus::Skipped);
    assert!(third.tick.run_requests.is_empty());
}

// ── Failure paths ───────────────────────────────────────────

#[test]
fn failed_commit_leaves_cursors_unchanged() {
    let h = harness(config(), missing_everywhere(&["a", "p"]), mixed_instance());
    h.daemon.run_cycle(now()).unwrap();
    let before = h.storage.all_cursors().unwrap();
    let submitted_before = h.sink.submitted().len();

    h.storage.fail_next_commit();
    let err = h.daemon.run_cycle(now() + Duration::seconds(30)).unwrap_err();
    assert!(matches!(err, DaemonError::Persistence(PersistenceError::Injected(_))));

    let tick = h.storage.get_tick(2).unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Failure);
    assert!(tick.error.is_some());
    assert!(tick.run_requests.is_empty());
    assert_eq!(h.storage.all_cursors().unwrap(), before);
    assert!(h.storage.get_evaluations_by_evaluation_id(2).unwrap().is_empty());
    assert_eq!(h.sink.submitted().len(), submitted_before);

    // The next cycle moves on to a fresh evaluation id.
    let next = h.daemon.run_cycle(now() + Duration::seconds(60)).unwrap();
    assert_eq!(next.tick.evaluation_id, 3);
}

#[test]
fn shutdown_cancels_the_cycle() {
    let h = harness(config(), missing_everywhere(&["a"]), mixed_instance());
    h.daemon.run_cycle(now()).unwrap();
    let before = h.storage.get_cursor(&key("a")).unwrap();

    h.daemon.shutdown();
    let err = h.daemon.run_cycle(now() + Duration::seconds(30)).unwrap_err();
    let tick_id = match err {
        DaemonError::Cancelled { tick_id } => tick_id,
        other => panic!("expected cancellation, got {other}"),
    };

    let tick = h.storage.get_tick(tick_id).unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Failure);
    assert_eq!(tick.error.as_deref(), Some("cancelled"));
    assert_eq!(h.storage.get_cursor(&key("a")).unwrap(), before);
    assert_eq!(h.sink.submitted().len(), 1);
}

#[test]
fn abandoned_ticks_are_failed_before_a_new_tick() {
    let h = harness(config(), missing_everywhere(&["a"]), mixed_instance());
    let stale = h.storage.create_tick(now() - Duration::hours(1), 7).unwrap();
    let recent = h.storage.create_tick(now() - Duration::seconds(10), 8).unwrap();

    let report = h.daemon.run_cycle(now()).unwrap();
    assert_eq!(report.tick.evaluation_id, 9);

    let stale = h.storage.get_tick(stale.id).unwrap().unwrap();
    assert_eq!(stale.status, TickStatus::Failure);
    assert_eq!(stale.error.as_deref(), Some("abandoned"));
    let recent = h.storage.get_tick(recent.id).unwrap().unwrap();
    assert_eq!(recent.status, TickStatus::Started);
}

#[test]
fn one_failing_asset_does_not_fail_the_tick() {
    let h = harness(config(), missing_everywhere(&["a", "ghost"]), mixed_instance());
    let report = h.daemon.run_cycle(now()).unwrap();

    assert_eq!(report.tick.status, TickStatus::Success);
    assert_eq!(report.evaluated, vec![key("a")]);
    assert!(report.tick.asset_errors.contains_key(&key("ghost")));
    assert!(h.storage.get_cursor(&key("ghost")).unwrap().is_none());
    assert_eq!(h.daemon.metrics().unwrap().asset_failures, 1);
}

#[test]
fn assets_past_the_deadline_are_deferred() {
    let config = DaemonConfig {
        max_cycle_seconds: 0,
        ..config()
    };
    let h = harness(config, missing_everywhere(&["a", "p"]), mixed_instance());
    let report = h.daemon.run_cycle(now()).unwrap();

    assert_eq!(report.tick.status, TickStatus::Skipped);
    assert!(report.evaluated.is_empty());
    assert_eq!(report.deferred.len(), 2);
    assert!(h.storage.all_cursors().unwrap().is_empty());
}

struct RejectingSink;

impl RunRequestSink for RejectingSink {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn submit(&self, run_id: &str, _request: &RunRequest) -> Result<(), SinkError> {
        Err(SinkError::Rejected {
            run_id: run_id.to_string(),
            reason: "launcher offline".into(),
        })
    }
}

#[test]
fn sink_failures_do_not_touch_the_committed_tick() {
    let storage = Arc::new(InMemoryScheduleStorage::new());
    let daemon = AutomationDaemon::new(
        config(),
        missing_everywhere(&["a"]),
        storage.clone(),
        mixed_instance(),
        Arc::new(RejectingSink),
    )
    .unwrap();

    let report = daemon.run_cycle(now()).unwrap();
    assert!(report.submitted.is_empty());
    let tick = storage.get_tick(report.tick.id).unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_ids.len(), 1);
    assert_eq!(daemon.metrics().unwrap().sink_failures, 1);
}

// ── Cursors ─────────────────────────────────────────────────

#[test]
fn reset_cursors_restart_from_full_history() {
    let instance = mixed_instance();
    let h = harness(
        config(),
        vec![
            AssetDefinition::new("a", AutomationCondition::missing().since(&AutomationCondition::newly_requested())),
            AssetDefinition::new("b", AutomationCondition::missing()),
        ],
        instance,
    );
    h.daemon.run_cycle(now()).unwrap();
    assert_eq!(h.storage.all_cursors().unwrap().len(), 2);

    assert!(h.daemon.reset_cursor(&key("a")).unwrap());
    assert!(!h.daemon.reset_cursor(&key("a")).unwrap());
    assert_eq!(h.daemon.reset_all_cursors().unwrap(), 1);

    // Without the requested history the latch fires again.
    let report = h.daemon.run_cycle(now() + Duration::seconds(30)).unwrap();
    let assets: BTreeSet<AssetKey> = report
        .tick
        .run_requests
        .iter()
        .flat_map(|r| r.asset_selection.iter().cloned())
        .collect();
    assert!(assets.contains(&key("a")));
}

#[test]
fn file_backed_daemon_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let instance = mixed_instance();
    let definitions = missing_everywhere(&["a", "p"]);
    {
        let storage = Arc::new(FileScheduleStorage::open(dir.path()).unwrap());
        let daemon = AutomationDaemon::new(
            config(),
            definitions.clone(),
            storage,
            instance.clone(),
            Arc::new(RecordingSink::new()),
        )
        .unwrap();
        daemon.run_cycle(now()).unwrap();
    }

    let storage = Arc::new(FileScheduleStorage::open(dir.path()).unwrap());
    let daemon = AutomationDaemon::new(
        config(),
        definitions,
        storage.clone(),
        instance,
        Arc::new(RecordingSink::new()),
    )
    .unwrap();
    let report = daemon.run_cycle(now() + Duration::seconds(30)).unwrap();
    assert_eq!(report.tick.evaluation_id, 2);
    assert_eq!(
        storage.get_cursor(&key("p")).unwrap().unwrap().latest_evaluation_id,
        2
    );
    assert_eq!(EvaluationStore::new(storage.as_ref()).get_by_asset(&key("a"), 10, None).unwrap().len(), 2);
}
