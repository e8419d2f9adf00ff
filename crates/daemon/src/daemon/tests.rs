use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use automat_conditions::{AutomationCondition, InMemoryInstance, InstanceError, InstanceState};
use automat_core::{AssetKey, DaemonConfig, PartitionSubset};
use automat_storage::{InMemoryScheduleStorage, ScheduleStorage, TickStatus};
use chrono::{DateTime, TimeZone, Utc};

use crate::daemon::AutomationDaemon;
use crate::definitions::AssetDefinition;
use crate::error::DaemonError;
use crate::metrics::CyclePhase;
use crate::sink::RecordingSink;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn config() -> DaemonConfig {
    DaemonConfig {
        worker_threads: 2,
        ..DaemonConfig::default()
    }
}

/// Instance whose partition lookup parks until the test releases it.
struct GatedInstance {
    inner: InMemoryInstance,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl InstanceState for GatedInstance {
    fn all_partition_keys(
        &self,
        asset: &AssetKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>, InstanceError> {
        if let Ok(entered) = self.entered.lock() {
            let _ = entered.send(());
        }
        if let Ok(release) = self.release.lock() {
            let _ = release.recv();
        }
        self.inner.all_partition_keys(asset, now)
    }

    fn latest_storage_id(&self) -> Result<u64, InstanceError> {
        self.inner.latest_storage_id()
    }

    fn partitions_materialized_between(
        &self,
        asset: &AssetKey,
        after: u64,
        up_to: u64,
    ) -> Result<PartitionSubset, InstanceError> {
        self.inner.partitions_materialized_between(asset, after, up_to)
    }

    fn in_flight_runs(&self, asset: &AssetKey) -> Result<PartitionSubset, InstanceError> {
        self.inner.in_flight_runs(asset)
    }
}

#[test]
fn concurrent_cycle_is_rejected() {
    let inner = InMemoryInstance::new();
    inner.add_asset(AssetKey::from("a"), None, vec![]).unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let instance = Arc::new(GatedInstance {
        inner,
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let storage = Arc::new(InMemoryScheduleStorage::new());
    let daemon = AutomationDaemon::new(
        config(),
        vec![AssetDefinition::new("a", AutomationCondition::missing())],
        storage.clone(),
        instance,
        Arc::new(RecordingSink::new()),
    )
    .unwrap();

    std::thread::scope(|s| {
        let first = s.spawn(|| daemon.run_cycle(now()));
        entered_rx.recv().unwrap();

        assert!(matches!(daemon.run_cycle(now()), Err(DaemonError::CycleInProgress)));
        assert!(matches!(
            daemon.reset_cursor(&AssetKey::from("a")),
            Err(DaemonError::CycleInProgress)
        ));
        assert_eq!(daemon.metrics().unwrap().current_phase, CyclePhase::Evaluating);

        release_tx.send(()).unwrap();
        drop(release_tx);
        let report = first.join().unwrap().unwrap();
        assert_eq!(report.tick.status, TickStatus::Success);
    });

    // The rejected call never created a tick.
    assert_eq!(storage.latest_evaluation_id().unwrap(), Some(1));
    assert_eq!(daemon.metrics().unwrap().current_phase, CyclePhase::Idle);
}

#[test]
fn duplicate_definitions_are_rejected() {
    let result = AutomationDaemon::new(
        config(),
        vec![
            AssetDefinition::new("a", AutomationCondition::missing()),
            AssetDefinition::new("a", AutomationCondition::eager()),
        ],
        Arc::new(InMemoryScheduleStorage::new()),
        Arc::new(InMemoryInstance::new()),
        Arc::new(RecordingSink::new()),
    );
    assert!(matches!(result, Err(DaemonError::DuplicateAsset(k)) if k == "a"));
}

#[test]
fn metrics_follow_committed_ticks() {
    let instance = Arc::new(InMemoryInstance::new());
    instance.add_asset(AssetKey::from("a"), None, vec![]).unwrap();
    let daemon = AutomationDaemon::new(
        config(),
        vec![AssetDefinition::new("a", AutomationCondition::missing())],
        Arc::new(InMemoryScheduleStorage::new()),
        instance,
        Arc::new(RecordingSink::new()),
    )
    .unwrap();

    daemon.run_cycle(now()).unwrap();
    daemon.run_cycle(now()).unwrap();

    let m = daemon.metrics().unwrap();
    assert_eq!(m.total_ticks(), 2);
    assert_eq!(m.assets_evaluated, 2);
    assert_eq!(m.runs_requested, 2);
    assert_eq!(m.last_evaluation_id, Some(2));
    assert_eq!(m.current_phase, CyclePhase::Idle);
}
