use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use automat_conditions::InstanceState;
use automat_core::{AssetKey, DaemonConfig};
use automat_storage::ScheduleStorage;
use tracing::info;

use crate::definitions::AssetDefinition;
use crate::error::DaemonError;
use crate::metrics::{CyclePhase, DaemonMetrics};
use crate::sink::RunRequestSink;

/// The automation daemon. Evaluates every managed asset once per tick on a
/// worker pool and commits the outcome atomically.
pub struct AutomationDaemon {
    pub(super) config: DaemonConfig,
    /// Managed assets, in evaluation order.
    pub(super) definitions: Vec<AssetDefinition>,
    pub(super) storage: Arc<dyn ScheduleStorage>,
    pub(super) instance: Arc<dyn InstanceState>,
    pub(super) sink: Arc<dyn RunRequestSink>,
    /// Evaluation worker pool.
    pub(super) pool: rayon::ThreadPool,
    pub(super) metrics: Arc<RwLock<DaemonMetrics>>,
    /// Shutdown signal. Also cancels a cycle that is in progress.
    pub(super) shutdown: Arc<AtomicBool>,
    /// Held for the whole of a cycle and for cursor resets.
    pub(super) cycle_lock: Mutex<()>,
}

impl AutomationDaemon {
    pub fn new(
        config: DaemonConfig,
        definitions: Vec<AssetDefinition>,
        storage: Arc<dyn ScheduleStorage>,
        instance: Arc<dyn InstanceState>,
        sink: Arc<dyn RunRequestSink>,
    ) -> Result<Self, DaemonError> {
        let mut seen = BTreeSet::new();
        for def in &definitions {
            if !seen.insert(&def.key) {
                return Err(DaemonError::DuplicateAsset(def.key.to_user_string()));
            }
        }

        let num_workers = config.resolved_worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("automat-eval-{i}"))
            .build()?;
        info!(
            assets = definitions.len(),
            workers = num_workers,
            sink = sink.name(),
            "Automation daemon created"
        );

        Ok(Self {
            config,
            definitions,
            storage,
            instance,
            sink,
            pool,
            metrics: Arc::new(RwLock::new(DaemonMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            cycle_lock: Mutex::new(()),
        })
    }

    /// Forget the cursor of one asset; its next evaluation starts from full
    /// history. Returns whether a cursor existed.
    pub fn reset_cursor(&self, asset: &AssetKey) -> Result<bool, DaemonError> {
        let _guard = self.lock_cycle()?;
        let removed = self.storage.delete_cursor(asset)?;
        info!(asset = %asset, removed, "Cursor reset");
        Ok(removed)
    }

    /// Forget every cursor. Returns the number removed.
    pub fn reset_all_cursors(&self) -> Result<usize, DaemonError> {
        let _guard = self.lock_cycle()?;
        let removed = self.storage.delete_all_cursors()?;
        info!(removed, "All cursors reset");
        Ok(removed)
    }

    /// Get a snapshot of the current daemon metrics.
    pub fn metrics(&self) -> Result<DaemonMetrics, DaemonError> {
        self.metrics
            .read()
            .map(|m| m.clone())
            .map_err(|e| DaemonError::LockPoisoned(format!("metrics read lock: {e}")))
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<DaemonMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Signal the daemon to stop. A cycle in progress finishes as FAILURE
    /// without touching any cursor.
    pub fn shutdown(&self) {
        info!("Automation daemon shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn definitions(&self) -> &[AssetDefinition] {
        &self.definitions
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub(super) fn lock_cycle(&self) -> Result<MutexGuard<'_, ()>, DaemonError> {
        match self.cycle_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(DaemonError::CycleInProgress),
            Err(TryLockError::Poisoned(e)) => Err(DaemonError::LockPoisoned(format!("cycle lock: {e}"))),
        }
    }

    pub(super) fn set_phase(&self, phase: CyclePhase) {
        if let Ok(mut m) = self.metrics.write() {
            m.current_phase = phase;
        }
    }
}
