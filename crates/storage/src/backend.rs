use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use automat_conditions::AssetCursor;
use automat_core::{AssetKey, StorageConfig};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::records::{CycleCommit, StoredEvaluation, TickRecord};
use crate::state::{StorageState, TickFilter};

/// Durable record store for ticks, evaluation rows and cursors.
///
/// Reads only ever observe fully committed state. [`commit_cycle`] is the
/// single atomic write of a scheduling cycle: evaluation rows, advanced
/// cursors and the terminal tick become visible together or not at all.
///
/// [`commit_cycle`]: ScheduleStorage::commit_cycle
pub trait ScheduleStorage: Send + Sync {
    // ── Ticks ───────────────────────────────────────────────────────

    /// Append a STARTED tick.
    fn create_tick(&self, timestamp: DateTime<Utc>, evaluation_id: u64) -> Result<TickRecord, PersistenceError>;

    /// Finalize a STARTED tick. Fails if the tick is already terminal.
    fn update_tick(&self, tick: TickRecord) -> Result<(), PersistenceError>;

    fn get_tick(&self, id: u64) -> Result<Option<TickRecord>, PersistenceError>;

    /// Ticks matching `filter`, newest first. A cursor naming no stored tick
    /// fails with [`PersistenceError::TickNotFound`].
    fn get_ticks(&self, filter: &TickFilter) -> Result<Vec<TickRecord>, PersistenceError>;

    // ── Cycle ───────────────────────────────────────────────────────

    /// Atomically persist a cycle. Returns the new evaluation row ids.
    fn commit_cycle(&self, commit: CycleCommit) -> Result<Vec<u64>, PersistenceError>;

    // ── Evaluations ─────────────────────────────────────────────────
    //
    // Rows are only written by `commit_cycle`.

    /// Newest first; `cursor` is a row id and only strictly older rows are returned.
    fn get_evaluations_for_asset(
        &self,
        asset: &AssetKey,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Vec<StoredEvaluation>, PersistenceError>;

    fn get_evaluations_by_evaluation_id(&self, evaluation_id: u64) -> Result<Vec<StoredEvaluation>, PersistenceError>;

    fn get_evaluation(
        &self,
        asset: &AssetKey,
        evaluation_id: u64,
    ) -> Result<Option<StoredEvaluation>, PersistenceError>;

    // ── Cursors ─────────────────────────────────────────────────────

    fn get_cursor(&self, asset: &AssetKey) -> Result<Option<AssetCursor>, PersistenceError>;

    fn all_cursors(&self) -> Result<BTreeMap<AssetKey, AssetCursor>, PersistenceError>;

    /// Returns whether a cursor existed.
    fn delete_cursor(&self, asset: &AssetKey) -> Result<bool, PersistenceError>;

    /// Returns the number of cursors removed.
    fn delete_all_cursors(&self) -> Result<usize, PersistenceError>;

    /// Highest evaluation id seen on any tick or cursor.
    fn latest_evaluation_id(&self) -> Result<Option<u64>, PersistenceError>;
}

// ── In-memory backend ───────────────────────────────────────────────

/// Process-local storage. Supports injecting a commit failure for tests
/// of the cycle rollback path.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStorage {
    state: RwLock<StorageState>,
    fail_next_commit: AtomicBool,
}

impl InMemoryScheduleStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_cycle` fail without writing anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn read<T>(&self, f: impl FnOnce(&StorageState) -> T) -> Result<T, PersistenceError> {
        let state = self.state.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(f(&state))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut StorageState) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut state = self.state.write().map_err(|_| PersistenceError::LockPoisoned)?;
        f(&mut state)
    }
}

impl ScheduleStorage for InMemoryScheduleStorage {
    fn create_tick(&self, timestamp: DateTime<Utc>, evaluation_id: u64) -> Result<TickRecord, PersistenceError> {
        self.write(|s| Ok(s.create_tick(timestamp, evaluation_id)))
    }

    fn update_tick(&self, tick: TickRecord) -> Result<(), PersistenceError> {
        self.write(|s| s.update_tick(tick))
    }

    fn get_tick(&self, id: u64) -> Result<Option<TickRecord>, PersistenceError> {
        self.read(|s| s.get_tick(id))
    }

    fn get_ticks(&self, filter: &TickFilter) -> Result<Vec<TickRecord>, PersistenceError> {
        self.read(|s| s.get_ticks(filter))?
    }

    fn commit_cycle(&self, commit: CycleCommit) -> Result<Vec<u64>, PersistenceError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::Injected(format!(
                "commit of tick {} rejected",
                commit.tick.id
            )));
        }
        self.write(|s| s.commit_cycle(commit))
    }

    fn get_evaluations_for_asset(
        &self,
        asset: &AssetKey,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Vec<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluations_for_asset(asset, limit, cursor))
    }

    fn get_evaluations_by_evaluation_id(&self, evaluation_id: u64) -> Result<Vec<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluations_by_evaluation_id(evaluation_id))
    }

    fn get_evaluation(
        &self,
        asset: &AssetKey,
        evaluation_id: u64,
    ) -> Result<Option<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluation(asset, evaluation_id))
    }

    fn get_cursor(&self, asset: &AssetKey) -> Result<Option<AssetCursor>, PersistenceError> {
        self.read(|s| s.get_cursor(asset))
    }

    fn all_cursors(&self) -> Result<BTreeMap<AssetKey, AssetCursor>, PersistenceError> {
        self.read(StorageState::all_cursors)
    }

    fn delete_cursor(&self, asset: &AssetKey) -> Result<bool, PersistenceError> {
        self.write(|s| Ok(s.delete_cursor(asset)))
    }

    fn delete_all_cursors(&self) -> Result<usize, PersistenceError> {
        self.write(|s| Ok(s.delete_all_cursors()))
    }

    fn latest_evaluation_id(&self) -> Result<Option<u64>, PersistenceError> {
        self.read(StorageState::latest_evaluation_id)
    }
}

// ── Filesystem backend ──────────────────────────────────────────────

/// JSON-file-backed storage.
///
/// Manages one file under the data directory:
/// ```text
/// automation/
///   schedule_state.json      <- ticks, evaluation rows, cursors
/// ```
/// Every write produces a complete new image in a temporary file which is
/// renamed over the old one, so a crash leaves either the old or the new
/// state on disk. The in-memory copy is replaced only after the rename.
#[derive(Debug)]
pub struct FileScheduleStorage {
    path: PathBuf,
    state: RwLock<StorageState>,
}

const STATE_FILE: &str = "schedule_state.json";

impl FileScheduleStorage {
    /// Open (or create) the store in `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let path = data_dir.join(STATE_FILE);
        let state = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            StorageState::default()
        };
        info!("Schedule storage: file backend at {}", path.display());
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, PersistenceError> {
        Self::open(&config.data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&StorageState) -> T) -> Result<T, PersistenceError> {
        let state = self.state.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(f(&state))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut StorageState) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut state = self.state.write().map_err(|_| PersistenceError::LockPoisoned)?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, state: &StorageState) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = json.len(), "Persisted schedule state");
        Ok(())
    }
}

impl ScheduleStorage for FileScheduleStorage {
    fn create_tick(&self, timestamp: DateTime<Utc>, evaluation_id: u64) -> Result<TickRecord, PersistenceError> {
        self.write(|s| Ok(s.create_tick(timestamp, evaluation_id)))
    }

    fn update_tick(&self, tick: TickRecord) -> Result<(), PersistenceError> {
        self.write(|s| s.update_tick(tick))
    }

    fn get_tick(&self, id: u64) -> Result<Option<TickRecord>, PersistenceError> {
        self.read(|s| s.get_tick(id))
    }

    fn get_ticks(&self, filter: &TickFilter) -> Result<Vec<TickRecord>, PersistenceError> {
        self.read(|s| s.get_ticks(filter))?
    }

    fn commit_cycle(&self, commit: CycleCommit) -> Result<Vec<u64>, PersistenceError> {
        self.write(|s| s.commit_cycle(commit))
    }

    fn get_evaluations_for_asset(
        &self,
        asset: &AssetKey,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Vec<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluations_for_asset(asset, limit, cursor))
    }

    fn get_evaluations_by_evaluation_id(&self, evaluation_id: u64) -> Result<Vec<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluations_by_evaluation_id(evaluation_id))
    }

    fn get_evaluation(
        &self,
        asset: &AssetKey,
        evaluation_id: u64,
    ) -> Result<Option<StoredEvaluation>, PersistenceError> {
        self.read(|s| s.evaluation(asset, evaluation_id))
    }

    fn get_cursor(&self, asset: &AssetKey) -> Result<Option<AssetCursor>, PersistenceError> {
        self.read(|s| s.get_cursor(asset))
    }

    fn all_cursors(&self) -> Result<BTreeMap<AssetKey, AssetCursor>, PersistenceError> {
        self.read(StorageState::all_cursors)
    }

    fn delete_cursor(&self, asset: &AssetKey) -> Result<bool, PersistenceError> {
        self.write(|s| Ok(s.delete_cursor(asset)))
    }

    fn delete_all_cursors(&self) -> Result<usize, PersistenceError> {
        self.write(|s| Ok(s.delete_all_cursors()))
    }

    fn latest_evaluation_id(&self) -> Result<Option<u64>, PersistenceError> {
        self.read(StorageState::latest_evaluation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TickStatus;

    #[test]
    fn ticks_finalize_exactly_once() {
        let store = InMemoryScheduleStorage::new();
        let now = Utc::now();
        let tick = store.create_tick(now, 1).unwrap();
        assert_eq!(tick.status, TickStatus::Started);

        let still_started = tick.clone();
        assert!(matches!(
            store.update_tick(still_started),
            Err(PersistenceError::NotTerminal(_))
        ));

        let done = tick.finalized(TickStatus::Skipped, now, vec![], vec![]);
        store.update_tick(done.clone()).unwrap();
        assert!(matches!(
            store.update_tick(done),
            Err(PersistenceError::TickAlreadyFinalized(_))
        ));
        assert_eq!(store.get_tick(tick.id).unwrap().unwrap().status, TickStatus::Skipped);
    }

    #[test]
    fn injected_commit_failure_writes_nothing() {
        let store = InMemoryScheduleStorage::new();
        let now = Utc::now();
        let tick = store.create_tick(now, 1).unwrap();
        store.fail_next_commit();
        let commit = CycleCommit {
            tick: tick.finalized(TickStatus::Skipped, now, vec![], vec![]),
            evaluations: vec![],
            cursors: vec![],
        };
        assert!(matches!(store.commit_cycle(commit.clone()), Err(PersistenceError::Injected(_))));
        assert_eq!(store.get_tick(tick.id).unwrap().unwrap().status, TickStatus::Started);
        store.commit_cycle(commit).unwrap();
        assert_eq!(store.get_tick(tick.id).unwrap().unwrap().status, TickStatus::Skipped);
    }

    #[test]
    fn file_store_reopens_with_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let id = {
            let store = FileScheduleStorage::open(dir.path()).unwrap();
            let tick = store.create_tick(now, 4).unwrap();
            store
                .update_tick(tick.finalized(TickStatus::Skipped, now, vec![], vec![]))
                .unwrap();
            tick.id
        };
        let reopened = FileScheduleStorage::open(dir.path()).unwrap();
        let tick = reopened.get_tick(id).unwrap().unwrap();
        assert_eq!(tick.status, TickStatus::Skipped);
        assert_eq!(reopened.latest_evaluation_id().unwrap(), Some(4));
        assert!(reopened.path().ends_with(STATE_FILE));
    }

    #[test]
    fn rejected_file_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileScheduleStorage::open(dir.path()).unwrap();
        let now = Utc::now();
        let tick = store.create_tick(now, 1).unwrap();
        let bogus = CycleCommit {
            tick: TickRecord {
                id: tick.id + 100,
                ..tick.finalized(TickStatus::Success, now, vec![], vec![])
            },
            evaluations: vec![],
            cursors: vec![],
        };
        assert!(matches!(store.commit_cycle(bogus), Err(PersistenceError::TickNotFound(_))));
        let reopened = FileScheduleStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.get_ticks(&TickFilter::default()).unwrap().len(), 1);
    }
}
