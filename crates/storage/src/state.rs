//! Backend-independent storage state and its operations.
//!
//! Both backends hold one [`StorageState`] behind a lock. Mutations are
//! applied to the state value directly; the filesystem backend applies them
//! to a copy and swaps it in only after the copy is durably written.

use std::collections::BTreeMap;

use automat_conditions::AssetCursor;
use automat_core::AssetKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::records::{CycleCommit, NewEvaluation, StoredEvaluation, TickRecord, TickStatus};

/// Filter applied by [`ScheduleStorage::get_ticks`](crate::ScheduleStorage::get_ticks).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickFilter {
    /// Only ticks strictly after this time.
    pub after: Option<DateTime<Utc>>,
    /// Only ticks strictly before this time.
    pub before: Option<DateTime<Utc>>,
    pub statuses: Option<Vec<TickStatus>>,
    pub limit: Option<usize>,
    /// Tick id; only ticks strictly older than it are returned.
    pub cursor: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StorageState {
    #[serde(default)]
    next_tick_id: u64,
    #[serde(default)]
    next_evaluation_row_id: u64,
    #[serde(default)]
    ticks: Vec<TickRecord>,
    #[serde(default)]
    evaluations: Vec<StoredEvaluation>,
    #[serde(default)]
    cursors: BTreeMap<AssetKey, AssetCursor>,
}

impl StorageState {
    // ── Ticks ───────────────────────────────────────────────────────

    pub(crate) fn create_tick(&mut self, timestamp: DateTime<Utc>, evaluation_id: u64) -> TickRecord {
        self.next_tick_id += 1;
        let tick = TickRecord::started(self.next_tick_id, timestamp, evaluation_id);
        self.ticks.push(tick.clone());
        tick
    }

    pub(crate) fn update_tick(&mut self, tick: TickRecord) -> Result<(), PersistenceError> {
        if !tick.status.is_terminal() {
            return Err(PersistenceError::NotTerminal(tick.id));
        }
        let slot = self
            .ticks
            .iter_mut()
            .find(|t| t.id == tick.id)
            .ok_or(PersistenceError::TickNotFound(tick.id))?;
        if slot.status.is_terminal() {
            return Err(PersistenceError::TickAlreadyFinalized(tick.id));
        }
        *slot = tick;
        Ok(())
    }

    pub(crate) fn get_tick(&self, id: u64) -> Option<TickRecord> {
        self.ticks.iter().find(|t| t.id == id).cloned()
    }

    /// Fails with [`PersistenceError::TickNotFound`] when the cursor names
    /// no stored tick.
    pub(crate) fn get_ticks(&self, filter: &TickFilter) -> Result<Vec<TickRecord>, PersistenceError> {
        let cursor_pos = match filter.cursor {
            Some(id) => {
                let tick = self
                    .ticks
                    .iter()
                    .find(|t| t.id == id)
                    .ok_or(PersistenceError::TickNotFound(id))?;
                Some((tick.timestamp, tick.id))
            }
            None => None,
        };

        let mut ticks: Vec<&TickRecord> = self
            .ticks
            .iter()
            .filter(|t| filter.after.map_or(true, |after| t.timestamp > after))
            .filter(|t| filter.before.map_or(true, |before| t.timestamp < before))
            .filter(|t| {
                filter
                    .statuses
                    .as_ref()
                    .map_or(true, |statuses| statuses.contains(&t.status))
            })
            .filter(|t| cursor_pos.map_or(true, |pos| (t.timestamp, t.id) < pos))
            .collect();
        ticks.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        if let Some(limit) = filter.limit {
            ticks.truncate(limit);
        }
        Ok(ticks.into_iter().cloned().collect())
    }

    // ── Evaluations ─────────────────────────────────────────────────

    fn add_evaluations(&mut self, evaluations: Vec<NewEvaluation>) -> Vec<u64> {
        evaluations
            .into_iter()
            .map(|new| {
                self.next_evaluation_row_id += 1;
                let id = self.next_evaluation_row_id;
                self.evaluations.push(StoredEvaluation::from_new(id, new));
                id
            })
            .collect()
    }

    pub(crate) fn evaluations_for_asset(
        &self,
        asset: &AssetKey,
        limit: usize,
        cursor: Option<u64>,
    ) -> Vec<StoredEvaluation> {
        self.evaluations
            .iter()
            .rev()
            .filter(|e| &e.asset_key == asset)
            .filter(|e| cursor.map_or(true, |c| e.id < c))
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn evaluations_by_evaluation_id(&self, evaluation_id: u64) -> Vec<StoredEvaluation> {
        self.evaluations
            .iter()
            .filter(|e| e.evaluation_id == evaluation_id)
            .cloned()
            .collect()
    }

    pub(crate) fn evaluation(&self, asset: &AssetKey, evaluation_id: u64) -> Option<StoredEvaluation> {
        self.evaluations
            .iter()
            .rev()
            .find(|e| &e.asset_key == asset && e.evaluation_id == evaluation_id)
            .cloned()
    }

    // ── Cursors ─────────────────────────────────────────────────────

    pub(crate) fn get_cursor(&self, asset: &AssetKey) -> Option<AssetCursor> {
        self.cursors.get(asset).cloned()
    }

    pub(crate) fn all_cursors(&self) -> BTreeMap<AssetKey, AssetCursor> {
        self.cursors.clone()
    }

    pub(crate) fn delete_cursor(&mut self, asset: &AssetKey) -> bool {
        self.cursors.remove(asset).is_some()
    }

    pub(crate) fn delete_all_cursors(&mut self) -> usize {
        let n = self.cursors.len();
        self.cursors.clear();
        n
    }

    pub(crate) fn latest_evaluation_id(&self) -> Option<u64> {
        let from_ticks = self.ticks.iter().map(|t| t.evaluation_id);
        let from_cursors = self.cursors.values().map(|c| c.latest_evaluation_id);
        from_ticks.chain(from_cursors).max()
    }

    // ── Cycle commit ────────────────────────────────────────────────

    /// Apply a full cycle. Validates first so a rejected commit leaves the
    /// state untouched.
    pub(crate) fn commit_cycle(&mut self, commit: CycleCommit) -> Result<Vec<u64>, PersistenceError> {
        let CycleCommit {
            tick,
            evaluations,
            cursors,
        } = commit;
        if !tick.status.is_terminal() {
            return Err(PersistenceError::NotTerminal(tick.id));
        }
        match self.ticks.iter().find(|t| t.id == tick.id) {
            None => return Err(PersistenceError::TickNotFound(tick.id)),
            Some(existing) if existing.status.is_terminal() => {
                return Err(PersistenceError::TickAlreadyFinalized(tick.id))
            }
            Some(_) => {}
        }

        let ids = self.add_evaluations(evaluations);
        for cursor in cursors {
            self.cursors.insert(cursor.asset_key.clone(), cursor);
        }
        self.update_tick(tick)?;
        Ok(ids)
    }
}
