//! Read access to materialization and run history.
//!
//! The evaluator only reads through [`InstanceState`]. [`InMemoryInstance`]
//! is a complete implementation backed by a `std::sync::RwLock`, loadable
//! from a JSON snapshot, used by the daemon binary and by tests.
//!
//! Materializations are ordered by a storage id assigned when the event is
//! written, never by the event's own timestamp. Cursors watermark on that id
//! so a late write carrying an old timestamp is still picked up.

use std::collections::BTreeMap;
use std::sync::RwLock;

use automat_core::{AssetKey, PartitionSubset, PartitionsDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InstanceError;

pub trait InstanceState: Send + Sync {
    /// Ordered partition keys existing at `now`; `None` for an unpartitioned asset.
    fn all_partition_keys(
        &self,
        asset: &AssetKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>, InstanceError>;

    /// Highest storage id written so far across all assets; 0 when empty.
    fn latest_storage_id(&self) -> Result<u64, InstanceError>;

    /// Partitions with a materialization whose storage id is in `(after, up_to]`.
    fn partitions_materialized_between(
        &self,
        asset: &AssetKey,
        after: u64,
        up_to: u64,
    ) -> Result<PartitionSubset, InstanceError>;

    /// Partitions targeted by runs that have not finished yet.
    fn in_flight_runs(&self, asset: &AssetKey) -> Result<PartitionSubset, InstanceError>;

    fn parent_keys(&self, _asset: &AssetKey) -> Result<Vec<AssetKey>, InstanceError> {
        Ok(Vec::new())
    }
}

/// Every partition of `asset` existing at `now`.
pub fn asset_universe(
    instance: &dyn InstanceState,
    asset: &AssetKey,
    now: DateTime<Utc>,
) -> Result<PartitionSubset, InstanceError> {
    Ok(match instance.all_partition_keys(asset, now)? {
        Some(keys) => PartitionSubset::from_keys(keys),
        None => PartitionSubset::unpartitioned(true),
    })
}

// ── Snapshot format ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationEvent {
    /// Assigned on write. Snapshot events without one are numbered on load.
    #[serde(default)]
    pub storage_id: u64,
    #[serde(default)]
    pub partition_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightRun {
    pub run_id: String,
    #[serde(default)]
    pub partition_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetState {
    #[serde(default)]
    pub partitions: Option<PartitionsDefinition>,
    #[serde(default)]
    pub parents: Vec<AssetKey>,
    #[serde(default)]
    pub materializations: Vec<MaterializationEvent>,
    #[serde(default)]
    pub in_flight: Vec<InFlightRun>,
}

/// Serializable image of an [`InMemoryInstance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    #[serde(default)]
    pub assets: BTreeMap<AssetKey, AssetState>,
}

// ── In-memory instance ──────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryInstance {
    assets: RwLock<BTreeMap<AssetKey, AssetState>>,
}

fn max_storage_id(assets: &BTreeMap<AssetKey, AssetState>) -> u64 {
    assets
        .values()
        .flat_map(|s| s.materializations.iter().map(|m| m.storage_id))
        .max()
        .unwrap_or(0)
}

impl InMemoryInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: InstanceSnapshot) -> Self {
        let mut assets = snapshot.assets;
        let mut next = max_storage_id(&assets);
        for state in assets.values_mut() {
            for event in state.materializations.iter_mut().filter(|m| m.storage_id == 0) {
                next += 1;
                event.storage_id = next;
            }
        }
        Self {
            assets: RwLock::new(assets),
        }
    }

    pub fn snapshot(&self) -> Result<InstanceSnapshot, InstanceError> {
        let assets = self.assets.read().map_err(|_| InstanceError::LockPoisoned)?;
        Ok(InstanceSnapshot {
            assets: assets.clone(),
        })
    }

    /// Register an asset, replacing any previous definition but keeping history.
    pub fn add_asset(
        &self,
        key: AssetKey,
        partitions: Option<PartitionsDefinition>,
        parents: Vec<AssetKey>,
    ) -> Result<(), InstanceError> {
        let mut assets = self.assets.write().map_err(|_| InstanceError::LockPoisoned)?;
        let state = assets.entry(key).or_default();
        state.partitions = partitions;
        state.parents = parents;
        Ok(())
    }

    pub fn record_materialization(
        &self,
        asset: &AssetKey,
        partition_key: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), InstanceError> {
        let mut assets = self.assets.write().map_err(|_| InstanceError::LockPoisoned)?;
        let storage_id = max_storage_id(&assets) + 1;
        let state = assets
            .get_mut(asset)
            .ok_or_else(|| InstanceError::UnknownAsset(asset.clone()))?;
        state.materializations.push(MaterializationEvent {
            storage_id,
            partition_key: partition_key.map(str::to_string),
            timestamp,
        });
        Ok(())
    }

    pub fn launch_run(
        &self,
        run_id: &str,
        asset: &AssetKey,
        partition_key: Option<&str>,
    ) -> Result<(), InstanceError> {
        self.with_asset_mut(asset, |state| {
            state.in_flight.push(InFlightRun {
                run_id: run_id.to_string(),
                partition_key: partition_key.map(str::to_string),
            });
        })
    }

    /// Finish a run: every asset partition it targeted is materialized at
    /// `timestamp` and leaves the in-flight set. Returns the number of
    /// materializations recorded.
    pub fn complete_run(&self, run_id: &str, timestamp: DateTime<Utc>) -> Result<usize, InstanceError> {
        let mut assets = self.assets.write().map_err(|_| InstanceError::LockPoisoned)?;
        let mut next = max_storage_id(&assets);
        let mut completed = 0;
        for state in assets.values_mut() {
            let (finished, still_running): (Vec<_>, Vec<_>) = std::mem::take(&mut state.in_flight)
                .into_iter()
                .partition(|r| r.run_id == run_id);
            state.in_flight = still_running;
            for run in finished {
                next += 1;
                state.materializations.push(MaterializationEvent {
                    storage_id: next,
                    partition_key: run.partition_key,
                    timestamp,
                });
                completed += 1;
            }
        }
        Ok(completed)
    }

    fn with_asset_mut(
        &self,
        asset: &AssetKey,
        f: impl FnOnce(&mut AssetState),
    ) -> Result<(), InstanceError> {
        let mut assets = self.assets.write().map_err(|_| InstanceError::LockPoisoned)?;
        let state = assets
            .get_mut(asset)
            .ok_or_else(|| InstanceError::UnknownAsset(asset.clone()))?;
        f(state);
        Ok(())
    }

    fn read_asset<T>(
        &self,
        asset: &AssetKey,
        f: impl FnOnce(&AssetState) -> T,
    ) -> Result<T, InstanceError> {
        let assets = self.assets.read().map_err(|_| InstanceError::LockPoisoned)?;
        let state = assets
            .get(asset)
            .ok_or_else(|| InstanceError::UnknownAsset(asset.clone()))?;
        Ok(f(state))
    }
}

fn keyed_subset<'a>(partitioned: bool, keys: impl Iterator<Item = Option<&'a String>>) -> PartitionSubset {
    if partitioned {
        PartitionSubset::from_keys(keys.flatten().cloned())
    } else {
        PartitionSubset::unpartitioned(keys.count() > 0)
    }
}

impl InstanceState for InMemoryInstance {
    fn all_partition_keys(
        &self,
        asset: &AssetKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>, InstanceError> {
        self.read_asset(asset, |state| {
            state.partitions.as_ref().map(|def| def.partition_keys(now))
        })
    }

    fn latest_storage_id(&self) -> Result<u64, InstanceError> {
        let assets = self.assets.read().map_err(|_| InstanceError::LockPoisoned)?;
        Ok(max_storage_id(&assets))
    }

    fn partitions_materialized_between(
        &self,
        asset: &AssetKey,
        after: u64,
        up_to: u64,
    ) -> Result<PartitionSubset, InstanceError> {
        self.read_asset(asset, |state| {
            let events = state
                .materializations
                .iter()
                .filter(|m| m.storage_id > after && m.storage_id <= up_to)
                .map(|m| m.partition_key.as_ref());
            keyed_subset(state.partitions.is_some(), events)
        })
    }

    fn in_flight_runs(&self, asset: &AssetKey) -> Result<PartitionSubset, InstanceError> {
        self.read_asset(asset, |state| {
            keyed_subset(
                state.partitions.is_some(),
                state.in_flight.iter().map(|r| r.partition_key.as_ref()),
            )
        })
    }

    fn parent_keys(&self, asset: &AssetKey) -> Result<Vec<AssetKey>, InstanceError> {
        self.read_asset(asset, |state| state.parents.clone())
    }
}
