use std::collections::{BTreeMap, BTreeSet};

use automat_core::{AssetKey, PartitionSubset, SubsetError};
use automat_storage::RunRequest;
use uuid::Uuid;

/// Group per-asset requested subsets into runs.
///
/// Every unpartitioned asset shares one run without a partition key.
/// Partitioned assets are grouped by partition key, one run per key. Output
/// order is deterministic: the unpartitioned run first, then keys in order.
pub fn group_run_requests(requested: &[(AssetKey, PartitionSubset)]) -> Result<Vec<RunRequest>, SubsetError> {
    let mut unpartitioned: BTreeSet<AssetKey> = BTreeSet::new();
    let mut by_partition: BTreeMap<String, BTreeSet<AssetKey>> = BTreeMap::new();

    for (asset, subset) in requested {
        if subset.is_empty() {
            continue;
        }
        if subset.is_partitioned() {
            for key in subset.to_keys()? {
                by_partition.entry(key).or_default().insert(asset.clone());
            }
        } else {
            unpartitioned.insert(asset.clone());
        }
    }

    let mut runs = Vec::with_capacity(by_partition.len() + 1);
    if !unpartitioned.is_empty() {
        runs.push(RunRequest {
            asset_selection: unpartitioned,
            partition_key: None,
        });
    }
    runs.extend(by_partition.into_iter().map(|(key, assets)| RunRequest {
        asset_selection: assets,
        partition_key: Some(key),
    }));
    Ok(runs)
}

/// Pair each request with a fresh run id.
pub(super) fn assign_run_ids(requests: Vec<RunRequest>) -> Vec<(String, RunRequest)> {
    requests
        .into_iter()
        .map(|request| (Uuid::new_v4().to_string(), request))
        .collect()
}

/// Ids of the runs that include `asset`.
pub(super) fn run_ids_for(asset: &AssetKey, runs: &[(String, RunRequest)]) -> BTreeSet<String> {
    runs.iter()
        .filter(|(_, request)| request.asset_selection.contains(asset))
        .map(|(id, _)| id.clone())
        .collect()
}
