//! Property tests over randomly materialized and in-flight partitions.

use std::collections::BTreeSet;

use automat_conditions::{evaluate_asset, AutomationCondition, InMemoryInstance};
use automat_core::{AssetKey, PartitionSubset, PartitionsDefinition};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

const KEYS: [&str; 6] = ["k0", "k1", "k2", "k3", "k4", "k5"];

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

fn subset(indices: &BTreeSet<usize>) -> PartitionSubset {
    PartitionSubset::from_keys(indices.iter().map(|i| KEYS[*i]))
}

fn instance(materialized: &BTreeSet<usize>, in_flight: &BTreeSet<usize>) -> (AssetKey, InMemoryInstance) {
    let asset = AssetKey::from("static");
    let instance = InMemoryInstance::new();
    instance
        .add_asset(asset.clone(), Some(PartitionsDefinition::static_keys(KEYS)), vec![])
        .unwrap();
    for i in materialized {
        instance
            .record_materialization(&asset, Some(KEYS[*i]), now() - Duration::hours(1))
            .unwrap();
    }
    for i in in_flight {
        instance.launch_run(&format!("run-{i}"), &asset, Some(KEYS[*i])).unwrap();
    }
    (asset, instance)
}

fn indices() -> impl Strategy<Value = BTreeSet<usize>> {
    prop::collection::btree_set(0..KEYS.len(), 0..=KEYS.len())
}

proptest! {
    #[test]
    fn true_subsets_stay_within_candidates(materialized in indices(), in_flight in indices()) {
        let (asset, instance) = instance(&materialized, &in_flight);
        let eval = evaluate_asset(&asset, &AutomationCondition::eager(), &instance, None, 1, now()).unwrap();

        for node in &eval.tree.nodes {
            let outside = node.true_subset.difference(&node.candidate_subset).unwrap();
            prop_assert!(outside.is_empty(), "node {} escapes its candidate", node.description);
        }
        let root = eval.tree.root().unwrap();
        prop_assert!(root.candidate_subset.intersect(&subset(&in_flight)).unwrap().is_empty());
    }

    #[test]
    fn missing_is_the_unmaterialized_candidates(materialized in indices(), in_flight in indices()) {
        let (asset, instance) = instance(&materialized, &in_flight);
        let eval = evaluate_asset(&asset, &AutomationCondition::missing(), &instance, None, 1, now()).unwrap();

        let expected: BTreeSet<usize> = (0..KEYS.len())
            .filter(|i| !materialized.contains(i) && !in_flight.contains(i))
            .collect();
        prop_assert_eq!(eval.true_subset, subset(&expected));
    }

    #[test]
    fn same_inputs_same_tree(materialized in indices(), in_flight in indices()) {
        let (asset, instance) = instance(&materialized, &in_flight);
        let cond = AutomationCondition::eager();
        let first = evaluate_asset(&asset, &cond, &instance, None, 1, now()).unwrap();
        let later = now() + Duration::minutes(1);

        let a = evaluate_asset(&asset, &cond, &instance, Some(&first.cursor), 2, later).unwrap();
        let b = evaluate_asset(&asset, &cond, &instance, Some(&first.cursor), 2, later).unwrap();
        prop_assert_eq!(a.tree, b.tree);
        prop_assert_eq!(a.cursor, b.cursor);
    }
}
