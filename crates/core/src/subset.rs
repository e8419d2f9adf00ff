//! Immutable set algebra over one asset's partition space.
//!
//! A [`PartitionSubset`] is either the single-element universe of an
//! unpartitioned asset, an explicit set of partition keys, or the
//! [`PartitionSubset::AllPartitions`] sentinel. The sentinel only ever comes
//! from legacy records that did not persist exact membership: it stands for
//! "every partition that existed back then" and has no known size.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SubsetError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionSubset {
    Unpartitioned { present: bool },
    Partitioned { partition_keys: BTreeSet<String> },
    AllPartitions,
}

impl PartitionSubset {
    pub fn unpartitioned(present: bool) -> Self {
        Self::Unpartitioned { present }
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Partitioned {
            partition_keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn empty_partitioned() -> Self {
        Self::Partitioned {
            partition_keys: BTreeSet::new(),
        }
    }

    /// An empty subset of the same partition space as `self`.
    pub fn empty_like(&self) -> Self {
        match self {
            Self::Unpartitioned { .. } => Self::unpartitioned(false),
            Self::Partitioned { .. } | Self::AllPartitions => Self::empty_partitioned(),
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !matches!(self, Self::Unpartitioned { .. })
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::AllPartitions)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Unpartitioned { present } => !present,
            Self::Partitioned { partition_keys } => partition_keys.is_empty(),
            Self::AllPartitions => false,
        }
    }

    /// Membership test. Unpartitioned subsets ignore `partition_key`.
    ///
    /// The sentinel answers `true` without enumerating anything.
    pub fn contains(&self, partition_key: &str) -> bool {
        match self {
            Self::Unpartitioned { present } => *present,
            Self::Partitioned { partition_keys } => partition_keys.contains(partition_key),
            Self::AllPartitions => true,
        }
    }

    /// Number of members; an unpartitioned subset counts as 0 or 1.
    pub fn size(&self) -> Result<usize, SubsetError> {
        match self {
            Self::Unpartitioned { present } => Ok(usize::from(*present)),
            Self::Partitioned { partition_keys } => Ok(partition_keys.len()),
            Self::AllPartitions => Err(SubsetError::Unbounded("count")),
        }
    }

    /// Sorted partition keys. Unpartitioned subsets have no keys.
    pub fn to_keys(&self) -> Result<Vec<String>, SubsetError> {
        match self {
            Self::Unpartitioned { .. } => Ok(Vec::new()),
            Self::Partitioned { partition_keys } => Ok(partition_keys.iter().cloned().collect()),
            Self::AllPartitions => Err(SubsetError::Unbounded("enumerate")),
        }
    }

    pub fn union(&self, other: &Self) -> Result<Self, SubsetError> {
        match (self, other) {
            (Self::Unpartitioned { present: a }, Self::Unpartitioned { present: b }) => {
                Ok(Self::unpartitioned(*a || *b))
            }
            (Self::Partitioned { partition_keys: a }, Self::Partitioned { partition_keys: b }) => {
                Ok(Self::Partitioned {
                    partition_keys: a.union(b).cloned().collect(),
                })
            }
            (Self::AllPartitions, Self::Partitioned { .. } | Self::AllPartitions)
            | (Self::Partitioned { .. }, Self::AllPartitions) => Ok(Self::AllPartitions),
            _ => Err(self.incomparable("union", other)),
        }
    }

    pub fn intersect(&self, other: &Self) -> Result<Self, SubsetError> {
        match (self, other) {
            (Self::Unpartitioned { present: a }, Self::Unpartitioned { present: b }) => {
                Ok(Self::unpartitioned(*a && *b))
            }
            (Self::Partitioned { partition_keys: a }, Self::Partitioned { partition_keys: b }) => {
                Ok(Self::Partitioned {
                    partition_keys: a.intersection(b).cloned().collect(),
                })
            }
            (Self::AllPartitions, concrete @ Self::Partitioned { .. })
            | (concrete @ Self::Partitioned { .. }, Self::AllPartitions) => Ok(concrete.clone()),
            (Self::AllPartitions, Self::AllPartitions) => Ok(Self::AllPartitions),
            _ => Err(self.incomparable("intersect", other)),
        }
    }

    /// `self − other`.
    pub fn difference(&self, other: &Self) -> Result<Self, SubsetError> {
        match (self, other) {
            (Self::Unpartitioned { present: a }, Self::Unpartitioned { present: b }) => {
                Ok(Self::unpartitioned(*a && !*b))
            }
            (Self::Partitioned { partition_keys: a }, Self::Partitioned { partition_keys: b }) => {
                Ok(Self::Partitioned {
                    partition_keys: a.difference(b).cloned().collect(),
                })
            }
            (Self::Partitioned { .. } | Self::AllPartitions, Self::AllPartitions) => {
                Ok(Self::empty_partitioned())
            }
            (Self::AllPartitions, Self::Partitioned { partition_keys }) if partition_keys.is_empty() => {
                Ok(Self::AllPartitions)
            }
            _ => Err(self.incomparable("difference", other)),
        }
    }

    /// `within − self`.
    pub fn complement(&self, within: &Self) -> Result<Self, SubsetError> {
        within.difference(self)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Unpartitioned { .. } => "an unpartitioned subset",
            Self::Partitioned { .. } => "a partitioned subset",
            Self::AllPartitions => "the all-partitions sentinel",
        }
    }

    fn incomparable(&self, op: &'static str, other: &Self) -> SubsetError {
        SubsetError::Incomparable {
            op,
            left: self.kind_name(),
            right: other.kind_name(),
        }
    }
}

impl fmt::Display for PartitionSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpartitioned { present: true } => write!(f, "present"),
            Self::Unpartitioned { present: false } => write!(f, "absent"),
            Self::Partitioned { partition_keys } => {
                let keys: Vec<&str> = partition_keys.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", keys.join(", "))
            }
            Self::AllPartitions => write!(f, "<all partitions>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn keys(ks: &[&str]) -> PartitionSubset {
        PartitionSubset::from_keys(ks.iter().copied())
    }

    #[test]
    fn unpartitioned_is_a_one_element_universe() {
        let yes = PartitionSubset::unpartitioned(true);
        let no = PartitionSubset::unpartitioned(false);
        assert_eq!(yes.size().unwrap(), 1);
        assert_eq!(no.size().unwrap(), 0);
        assert_eq!(yes.union(&no).unwrap(), yes);
        assert_eq!(yes.intersect(&no).unwrap(), no);
        assert_eq!(no.complement(&yes).unwrap(), yes);
        assert!(yes.contains("ignored"));
    }

    #[test]
    fn partitioned_set_operations() {
        let a = keys(&["a", "b", "c"]);
        let b = keys(&["b", "c", "d"]);
        assert_eq!(a.union(&b).unwrap(), keys(&["a", "b", "c", "d"]));
        assert_eq!(a.intersect(&b).unwrap(), keys(&["b", "c"]));
        assert_eq!(a.difference(&b).unwrap(), keys(&["a"]));
        assert_eq!(a.to_keys().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn sentinel_combinations_that_are_decidable() {
        let all = PartitionSubset::AllPartitions;
        let a = keys(&["a"]);
        assert_eq!(all.union(&a).unwrap(), all);
        assert_eq!(all.intersect(&a).unwrap(), a);
        assert_eq!(all.complement(&a).unwrap(), PartitionSubset::empty_partitioned());
        assert!(all.contains("anything"));
        assert!(!all.is_empty());
    }

    #[test]
    fn sentinel_combinations_that_are_not_decidable() {
        let all = PartitionSubset::AllPartitions;
        let err = keys(&["a"]).complement(&all).unwrap_err();
        assert!(matches!(err, SubsetError::Incomparable { op: "difference", .. }));
        assert_eq!(all.size().unwrap_err(), SubsetError::Unbounded("count"));
        assert_eq!(all.to_keys().unwrap_err(), SubsetError::Unbounded("enumerate"));
    }

    #[test]
    fn mixing_partitioned_and_unpartitioned_fails() {
        let err = PartitionSubset::unpartitioned(true)
            .union(&keys(&["a"]))
            .unwrap_err();
        assert!(matches!(err, SubsetError::Incomparable { op: "union", .. }));
    }

    #[test]
    fn serde_shape_is_tagged() {
        let json = serde_json::to_value(keys(&["x"])).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "partitioned", "partition_keys": ["x"]})
        );
        let sentinel: PartitionSubset =
            serde_json::from_value(serde_json::json!({"kind": "all_partitions"})).unwrap();
        assert!(sentinel.is_sentinel());
    }

    fn universe_and_subset() -> impl Strategy<Value = (PartitionSubset, PartitionSubset)> {
        prop::collection::btree_set("[a-z]", 0..8).prop_flat_map(|all| {
            let members: Vec<String> = all.iter().cloned().collect();
            let len = members.len();
            (Just(all), prop::sample::subsequence(members, 0..=len)).prop_map(|(all, sub)| {
                (
                    PartitionSubset::Partitioned { partition_keys: all },
                    PartitionSubset::from_keys(sub),
                )
            })
        })
    }

    proptest! {
        #[test]
        fn union_with_complement_is_everything((all, a) in universe_and_subset()) {
            let rest = a.complement(&all).unwrap();
            prop_assert_eq!(a.union(&rest).unwrap(), all);
        }

        #[test]
        fn intersect_is_idempotent((_all, a) in universe_and_subset()) {
            prop_assert_eq!(a.intersect(&a).unwrap(), a);
        }

        #[test]
        fn complement_is_an_involution((all, a) in universe_and_subset()) {
            let twice = a.complement(&all).unwrap().complement(&all).unwrap();
            prop_assert_eq!(twice, a);
        }
    }
}
