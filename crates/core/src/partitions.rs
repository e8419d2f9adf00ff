//! Partition key spaces.
//!
//! The automation core treats a partitions definition as an opaque, ordered
//! set of keys that may grow over time. Two concrete shapes are provided:
//! a fixed list of keys and one key per completed UTC day.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::subset::PartitionSubset;

/// Key format for daily partitions.
pub const DAILY_KEY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionsDefinition {
    /// A fixed, ordered list of keys.
    Static { keys: Vec<String> },
    /// One partition per day starting at `start_date`; a day exists once it
    /// has fully elapsed.
    Daily { start_date: NaiveDate },
}

impl PartitionsDefinition {
    pub fn static_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Static {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn daily(start_date: NaiveDate) -> Self {
        Self::Daily { start_date }
    }

    /// Ordered partition keys that exist at `now`.
    pub fn partition_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        match self {
            Self::Static { keys } => keys.clone(),
            Self::Daily { start_date } => {
                let today = now.date_naive();
                let mut keys = Vec::new();
                let mut day = *start_date;
                while day < today {
                    keys.push(day.format(DAILY_KEY_FORMAT).to_string());
                    day += Duration::days(1);
                }
                keys
            }
        }
    }

    /// Every partition that exists at `now`, as a subset.
    pub fn all_subset(&self, now: DateTime<Utc>) -> PartitionSubset {
        PartitionSubset::from_keys(self.partition_keys(now))
    }
}

/// Daily partition key `offset` days after `start`.
pub fn day_partition_key(start: NaiveDate, offset: i64) -> String {
    (start + Duration::days(offset))
        .format(DAILY_KEY_FORMAT)
        .to_string()
}
