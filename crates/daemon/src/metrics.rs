use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use automat_storage::TickStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where the daemon currently is in its tick state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    TickStarted,
    Evaluating,
    Requesting,
    Persisting,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::TickStarted => "tick_started",
            CyclePhase::Evaluating => "evaluating",
            CyclePhase::Requesting => "requesting",
            CyclePhase::Persisting => "persisting",
        };
        write!(f, "{s}")
    }
}

/// Daemon operational metrics.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonMetrics {
    /// Finalized ticks by terminal status.
    pub ticks_by_status: HashMap<TickStatus, u64>,
    /// Asset evaluations committed.
    pub assets_evaluated: u64,
    /// Asset evaluations that failed with an error.
    pub asset_failures: u64,
    /// Asset evaluations deferred past the cycle deadline.
    pub assets_deferred: u64,
    /// Run requests handed to the sink.
    pub runs_requested: u64,
    /// Run requests the sink rejected.
    pub sink_failures: u64,
    /// Average cycle duration over all finalized ticks.
    pub avg_cycle_duration: Duration,
    /// Timestamp of the last finalized tick.
    pub last_tick: Option<DateTime<Utc>>,
    pub last_evaluation_id: Option<u64>,
    pub current_phase: CyclePhase,
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self {
            ticks_by_status: HashMap::new(),
            assets_evaluated: 0,
            asset_failures: 0,
            assets_deferred: 0,
            runs_requested: 0,
            sink_failures: 0,
            avg_cycle_duration: Duration::ZERO,
            last_tick: None,
            last_evaluation_id: None,
            current_phase: CyclePhase::Idle,
        }
    }
}

impl DaemonMetrics {
    pub fn total_ticks(&self) -> u64 {
        self.ticks_by_status.values().sum()
    }

    /// Record a finalized tick.
    pub fn record_tick(&mut self, status: TickStatus, evaluation_id: u64, duration: Duration) {
        *self.ticks_by_status.entry(status).or_default() += 1;
        self.last_tick = Some(Utc::now());
        self.last_evaluation_id = Some(evaluation_id);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.total_ticks();
        self.avg_cycle_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_cycle_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_tick() {
        let mut m = DaemonMetrics::default();
        m.record_tick(TickStatus::Success, 1, Duration::from_millis(100));

        assert_eq!(m.ticks_by_status[&TickStatus::Success], 1);
        assert!(m.last_tick.is_some());
        assert_eq!(m.last_evaluation_id, Some(1));
        assert_eq!(m.avg_cycle_duration, Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_ticks_averages() {
        let mut m = DaemonMetrics::default();
        m.record_tick(TickStatus::Success, 1, Duration::from_millis(100));
        m.record_tick(TickStatus::Skipped, 2, Duration::from_millis(200));

        assert_eq!(m.total_ticks(), 2);
        // Average of 100ms and 200ms = 150ms
        let avg = m.avg_cycle_duration.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn default_metrics() {
        let m = DaemonMetrics::default();
        assert_eq!(m.current_phase, CyclePhase::Idle);
        assert_eq!(m.total_ticks(), 0);
        assert!(m.last_evaluation_id.is_none());
    }
}
