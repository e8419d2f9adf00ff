use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use automat_conditions::{evaluate_asset, AssetCursor, AssetEvaluation};
use automat_core::{AssetKey, PartitionSubset};
use automat_storage::{CycleCommit, NewEvaluation, RunRequest, TickFilter, TickRecord, TickStatus};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::definitions::AssetDefinition;
use crate::error::DaemonError;
use crate::metrics::CyclePhase;

use super::requests::{assign_run_ids, group_run_requests, run_ids_for};
use super::AutomationDaemon;

/// What one committed cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// The finalized tick as committed.
    pub tick: TickRecord,
    /// Assets whose evaluation was committed.
    pub evaluated: Vec<AssetKey>,
    /// Assets not reached before the cycle deadline; their cursors are untouched.
    pub deferred: Vec<AssetKey>,
    /// Run requests the sink accepted.
    pub submitted: Vec<(String, RunRequest)>,
}

enum AssetOutcome {
    Evaluated {
        evaluation: AssetEvaluation,
        requested: PartitionSubset,
        num_requested: usize,
    },
    Failed {
        asset: AssetKey,
        error: String,
    },
    Deferred(AssetKey),
}

fn elapsed_since(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    now + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

impl AutomationDaemon {
    /// Run one tick at `now`.
    ///
    /// The tick moves STARTED → (evaluating, requesting, persisting) →
    /// SUCCESS | SKIPPED | FAILURE. Evaluation rows, cursors and the final
    /// tick are written in one commit; if it fails the tick is marked
    /// FAILURE and no cursor changes. Run requests reach the sink only
    /// after a successful commit.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, DaemonError> {
        let _guard = self.lock_cycle()?;
        let started = Instant::now();
        let result = self.run_locked_cycle(now, started);
        self.set_phase(CyclePhase::Idle);
        result
    }

    fn run_locked_cycle(&self, now: DateTime<Utc>, started: Instant) -> Result<CycleReport, DaemonError> {
        self.recover_abandoned_ticks(now)?;

        let evaluation_id = self.storage.latest_evaluation_id()?.map_or(1, |id| id + 1);
        let tick = self.storage.create_tick(now, evaluation_id)?;
        self.set_phase(CyclePhase::TickStarted);
        info!(
            tick_id = tick.id,
            evaluation_id,
            assets = self.definitions.len(),
            "Tick started"
        );

        let cursors = match self.storage.all_cursors() {
            Ok(c) => c,
            Err(e) => {
                self.fail_tick(&tick, now, started, &e.to_string());
                return Err(e.into());
            }
        };

        // ── Evaluate ────────────────────────────────────────────────
        self.set_phase(CyclePhase::Evaluating);
        let deadline = started + self.config.max_cycle_duration();
        let outcomes: Vec<AssetOutcome> = self.pool.install(|| {
            self.definitions
                .par_iter()
                .map(|def| self.evaluate_one(def, cursors.get(&def.key), evaluation_id, now, deadline))
                .collect()
        });

        if self.is_shutdown() {
            warn!(tick_id = tick.id, evaluation_id, "Cycle cancelled before commit");
            self.fail_tick(&tick, now, started, "cancelled");
            return Err(DaemonError::Cancelled { tick_id: tick.id });
        }

        // ── Request ─────────────────────────────────────────────────
        self.set_phase(CyclePhase::Requesting);
        let mut evaluated = Vec::new();
        let mut deferred = Vec::new();
        let mut asset_errors = BTreeMap::new();
        for outcome in outcomes {
            match outcome {
                AssetOutcome::Evaluated {
                    evaluation,
                    requested,
                    num_requested,
                } => evaluated.push((evaluation, requested, num_requested)),
                AssetOutcome::Failed { asset, error } => {
                    asset_errors.insert(asset, error);
                }
                AssetOutcome::Deferred(asset) => deferred.push(asset),
            }
        }

        let requested: Vec<(AssetKey, PartitionSubset)> = evaluated
            .iter()
            .map(|(evaluation, requested, _)| (evaluation.asset_key.clone(), requested.clone()))
            .collect();
        let runs = match group_run_requests(&requested) {
            Ok(requests) => assign_run_ids(requests),
            Err(e) => {
                self.fail_tick(&tick, now, started, &e.to_string());
                return Err(e.into());
            }
        };

        let mut rows = Vec::with_capacity(evaluated.len());
        let mut next_cursors: Vec<AssetCursor> = Vec::with_capacity(evaluated.len());
        let mut evaluated_keys = Vec::with_capacity(evaluated.len());
        for (evaluation, requested, num_requested) in evaluated {
            let AssetEvaluation {
                asset_key,
                tree,
                mut cursor,
                ..
            } = evaluation;
            if !requested.is_empty() {
                cursor.record_requested(requested, self.config.requested_history_len);
            }
            rows.push(NewEvaluation {
                run_ids: run_ids_for(&asset_key, &runs),
                asset_key: asset_key.clone(),
                evaluation_id,
                timestamp: now,
                num_requested,
                tree,
            });
            next_cursors.push(cursor);
            evaluated_keys.push(asset_key);
        }

        // ── Persist ─────────────────────────────────────────────────
        self.set_phase(CyclePhase::Persisting);
        let status = if runs.is_empty() {
            TickStatus::Skipped
        } else {
            TickStatus::Success
        };
        let (run_ids, run_requests): (Vec<String>, Vec<RunRequest>) = runs.iter().cloned().unzip();
        let final_tick = tick
            .finalized(status, elapsed_since(now, started), run_requests, run_ids)
            .with_asset_errors(asset_errors);

        let commit = CycleCommit {
            tick: final_tick.clone(),
            evaluations: rows,
            cursors: next_cursors,
        };
        if let Err(e) = self.storage.commit_cycle(commit) {
            error!(
                tick_id = tick.id,
                evaluation_id,
                error = %e,
                "Cycle commit failed, cursors unchanged"
            );
            self.fail_tick(&tick, now, started, &e.to_string());
            return Err(e.into());
        }

        if let Ok(mut m) = self.metrics.write() {
            m.record_tick(status, evaluation_id, started.elapsed());
            m.assets_evaluated += evaluated_keys.len() as u64;
            m.asset_failures += final_tick.asset_errors.len() as u64;
            m.assets_deferred += deferred.len() as u64;
        }
        info!(
            tick_id = tick.id,
            evaluation_id,
            status = %status,
            evaluated = evaluated_keys.len(),
            deferred = deferred.len(),
            failed = final_tick.asset_errors.len(),
            runs = runs.len(),
            "Tick finalized"
        );

        let submitted = self.submit_runs(runs);

        Ok(CycleReport {
            tick: final_tick,
            evaluated: evaluated_keys,
            deferred,
            submitted,
        })
    }

    fn evaluate_one(
        &self,
        def: &AssetDefinition,
        previous: Option<&AssetCursor>,
        evaluation_id: u64,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> AssetOutcome {
        if self.is_shutdown() || Instant::now() >= deadline {
            debug!(asset = %def.key, evaluation_id, "Asset deferred");
            return AssetOutcome::Deferred(def.key.clone());
        }

        let evaluation = match evaluate_asset(
            &def.key,
            &def.condition,
            self.instance.as_ref(),
            previous,
            evaluation_id,
            now,
        ) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(asset = %def.key, evaluation_id, error = %e, "Asset evaluation failed");
                return AssetOutcome::Failed {
                    asset: def.key.clone(),
                    error: e.to_string(),
                };
            }
        };

        // Partitions already targeted by a running run are never requested again.
        let requested = self
            .instance
            .in_flight_runs(&def.key)
            .map_err(|e| e.to_string())
            .and_then(|in_flight| evaluation.true_subset.difference(&in_flight).map_err(|e| e.to_string()))
            .and_then(|requested| {
                requested
                    .size()
                    .map(|n| (requested, n))
                    .map_err(|e| e.to_string())
            });

        match requested {
            Ok((requested, num_requested)) => {
                debug!(asset = %def.key, evaluation_id, requested = %requested, "Asset evaluated");
                AssetOutcome::Evaluated {
                    evaluation,
                    requested,
                    num_requested,
                }
            }
            Err(error) => {
                warn!(asset = %def.key, evaluation_id, error = %error, "Requested subset unavailable");
                AssetOutcome::Failed {
                    asset: def.key.clone(),
                    error,
                }
            }
        }
    }

    /// Hand committed runs to the sink. Failures are logged only.
    fn submit_runs(&self, runs: Vec<(String, RunRequest)>) -> Vec<(String, RunRequest)> {
        let mut submitted = Vec::with_capacity(runs.len());
        let mut failures = 0u64;
        for (run_id, request) in runs {
            match self.sink.submit(&run_id, &request) {
                Ok(()) => submitted.push((run_id, request)),
                Err(e) => {
                    failures += 1;
                    warn!(run_id = %run_id, sink = self.sink.name(), error = %e, "Run request not accepted");
                }
            }
        }
        if let Ok(mut m) = self.metrics.write() {
            m.runs_requested += submitted.len() as u64;
            m.sink_failures += failures;
        }
        submitted
    }

    /// Mark STARTED ticks older than the stale threshold as FAILURE.
    fn recover_abandoned_ticks(&self, now: DateTime<Utc>) -> Result<usize, DaemonError> {
        let stale = self.storage.get_ticks(&TickFilter {
            before: Some(now - self.config.stale_tick_after()),
            statuses: Some(vec![TickStatus::Started]),
            ..TickFilter::default()
        })?;
        for tick in &stale {
            warn!(tick_id = tick.id, started = %tick.timestamp, "Marking abandoned tick as failed");
            self.storage
                .update_tick(tick.finalized(TickStatus::Failure, now, Vec::new(), Vec::new()).with_error("abandoned"))?;
        }
        Ok(stale.len())
    }

    /// Best-effort FAILURE finalization of `tick`.
    fn fail_tick(&self, tick: &TickRecord, now: DateTime<Utc>, started: Instant, reason: &str) {
        let failed = tick
            .finalized(TickStatus::Failure, elapsed_since(now, started), Vec::new(), Vec::new())
            .with_error(reason);
        match self.storage.update_tick(failed) {
            Ok(()) => {
                if let Ok(mut m) = self.metrics.write() {
                    m.record_tick(TickStatus::Failure, tick.evaluation_id, started.elapsed());
                }
            }
            Err(e) => error!(tick_id = tick.id, error = %e, "Failed to mark tick as failed"),
        }
    }

    /// Run cycles every `tick_interval` until shutdown. Blocks the caller.
    pub fn run(&self) {
        info!(
            assets = self.definitions.len(),
            interval_secs = self.config.tick_interval_seconds,
            "Automation daemon starting"
        );

        while !self.is_shutdown() {
            match self.run_cycle(Utc::now()) {
                Ok(report) => debug!(
                    tick_id = report.tick.id,
                    submitted = report.submitted.len(),
                    "Cycle complete"
                ),
                Err(DaemonError::Cancelled { tick_id }) => {
                    info!(tick_id, "Cycle cancelled by shutdown");
                    break;
                }
                Err(e) => error!(error = %e, "Cycle failed"),
            }
            self.sleep_until_next_tick();
        }

        info!("Automation daemon stopped");
    }

    fn sleep_until_next_tick(&self) {
        let until = Instant::now() + self.config.tick_interval();
        while !self.is_shutdown() {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(100)));
        }
    }
}
