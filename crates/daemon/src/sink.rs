//! Hand-off point for run requests produced by a committed cycle.
//!
//! The daemon never launches runs itself. After a tick is committed each
//! request is passed to a [`RunRequestSink`]; a failing sink is logged and
//! does not touch the committed tick.

use std::sync::{Arc, Mutex};

use automat_conditions::InMemoryInstance;
use automat_storage::RunRequest;
use tracing::info;

use crate::error::SinkError;

/// Receiver of run requests.
pub trait RunRequestSink: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn submit(&self, run_id: &str, request: &RunRequest) -> Result<(), SinkError>;
}

/// Logs each request and drops it.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl RunRequestSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    fn submit(&self, run_id: &str, request: &RunRequest) -> Result<(), SinkError> {
        let assets: Vec<String> = request.asset_selection.iter().map(|a| a.to_string()).collect();
        info!(
            run_id,
            assets = ?assets,
            partition = request.partition_key.as_deref().unwrap_or("-"),
            "Run requested"
        );
        Ok(())
    }
}

/// Keeps every submitted request in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    submitted: Mutex<Vec<(String, RunRequest)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<(String, RunRequest)> {
        self.submitted
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl RunRequestSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn submit(&self, run_id: &str, request: &RunRequest) -> Result<(), SinkError> {
        let mut submitted = self
            .submitted
            .lock()
            .map_err(|e| SinkError::LockPoisoned(e.to_string()))?;
        submitted.push((run_id.to_string(), request.clone()));
        Ok(())
    }
}

/// Starts each request as an in-flight run on an [`InMemoryInstance`], so
/// the next cycle sees it as in progress.
pub struct InstanceSink {
    instance: Arc<InMemoryInstance>,
}

impl InstanceSink {
    pub fn new(instance: Arc<InMemoryInstance>) -> Self {
        Self { instance }
    }
}

impl RunRequestSink for InstanceSink {
    fn name(&self) -> &str {
        "instance"
    }

    fn submit(&self, run_id: &str, request: &RunRequest) -> Result<(), SinkError> {
        for asset in &request.asset_selection {
            self.instance
                .launch_run(run_id, asset, request.partition_key.as_deref())
                .map_err(|e| SinkError::Rejected {
                    run_id: run_id.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}
