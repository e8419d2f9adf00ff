//! The automation daemon: periodic ticks that evaluate every managed asset's
//! condition, persist the outcome and hand run requests to a sink.
//!
//! - [`AutomationDaemon`]: the tick state machine and its interval loop
//! - [`definitions`]: managed assets, loadable from YAML
//! - [`RunRequestSink`]: where requested runs go after a commit

pub mod daemon;
pub mod definitions;
pub mod error;
pub mod metrics;
pub mod sink;

pub use daemon::{group_run_requests, AutomationDaemon, CycleReport};
pub use definitions::{AssetDefinition, ConditionSpec, DefinitionsFile};
pub use error::{DaemonError, SinkError};
pub use metrics::{CyclePhase, DaemonMetrics};
pub use sink::{InstanceSink, LoggingSink, RecordingSink, RunRequestSink};
