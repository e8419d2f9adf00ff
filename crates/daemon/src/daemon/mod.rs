//! Automation daemon -- owns the tick state machine.
//!
//! Split into focused submodules:
//! - `core`: daemon struct, constructor, cursor resets and accessors
//! - `cycle`: one tick from start to commit, and the interval loop
//! - `requests`: grouping requested subsets into run requests

mod core;
mod cycle;
mod requests;
#[cfg(test)]
mod tests;

pub use self::core::AutomationDaemon;
pub use self::cycle::CycleReport;
pub use self::requests::group_run_requests;
