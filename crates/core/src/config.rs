use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Populate the process environment from `.env` in the working directory.
/// Variables that are already set keep their value; a missing file is fine.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }
}

/// Profile-aware view of the `AUTOMAT_*` variables.
///
/// With profile `STAGING`, `AUTOMAT_DATA_DIR` is read from
/// `STAGING_AUTOMAT_DATA_DIR` when that is set and non-empty, and from
/// `AUTOMAT_DATA_DIR` otherwise. Empty values count as unset.
#[derive(Debug, Clone, Copy)]
struct ProfiledEnv<'a> {
    profile: &'a str,
}

impl<'a> ProfiledEnv<'a> {
    fn new(profile: &'a str) -> Self {
        Self { profile }
    }

    fn lookup(key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.is_empty())
    }

    fn get(&self, key: &str) -> Option<String> {
        if self.profile.is_empty() {
            return Self::lookup(key);
        }
        Self::lookup(&format!("{}_{key}", self.profile)).or_else(|| Self::lookup(key))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Unparseable values fall back to `default`.
    fn parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `AUTOMAT_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = ProfiledEnv::new("").string("AUTOMAT_PROFILE", "");
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            daemon: DaemonConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  daemon:   tick_interval={}s, max_cycle={}s, stale_tick={}s, workers={}",
            self.daemon.tick_interval_seconds,
            self.daemon.max_cycle_seconds,
            self.daemon.stale_tick_seconds,
            self.daemon.resolved_worker_threads(),
        );
        tracing::info!(
            "  cursors:  requested_history={}",
            self.daemon.requested_history_len
        );
        tracing::info!("  storage:  data_dir={}", self.storage.data_dir.display());
    }
}

// ── Daemon ────────────────────────────────────────────────────

/// Tick loop configuration. Also deserializable from TOML/YAML with the
/// same defaults as the environment loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Pause between two cycles.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Wall-clock budget of one cycle; assets not reached are deferred.
    #[serde(default = "default_max_cycle")]
    pub max_cycle_seconds: u64,
    /// Age after which a STARTED tick is considered abandoned.
    #[serde(default = "default_stale_tick")]
    pub stale_tick_seconds: u64,
    /// Number of evaluation worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
    /// Number of past requested subsets kept in each asset cursor.
    #[serde(default = "default_requested_history")]
    pub requested_history_len: usize,
}

fn default_tick_interval() -> u64 { 30 }
fn default_max_cycle() -> u64 { 60 }
fn default_stale_tick() -> u64 { 600 }
fn default_requested_history() -> usize { 10 }

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval(),
            max_cycle_seconds: default_max_cycle(),
            stale_tick_seconds: default_stale_tick(),
            worker_threads: 0,
            requested_history_len: default_requested_history(),
        }
    }
}

impl DaemonConfig {
    fn from_env_profiled(p: &str) -> Self {
        let env = ProfiledEnv::new(p);
        Self {
            tick_interval_seconds: env.parsed("AUTOMAT_TICK_INTERVAL_SECONDS", default_tick_interval()),
            max_cycle_seconds: env.parsed("AUTOMAT_MAX_CYCLE_SECONDS", default_max_cycle()),
            stale_tick_seconds: env.parsed("AUTOMAT_STALE_TICK_SECONDS", default_stale_tick()),
            worker_threads: env.parsed("AUTOMAT_WORKER_THREADS", 0),
            requested_history_len: env.parsed("AUTOMAT_REQUEST_HISTORY", default_requested_history()),
        }
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn max_cycle_duration(&self) -> Duration {
        Duration::from_secs(self.max_cycle_seconds)
    }

    pub fn stale_tick_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_tick_seconds).unwrap_or(i64::MAX))
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the filesystem schedule store.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(ProfiledEnv::new(p).string("AUTOMAT_DATA_DIR", "data/automation")),
        }
    }
}
