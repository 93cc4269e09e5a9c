//! Runtime configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the kernel binary cache treats a second upload for a bound function id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRebind {
    /// Keep the first binding and log when the new bytes differ
    #[default]
    Permissive,
    /// Reject a different binary for an already bound function id
    Strict,
}

/// Tunables for the host orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Compute cores per block: one matrix core followed by vector cores
    pub cores_per_block: u32,
    /// Upper bound accepted for a launch's block dimension
    pub max_block_dim: u32,
    /// Highest device id accepted by device selection
    pub max_device_id: i32,
    /// Records per telemetry buffer
    pub telemetry_capacity: usize,
    /// How long telemetry collection waits before giving up
    pub poll_timeout: Duration,
    /// Sleep between telemetry polls
    pub poll_interval: Duration,
    pub cache_rebind: CacheRebind,
    /// Directory the trace file is written to
    pub trace_dir: PathBuf,
    /// Collect telemetry for every run
    pub profiling: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cores_per_block: 3,
            max_block_dim: 24,
            max_device_id: 15,
            telemetry_capacity: 1024,
            poll_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_micros(50),
            cache_rebind: CacheRebind::Permissive,
            trace_dir: PathBuf::from("outputs"),
            profiling: false,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from defaults overridden by environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `TANDEM_CORES_PER_BLOCK` - compute cores per block
    /// - `TANDEM_TELEMETRY_CAPACITY` - records per telemetry buffer
    /// - `TANDEM_POLL_TIMEOUT_MS` - telemetry collection timeout
    /// - `TANDEM_CACHE_REBIND` - `permissive` or `strict`
    /// - `TANDEM_TRACE_DIR` - trace output directory
    /// - `TANDEM_PROFILING` - `1`/`true` enables telemetry for every run
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(cores) = parse_env::<u32>("TANDEM_CORES_PER_BLOCK").filter(|c| *c > 0) {
            config.cores_per_block = cores;
        }
        if let Some(capacity) = parse_env::<usize>("TANDEM_TELEMETRY_CAPACITY").filter(|c| *c > 0) {
            config.telemetry_capacity = capacity;
        }
        if let Some(timeout_ms) = parse_env::<u64>("TANDEM_POLL_TIMEOUT_MS") {
            config.poll_timeout = Duration::from_millis(timeout_ms);
        }
        if let Ok(rebind) = env::var("TANDEM_CACHE_REBIND") {
            config.cache_rebind = match rebind.trim().to_ascii_lowercase().as_str() {
                "strict" => CacheRebind::Strict,
                _ => CacheRebind::Permissive,
            };
        }
        if let Ok(dir) = env::var("TANDEM_TRACE_DIR") {
            if !dir.trim().is_empty() {
                config.trace_dir = PathBuf::from(dir);
            }
        }
        if let Ok(profiling) = env::var("TANDEM_PROFILING") {
            config.profiling = profiling == "1" || profiling.eq_ignore_ascii_case("true");
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
