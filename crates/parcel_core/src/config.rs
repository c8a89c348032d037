//! Engine configuration.
//!
//! Every field has a default so a partial YAML document (or none at all)
//! yields a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when evidence persistence fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PersistenceMode {
    /// One attempt bounded by the store timeout; failures are logged and
    /// reported as degraded.
    BestEffort,
    /// Retry with exponential backoff before reporting degraded.
    RetryWithBackoff {
        max_attempts: u32,
        initial_backoff_ms: u64,
    },
}

impl Default for PersistenceMode {
    fn default() -> Self {
        Self::BestEffort
    }
}

impl PersistenceMode {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::BestEffort => 1,
            Self::RetryWithBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        match self {
            Self::BestEffort => Duration::ZERO,
            Self::RetryWithBackoff {
                initial_backoff_ms, ..
            } => {
                if attempt <= 1 {
                    Duration::ZERO
                } else {
                    let factor = 1u64 << (attempt - 2).min(16);
                    Duration::from_millis(initial_backoff_ms.saturating_mul(factor))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to every rule/evidence/quality store call.
    pub store_timeout_ms: u64,
    /// Timeout applied to each context layer lookup.
    pub layer_timeout_ms: u64,
    pub context_cache_ttl_days: i64,
    pub context_max_flags: usize,
    /// Non-intersecting findings farther than this are dropped.
    pub context_retention_distance_m: f64,
    /// Cantonal-road distance under which severity escalates.
    pub road_distance_threshold_m: f64,
    pub memory_cache_capacity: usize,
    pub persistence: PersistenceMode,
    pub analysis_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            layer_timeout_ms: 3_000,
            context_cache_ttl_days: 30,
            context_max_flags: 5,
            context_retention_distance_m: 100.0,
            road_distance_threshold_m: 25.0,
            memory_cache_capacity: 10_000,
            persistence: PersistenceMode::default(),
            analysis_version: "1.0".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn layer_timeout(&self) -> Duration {
        Duration::from_millis(self.layer_timeout_ms)
    }

    pub fn context_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.context_cache_ttl_days)
    }
}
