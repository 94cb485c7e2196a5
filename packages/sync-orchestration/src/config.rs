//! Env-var-driven configuration (spec §6, §10.4), mirroring the teacher's
//! `StageConfig::default()` pattern.

use crate::session::AnomalyResolutionMode;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32, min: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v >= min)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Clamps `value` into `[lo, hi]`.
pub fn clamp_u32(value: u32, lo: u32, hi: u32) -> u32 {
    value.clamp(lo, hi)
}

/// Per-operation tuning overrides (spec §4.3.5 / §4.3.11 `updateTuning`).
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub max_concurrency: u32,
    pub batch_size: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_concurrency: 12,
            batch_size: 60,
        }
    }
}

impl Tuning {
    /// Applies `updateTuning`'s clamp rule: `maxConcurrency ∈ [1,64]`,
    /// `batchSize ∈ [1,5000]` (spec §4.3.11).
    pub fn apply_update(&mut self, max_concurrency: Option<u32>, batch_size: Option<u32>) {
        if let Some(mc) = max_concurrency {
            self.max_concurrency = clamp_u32(mc, 1, 64);
        }
        if let Some(bs) = batch_size {
            self.batch_size = clamp_u32(bs, 1, 5000);
        }
    }

    /// Applies the full-sync batch/concurrency clamp rule: `batchSize ∈
    /// [1,1000]` (default 60), `maxConcurrency ∈ [1, batchSize]` (default
    /// 12) (spec §4.3.5).
    pub fn for_full_sync(&self) -> (u32, u32) {
        let batch_size = clamp_u32(self.batch_size, 1, 1000);
        let max_concurrency = clamp_u32(self.max_concurrency, 1, batch_size);
        (max_concurrency, batch_size)
    }
}

/// Top-level coordinator configuration, read once at construction and
/// overridable per-operation via `options`/`updateTuning` (spec §4.3.1,
/// §4.3.5, §4.3.11, §6).
#[derive(Debug, Clone)]
pub struct SyncCoordinatorConfig {
    /// Whether rollback-point/checkpoint history is retained at all
    /// (spec §6, default true).
    pub history_enabled: bool,
    pub anomaly_resolution_mode: AnomalyResolutionMode,
    /// Default pending-operation safety timeout, ms (spec §4.3.1, default
    /// 30_000, overridable per-operation via `options.timeout`).
    pub default_timeout_ms: u64,
    pub default_tuning: Tuning,
}

impl Default for SyncCoordinatorConfig {
    fn default() -> Self {
        Self {
            history_enabled: true,
            anomaly_resolution_mode: AnomalyResolutionMode::Warn,
            default_timeout_ms: 30_000,
            default_tuning: Tuning::default(),
        }
    }
}

impl SyncCoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            history_enabled: env_bool("HISTORY_ENABLED", true),
            anomaly_resolution_mode: AnomalyResolutionMode::from_env(),
            default_timeout_ms: env_u64("SYNC_OPERATION_TIMEOUT_MS", 30_000),
            default_tuning: Tuning::default(),
        }
    }

    /// `min(max(timeout/6, 3000), 20000)` ms (spec §4.3.6 step 1).
    pub fn keepalive_interval_ms(&self, timeout_ms: u64) -> u64 {
        (timeout_ms / 6).max(3_000).min(20_000)
    }
}

/// `SCMService` configuration (spec §4.4 step 8, §6).
#[derive(Debug, Clone)]
pub struct ScmServiceConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ScmServiceConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl ScmServiceConfig {
    pub fn from_env() -> Self {
        Self {
            max_retries: env_u32("SCM_PROVIDER_MAX_RETRIES", 2, 1),
            retry_delay_ms: env_u64("SCM_PROVIDER_RETRY_DELAY_MS", 500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_default_matches_spec() {
        let tuning = Tuning::default();
        assert_eq!(tuning.max_concurrency, 12);
        assert_eq!(tuning.batch_size, 60);
    }

    #[test]
    fn test_update_tuning_clamps_to_spec_bounds() {
        let mut tuning = Tuning::default();
        tuning.apply_update(Some(1000), Some(10_000));
        assert_eq!(tuning.max_concurrency, 64);
        assert_eq!(tuning.batch_size, 5000);

        tuning.apply_update(Some(0), Some(0));
        assert_eq!(tuning.max_concurrency, 1);
        assert_eq!(tuning.batch_size, 1);
    }

    #[test]
    fn test_full_sync_clamp_bounds_concurrency_by_batch_size() {
        let tuning = Tuning {
            max_concurrency: 999,
            batch_size: 10,
        };
        let (max_concurrency, batch_size) = tuning.for_full_sync();
        assert_eq!(batch_size, 10);
        assert_eq!(max_concurrency, 10);
    }

    #[test]
    fn test_keepalive_interval_is_clamped() {
        let config = SyncCoordinatorConfig::default();
        assert_eq!(config.keepalive_interval_ms(3_000), 3_000);
        assert_eq!(config.keepalive_interval_ms(300_000), 20_000);
        assert_eq!(config.keepalive_interval_ms(30_000), 5_000);
    }

    #[test]
    fn test_scm_config_defaults() {
        let config = ScmServiceConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay_ms, 500);
    }
}
