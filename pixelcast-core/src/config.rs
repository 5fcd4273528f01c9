//! # Configuration
//!
//! Tunables of the pipeline. Every section defaults, so a partial (or empty) config file is valid.

use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub creation: CreationConfig,
    pub cache: CacheConfig,
    pub distribution: DistributionConfig,
    pub limits: Limits,
    pub animation: AnimationConfig,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CreationConfig {
    /// Number of creation jobs that may run at once.
    pub parallelism: usize,
    /// A job still running after this long is cancelled.
    pub processing_timeout_ms: u64,
    /// How often queued jobs have their position refreshed and running jobs their elapsed time checked.
    pub monitor_period_ms: u64,
}
impl Default for CreationConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            processing_timeout_ms: 120_000,
            monitor_period_ms: 1_000,
        }
    }
}
impl CreationConfig {
    #[must_use]
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
    #[must_use]
    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicyKind {
    /// Load while viewed, evict after a period of no viewers.
    Dynamic,
    /// Load once, keep forever.
    Persistent,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub policy: CachePolicyKind,
    pub tick_period_ms: u64,
    /// Consecutive viewer-less ticks before a dynamic cache is evicted.
    pub idle_threshold_ticks: u32,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicyKind::Dynamic,
            tick_period_ms: 250,
            idle_threshold_ticks: 200,
        }
    }
}
impl CacheConfig {
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub tick_period_ms: u64,
    /// Maximum frame uploads per viewer per tick. Negative for unlimited.
    pub rate_limit: i32,
    /// Ticks after a viewer connects during which nothing is sent to them.
    pub connect_grace_ticks: u64,
    /// Threads used for outbound sends.
    pub send_workers: usize,
}
impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 50,
            rate_limit: 5,
            connect_grace_ticks: 40,
            send_workers: 2,
        }
    }
}
impl DistributionConfig {
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum width of a resource, in surfaces.
    pub max_width: u32,
    /// Maximum height of a resource, in surfaces.
    pub max_height: u32,
    /// Maximum size of fetched source media.
    pub max_source_bytes: usize,
    /// Maximum number of decoded frames in animated media.
    pub max_frames: usize,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_width: 10,
            max_height: 10,
            max_source_bytes: 50 * 1024 * 1024,
            max_frames: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Length of one animation tick. Frame delays are rounded to a multiple of this.
    pub ms_per_tick: u32,
}
impl Default for AnimationConfig {
    fn default() -> Self {
        Self { ms_per_tick: 50 }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least {min}")]
    TooSmall { field: &'static str, min: u64 },
}

impl Config {
    /// Check the invariants serde can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64, u64); 8] = [
            ("creation.parallelism", self.creation.parallelism as u64, 1),
            (
                "creation.monitor_period_ms",
                self.creation.monitor_period_ms,
                1,
            ),
            ("cache.tick_period_ms", self.cache.tick_period_ms, 1),
            (
                "distribution.tick_period_ms",
                self.distribution.tick_period_ms,
                1,
            ),
            (
                "distribution.send_workers",
                self.distribution.send_workers as u64,
                1,
            ),
            ("limits.max_width", u64::from(self.limits.max_width), 1),
            ("limits.max_height", u64::from(self.limits.max_height), 1),
            ("animation.ms_per_tick", u64::from(self.animation.ms_per_tick), 1),
        ];
        for (field, value, min) in checks {
            if value < min {
                return Err(ConfigError::TooSmall { field, min });
            }
        }
        Ok(())
    }
}
