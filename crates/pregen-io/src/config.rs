use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Largest scan radius, in cells, accepted for either radius setting.
pub const MAX_RADIUS: i32 = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_generation_radius")]
    pub generation_radius: i32,
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    /// Host ticks between queue maintenance passes.
    #[serde(default = "default_queue_update_interval")]
    pub queue_update_interval: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Radius used instead when a partition runs the fast generation backend.
    #[serde(default = "default_fast_mode_min_radius")]
    pub fast_mode_min_radius: i32,
    /// Cells pushed to one viewer per catch-up pass.
    #[serde(default = "default_catch_up_limit")]
    pub catch_up_limit: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_dirty_flush_interval_ms")]
    pub dirty_flush_interval_ms: u64,
    /// 0 disables periodic roster checkpoints.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Ticks in the host health rolling window.
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    #[serde(default = "default_min_healthy_tps")]
    pub min_healthy_tps: f32,
    #[serde(default = "default_target_tps")]
    pub target_tps: f32,
}

fn default_enabled() -> bool {
    true
}
fn default_generation_radius() -> i32 {
    32
}
fn default_max_active_tasks() -> usize {
    4
}
fn default_queue_update_interval() -> u32 {
    20
}
fn default_max_queue_size() -> usize {
    20_000
}
fn default_fast_mode_min_radius() -> i32 {
    128
}
fn default_catch_up_limit() -> usize {
    64
}
fn default_acquire_timeout_ms() -> u64 {
    50
}
fn default_dirty_flush_interval_ms() -> u64 {
    2_000
}
fn default_checkpoint_interval_secs() -> u64 {
    300
}
fn default_health_window() -> usize {
    40
}
fn default_min_healthy_tps() -> f32 {
    15.0
}
fn default_target_tps() -> f32 {
    20.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            generation_radius: default_generation_radius(),
            max_active_tasks: default_max_active_tasks(),
            queue_update_interval: default_queue_update_interval(),
            max_queue_size: default_max_queue_size(),
            fast_mode_min_radius: default_fast_mode_min_radius(),
            catch_up_limit: default_catch_up_limit(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            dirty_flush_interval_ms: default_dirty_flush_interval_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            health_window: default_health_window(),
            min_healthy_tps: default_min_healthy_tps(),
            target_tps: default_target_tps(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults scaled to the machine, used on a fresh install.
    pub fn auto_configured(cores: usize) -> Self {
        let generation_radius = if cores >= 12 {
            128
        } else if cores >= 6 {
            64
        } else {
            32
        };
        Self {
            max_active_tasks: (cores / 2).clamp(1, 16),
            generation_radius,
            ..Self::default()
        }
    }

    /// Clamps out-of-range values to something the scheduler can run with.
    pub fn sanitized(mut self) -> Self {
        self.generation_radius = self.generation_radius.clamp(0, MAX_RADIUS);
        self.fast_mode_min_radius = self.fast_mode_min_radius.clamp(0, MAX_RADIUS);
        self.max_active_tasks = self.max_active_tasks.max(1);
        self.health_window = self.health_window.max(2);
        if !(self.target_tps.is_finite() && self.target_tps > 0.0) {
            self.target_tps = default_target_tps();
        }
        if !self.min_healthy_tps.is_finite() || self.min_healthy_tps < 0.0 {
            self.min_healthy_tps = default_min_healthy_tps();
        }
        self
    }

    /// Radius to scan in a partition, widened when the fast backend serves it.
    pub fn radius_for(&self, fast_mode: bool) -> i32 {
        if fast_mode {
            self.generation_radius.max(self.fast_mode_min_radius)
        } else {
            self.generation_radius
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn dirty_flush_interval(&self) -> Duration {
        Duration::from_millis(self.dirty_flush_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }
}

/// Where the scheduler pulls its configuration from. Only consulted at start and on a
/// scheduled reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> SchedulerConfig;
}

/// Fixed in-memory configuration that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticConfig {
    current: Mutex<SchedulerConfig>,
}

impl StaticConfig {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            current: Mutex::new(config),
        }
    }

    pub fn set(&self, config: SchedulerConfig) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = config;
    }
}

impl ConfigSource for StaticConfig {
    fn load(&self) -> SchedulerConfig {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .sanitized()
    }
}

/// TOML file on disk, auto-created with machine-scaled defaults when missing.
#[derive(Debug)]
pub struct TomlConfigFile {
    path: PathBuf,
    last_good: Mutex<Option<SchedulerConfig>>,
}

impl TomlConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_good: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_load(&self) -> Result<SchedulerConfig, ConfigError> {
        let s = fs::read_to_string(&self.path)?;
        let cfg: SchedulerConfig = toml::from_str(&s)?;
        Ok(cfg.sanitized())
    }

    pub fn save(&self, config: &SchedulerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, toml::to_string_pretty(config)?)?;
        Ok(())
    }

    fn remember(&self, config: &SchedulerConfig) {
        *self.last_good.lock().unwrap_or_else(|p| p.into_inner()) = Some(config.clone());
    }
}

impl ConfigSource for TomlConfigFile {
    fn load(&self) -> SchedulerConfig {
        if !self.path.exists() {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            let cfg = SchedulerConfig::auto_configured(cores);
            match self.save(&cfg) {
                Ok(()) => log::info!(
                    "wrote default pregen config to {:?} (radius {}, {} tasks)",
                    self.path,
                    cfg.generation_radius,
                    cfg.max_active_tasks
                ),
                Err(e) => log::warn!("failed to write default config {:?}: {}", self.path, e),
            }
            self.remember(&cfg);
            return cfg;
        }
        match self.try_load() {
            Ok(cfg) => {
                self.remember(&cfg);
                cfg
            }
            Err(e) => {
                log::error!("failed to load config {:?}: {}", self.path, e);
                self.last_good
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
                    .unwrap_or_default()
            }
        }
    }
}
