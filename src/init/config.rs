// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: a YAML file merged with `WEBLOGICBEAT_` environment
//! overrides (`__` separates nested keys, e.g. `WEBLOGICBEAT_QUEUE__SIZE`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::Deserialize;
use thiserror::Error;

use crate::assembler::{
    AssemblerLimits, EveryLine, PatternStart, RecordStart, WEBLOGIC_RECORD_START,
};
use crate::harvester::HarvesterConfig;
use crate::input::ReaderOptions;
use crate::offsets::OffsetCommitterConfig;
use crate::pipeline::{DeliveryConfig, QueueConfig, RetryConfig};
use crate::sinks::SinkKind;
use crate::watcher::{StartPosition, WatchMode};

pub const ENV_PREFIX: &str = "WEBLOGICBEAT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse config: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("invalid multiline pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Glob patterns of the files to tail.
    pub paths: Vec<String>,
    #[serde(alias = "exclude_files")]
    pub exclude: Vec<String>,
    #[serde(with = "humantime_serde::option")]
    pub scan_frequency: Option<Duration>,
    /// Older name of `scan_frequency`.
    #[serde(with = "humantime_serde::option")]
    pub period: Option<Duration>,
    pub watch_mode: WatchMode,
    pub start_at: StartPosition,
    pub harvester: HarvesterSection,
    pub multiline: MultilineSection,
    pub queue: QueueConfig,
    pub output: OutputSection,
    pub retry: RetryConfig,
    pub registry: RegistrySection,
    pub shutdown: ShutdownSection,
    pub path: PathSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvesterSection {
    #[serde(with = "humantime_serde")]
    pub read_interval: Duration,
    /// Idle time at EOF before a rotated file is closed.
    #[serde(with = "humantime_serde")]
    pub rotate_wait: Duration,
    pub max_line_bytes: usize,
    pub buffer_size: usize,
    pub max_read_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultilineSection {
    pub enabled: bool,
    pub pattern: String,
    pub negate: bool,
    pub max_bytes: usize,
    pub max_lines: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    #[serde(rename = "type")]
    pub kind: SinkKind,
    /// Target of the file output.
    pub path: Option<PathBuf>,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Defaults to `<path.data>/registry.json`.
    pub path: Option<PathBuf>,
    #[serde(with = "humantime_serde::option")]
    pub flush: Option<Duration>,
    #[serde(with = "humantime_serde::option")]
    pub max_failure_duration: Option<Duration>,
    /// How long offsets of files nobody reads are kept.
    #[serde(with = "humantime_serde::option")]
    pub clean_inactive: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSection {
    pub data: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            exclude: Vec::new(),
            scan_frequency: None,
            period: None,
            watch_mode: WatchMode::default(),
            start_at: StartPosition::default(),
            harvester: HarvesterSection::default(),
            multiline: MultilineSection::default(),
            queue: QueueConfig::default(),
            output: OutputSection::default(),
            retry: RetryConfig::default(),
            registry: RegistrySection::default(),
            shutdown: ShutdownSection::default(),
            path: PathSection::default(),
        }
    }
}

impl Default for HarvesterSection {
    fn default() -> Self {
        let reader = ReaderOptions::default();
        Self {
            read_interval: Duration::from_millis(250),
            rotate_wait: Duration::from_secs(1),
            max_line_bytes: reader.max_line_bytes,
            buffer_size: reader.read_buffer_bytes,
            max_read_bytes: reader.max_read_bytes,
        }
    }
}

impl Default for MultilineSection {
    fn default() -> Self {
        let limits = AssemblerLimits::default();
        Self {
            enabled: true,
            pattern: WEBLOGIC_RECORD_START.to_string(),
            negate: false,
            max_bytes: limits.max_bytes,
            max_lines: limits.max_lines,
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            kind: SinkKind::default(),
            path: None,
            batch_size: delivery.batch_size,
            flush_interval: delivery.flush_interval,
            timeout: delivery.timeout,
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PathSection {
    fn default() -> Self {
        Self {
            data: PathBuf::from("data"),
        }
    }
}

const DEFAULT_SCAN_FREQUENCY: Duration = Duration::from_secs(1);

impl AgentConfig {
    /// Load `path` and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AgentConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.paths.is_empty() {
            return invalid("at least one entry in paths is required");
        }
        if self.scan_frequency().is_zero() {
            return invalid("scan_frequency must be greater than zero");
        }
        if self.harvester.read_interval.is_zero() {
            return invalid("harvester.read_interval must be greater than zero");
        }
        if self.harvester.max_line_bytes == 0 || self.harvester.buffer_size == 0 {
            return invalid("harvester.max_line_bytes and harvester.buffer_size must be greater than zero");
        }
        if self.multiline.max_bytes == 0 || self.multiline.max_lines == 0 {
            return invalid("multiline.max_bytes and multiline.max_lines must be greater than zero");
        }
        if self.queue.size == 0 {
            return invalid("queue.size must be greater than zero");
        }
        if self.output.batch_size == 0 {
            return invalid("output.batch_size must be greater than zero");
        }
        if self.output.timeout.is_zero() {
            return invalid("output.timeout must be greater than zero");
        }
        if self.output.kind == SinkKind::File && self.output.path.is_none() {
            return invalid("output.path is required for the file output");
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return invalid("retry.initial_backoff must not exceed retry.max_backoff");
        }
        if self.checkpoint_interval().is_zero() {
            return invalid("registry.flush must be greater than zero");
        }
        if self.multiline.enabled {
            PatternStart::new(&self.multiline.pattern, self.multiline.negate)?;
        }
        Ok(())
    }

    pub fn scan_frequency(&self) -> Duration {
        self.scan_frequency
            .or(self.period)
            .unwrap_or(DEFAULT_SCAN_FREQUENCY)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry
            .path
            .clone()
            .unwrap_or_else(|| self.path.data.join("registry.json"))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        self.registry
            .flush
            .unwrap_or_else(|| OffsetCommitterConfig::default().checkpoint_interval)
    }

    pub fn record_start(&self) -> Result<Arc<dyn RecordStart>, ConfigError> {
        if !self.multiline.enabled {
            return Ok(Arc::new(EveryLine));
        }
        Ok(Arc::new(PatternStart::new(
            &self.multiline.pattern,
            self.multiline.negate,
        )?))
    }

    pub fn harvester_config(&self, host: Arc<str>) -> Result<HarvesterConfig, ConfigError> {
        Ok(HarvesterConfig {
            reader: ReaderOptions {
                max_line_bytes: self.harvester.max_line_bytes,
                read_buffer_bytes: self.harvester.buffer_size,
                max_read_bytes: self.harvester.max_read_bytes,
            },
            limits: AssemblerLimits {
                max_bytes: self.multiline.max_bytes,
                max_lines: self.multiline.max_lines,
            },
            record_start: self.record_start()?,
            read_interval: self.harvester.read_interval,
            multiline_timeout: self.multiline.timeout,
            rotate_wait: self.harvester.rotate_wait,
            host,
        })
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            batch_size: self.output.batch_size,
            flush_interval: self.output.flush_interval,
            timeout: self.output.timeout,
            retry: self.retry.clone(),
        }
    }

    pub fn committer_config(&self) -> OffsetCommitterConfig {
        let defaults = OffsetCommitterConfig::default();
        OffsetCommitterConfig {
            checkpoint_interval: self.checkpoint_interval(),
            drain_timeout: defaults.drain_timeout,
            max_checkpoint_failure_duration: self
                .registry
                .max_failure_duration
                .unwrap_or(defaults.max_checkpoint_failure_duration),
            inactive_retention: self
                .registry
                .clean_inactive
                .unwrap_or(defaults.inactive_retention),
        }
    }
}
