//! # Configuration Module / 配置模块
//!
//! Run-wide options recognized by the engine. A configuration can be built in
//! code, parsed from TOML or JSON, and overridden through `CONDUCTOR_*`
//! environment variables.
//!
//! 引擎识别的运行级选项。配置可以在代码中构建、从 TOML 或 JSON 解析，
//! 并可通过 `CONDUCTOR_*` 环境变量覆盖。

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::core::bus::DEFAULT_QUEUE_CAPACITY;

/// Prefix of environment variables read by [`RunnerConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "CONDUCTOR_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for option '{option}': expected {expected}")]
    InvalidValue {
        option: String,
        value: String,
        expected: &'static str,
    },
    #[error("option '{0}' must be greater than zero")]
    MustBePositive(&'static str),
}

/// Strategy used to run parallel-eligible collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelAlgorithm {
    /// A counting semaphore of `max` permits around every collection.
    #[default]
    Conservative,
    /// Every collection starts immediately; at most `max` units of awaited
    /// work run at any instant.
    Aggressive,
}

impl FromStr for ParallelAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            _ => Err(ConfigError::InvalidValue {
                option: "parallelAlgorithm".into(),
                value: s.into(),
                expected: "conservative or aggressive",
            }),
        }
    }
}

impl fmt::Display for ParallelAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
        })
    }
}

/// Whether tests marked explicit are excluded, included, or exclusively run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplicitOption {
    /// Explicit tests are reported as not run.
    #[default]
    Off,
    /// Every test runs.
    On,
    /// Only explicit tests run; the rest are reported as not run.
    Only,
}

impl ExplicitOption {
    /// Whether a test with the given explicit flag runs under this option.
    pub fn includes(self, explicit: bool) -> bool {
        match self {
            Self::Off => !explicit,
            Self::On => true,
            Self::Only => explicit,
        }
    }
}

impl FromStr for ExplicitOption {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            "only" => Ok(Self::Only),
            _ => Err(ConfigError::InvalidValue {
                option: "explicit".into(),
                value: s.into(),
                expected: "off, on or only",
            }),
        }
    }
}

/// Options of a single run.
/// 单次运行的选项。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// 0 = logical CPU count, negative = unlimited, positive = explicit cap.
    /// 0 = 逻辑 CPU 数，负数 = 无限制，正数 = 显式上限。
    #[serde(
        alias = "max_parallel_threads",
        deserialize_with = "deserialize_thread_count"
    )]
    pub max_parallel_threads: i32,
    #[serde(alias = "parallel_algorithm")]
    pub parallel_algorithm: ParallelAlgorithm,
    /// Runs every collection serially.
    /// 串行运行所有集合。
    #[serde(alias = "disable_parallelization")]
    pub disable_parallelization: bool,
    /// Also read as `explicitOption` / `explicit_option`.
    #[serde(alias = "explicitOption", alias = "explicit_option")]
    pub explicit: ExplicitOption,
    /// Stops starting new work after the first failed test.
    /// 第一个测试失败后停止启动新的工作。
    #[serde(alias = "stop_on_fail")]
    pub stop_on_fail: bool,
    /// Delivers messages on the publishing task instead of a dispatch thread.
    /// 在发布任务上直接投递消息，而不是使用分发线程。
    #[serde(alias = "synchronous_message_reporting")]
    pub synchronous_message_reporting: bool,
    /// Bound of the queued message bus.
    /// 队列消息总线的容量上限。
    #[serde(alias = "message_queue_capacity")]
    pub message_queue_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_threads: 0,
            parallel_algorithm: ParallelAlgorithm::default(),
            disable_parallelization: false,
            explicit: ExplicitOption::default(),
            stop_on_fail: false,
            synchronous_message_reporting: false,
            message_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RunnerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RunnerConfig =
            toml::from_str(content).context("Failed to parse runner configuration (TOML)")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: RunnerConfig =
            serde_json::from_str(content).context("Failed to parse runner configuration (JSON)")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
        .with_context(|| format!("Invalid config file at {}", path.display()))
    }

    /// Applies `CONDUCTOR_*` environment variables on top of this configuration.
    pub fn apply_env_overrides(mut self) -> std::result::Result<Self, ConfigError> {
        if let Some(value) = env_var("MAX_PARALLEL_THREADS") {
            self.max_parallel_threads = parse_thread_count(&value)?;
        }
        if let Some(value) = env_var("PARALLEL_ALGORITHM") {
            self.parallel_algorithm = value.parse()?;
        }
        if let Some(value) = env_var("DISABLE_PARALLELIZATION") {
            self.disable_parallelization = parse_flag("DISABLE_PARALLELIZATION", &value)?;
        }
        if let Some(value) = env_var("EXPLICIT") {
            self.explicit = value.parse()?;
        }
        if let Some(value) = env_var("STOP_ON_FAIL") {
            self.stop_on_fail = parse_flag("STOP_ON_FAIL", &value)?;
        }
        if let Some(value) = env_var("SYNCHRONOUS_MESSAGE_REPORTING") {
            self.synchronous_message_reporting =
                parse_flag("SYNCHRONOUS_MESSAGE_REPORTING", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.message_queue_capacity == 0 {
            return Err(ConfigError::MustBePositive("messageQueueCapacity"));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_flag(option: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Ok(true),
        "0" | "false" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            option: option.into(),
            value: value.into(),
            expected: "a boolean",
        }),
    }
}

/// Parses the textual forms of `maxParallelThreads`: `default`, `unlimited`,
/// an integer, or a CPU multiplier such as `2x` or `0.5x`.
pub fn parse_thread_count(value: &str) -> std::result::Result<i32, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        option: "maxParallelThreads".into(),
        value: value.into(),
        expected: "an integer, 'default', 'unlimited' or a multiplier like '2x'",
    };
    let trimmed = value.trim().to_ascii_lowercase();
    match trimmed.as_str() {
        "default" => return Ok(0),
        "unlimited" => return Ok(-1),
        _ => {}
    }
    if let Some(factor) = trimmed.strip_suffix('x') {
        let factor: f64 = factor.parse().map_err(|_| invalid())?;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(invalid());
        }
        let threads = (factor * num_cpus::get() as f64).ceil().max(1.0);
        return Ok(threads.min(i32::MAX as f64) as i32);
    }
    trimmed.parse().map_err(|_| invalid())
}

fn deserialize_thread_count<'de, D>(deserializer: D) -> std::result::Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => i32::try_from(n).map_err(serde::de::Error::custom),
        Raw::Text(text) => parse_thread_count(&text).map_err(serde::de::Error::custom),
    }
}
