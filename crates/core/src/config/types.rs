use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::defaults::builtin_agents;

/// Log level for the daemon surface and core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Off,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

/// Configuration for launching an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  pub start: Vec<String>,
}

/// Admission control: bucket capacity and refill rate per sender, token cost
/// per tier. DirectorOverride always costs zero and is never consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
  pub capacity: f64,
  pub refill_per_sec: f64,
  pub cost_info: u32,
  pub cost_coordinate: u32,
  pub cost_blocking: u32,
  pub cost_critical: u32,
}

impl Default for RateConfig {
  fn default() -> Self {
    Self {
      capacity: 200.0,
      refill_per_sec: 2.0,
      cost_info: 1,
      cost_coordinate: 5,
      cost_blocking: 20,
      cost_critical: 100,
    }
  }
}

/// Aging promotion thresholds. A queued message waiting past
/// `first_threshold_secs` promotes one tier; past `first + second` it
/// promotes again, capped at Critical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingConfig {
  pub first_threshold_secs: u64,
  pub second_threshold_secs: u64,
}

impl Default for AgingConfig {
  fn default() -> Self {
    Self {
      first_threshold_secs: 60,
      second_threshold_secs: 300,
    }
  }
}

/// Territory arbitration thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
  /// Holder remaining-time below which a contender is deferred.
  pub defer_threshold_secs: u64,
  /// Added to the holder's remaining time when computing a deferral.
  pub defer_grace_secs: u64,
  /// Holder progress fraction above which a contender is deferred.
  pub progress_defer: f64,
  /// Requester-minus-holder priority delta at which the holder is revoked.
  pub override_priority_delta: u8,
  /// Pending-queue depth at which a request escalates instead of queueing.
  pub escalation_queue_depth: usize,
  /// Applied when a request names no duration.
  pub default_duration_secs: u64,
}

impl Default for LeaseConfig {
  fn default() -> Self {
    Self {
      defer_threshold_secs: 30,
      defer_grace_secs: 10,
      progress_defer: 0.8,
      override_priority_delta: 2,
      escalation_queue_depth: 2,
      default_duration_secs: 120,
    }
  }
}

/// Clone pool and discussion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneConfig {
  /// Pre-warmed pool size the replenisher aims for.
  pub pool_target: usize,
  /// Replenishment kicks in once the idle count drops below this.
  pub pool_low_water: usize,
  pub spawn_timeout_secs: u64,
  /// Mutation count at which the next snapshot is full, not differential.
  pub snapshot_diff_threshold: usize,
  pub discussion_timeout_secs: u64,
  /// Command used to start a pooled clone process.
  pub command: Vec<String>,
}

impl Default for CloneConfig {
  fn default() -> Self {
    Self {
      pool_target: 4,
      pool_low_water: 2,
      spawn_timeout_secs: 10,
      snapshot_diff_threshold: 100,
      discussion_timeout_secs: 120,
      command: vec!["sh".to_string()],
    }
  }
}

/// Effective configuration after merging defaults, global, and project config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
  pub log_level: LogLevel,
  pub rate: RateConfig,
  pub aging: AgingConfig,
  pub lease: LeaseConfig,
  pub clones: CloneConfig,
  /// Agent command definitions resolved when spawning agent processes.
  pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      log_level: LogLevel::Info,
      rate: RateConfig::default(),
      aging: AgingConfig::default(),
      lease: LeaseConfig::default(),
      clones: CloneConfig::default(),
      agents: builtin_agents(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("toml: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("unsupported platform: no runtime or data directory")]
  UnsupportedPlatform,
  #[error("agent `{agent}` must have at least one start command")]
  InvalidAgentDefinition { agent: String },
  #[error("invalid value for `{option}`: {reason}")]
  InvalidOption { option: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
