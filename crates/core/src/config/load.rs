use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::paths::{global_config_path, project_config_path};
use super::types::{
  AgentConfig, AgingConfig, CloneConfig, Config, LeaseConfig, LogLevel, RateConfig, Result,
};
use super::validate::validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct PartialRateConfig {
  pub capacity: Option<f64>,
  pub refill_per_sec: Option<f64>,
  pub cost_info: Option<u32>,
  pub cost_coordinate: Option<u32>,
  pub cost_blocking: Option<u32>,
  pub cost_critical: Option<u32>,
}

impl PartialRateConfig {
  fn merge_over(self, base: RateConfig) -> RateConfig {
    RateConfig {
      capacity: self.capacity.unwrap_or(base.capacity),
      refill_per_sec: self.refill_per_sec.unwrap_or(base.refill_per_sec),
      cost_info: self.cost_info.unwrap_or(base.cost_info),
      cost_coordinate: self.cost_coordinate.unwrap_or(base.cost_coordinate),
      cost_blocking: self.cost_blocking.unwrap_or(base.cost_blocking),
      cost_critical: self.cost_critical.unwrap_or(base.cost_critical),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct PartialAgingConfig {
  pub first_threshold_secs: Option<u64>,
  pub second_threshold_secs: Option<u64>,
}

impl PartialAgingConfig {
  fn merge_over(self, base: AgingConfig) -> AgingConfig {
    AgingConfig {
      first_threshold_secs: self.first_threshold_secs.unwrap_or(base.first_threshold_secs),
      second_threshold_secs: self
        .second_threshold_secs
        .unwrap_or(base.second_threshold_secs),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct PartialLeaseConfig {
  pub defer_threshold_secs: Option<u64>,
  pub defer_grace_secs: Option<u64>,
  pub progress_defer: Option<f64>,
  pub override_priority_delta: Option<u8>,
  pub escalation_queue_depth: Option<usize>,
  pub default_duration_secs: Option<u64>,
}

impl PartialLeaseConfig {
  fn merge_over(self, base: LeaseConfig) -> LeaseConfig {
    LeaseConfig {
      defer_threshold_secs: self.defer_threshold_secs.unwrap_or(base.defer_threshold_secs),
      defer_grace_secs: self.defer_grace_secs.unwrap_or(base.defer_grace_secs),
      progress_defer: self.progress_defer.unwrap_or(base.progress_defer),
      override_priority_delta: self
        .override_priority_delta
        .unwrap_or(base.override_priority_delta),
      escalation_queue_depth: self
        .escalation_queue_depth
        .unwrap_or(base.escalation_queue_depth),
      default_duration_secs: self
        .default_duration_secs
        .unwrap_or(base.default_duration_secs),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct PartialCloneConfig {
  pub pool_target: Option<usize>,
  pub pool_low_water: Option<usize>,
  pub spawn_timeout_secs: Option<u64>,
  pub snapshot_diff_threshold: Option<usize>,
  pub discussion_timeout_secs: Option<u64>,
  pub command: Option<Vec<String>>,
}

impl PartialCloneConfig {
  fn merge_over(self, base: CloneConfig) -> CloneConfig {
    CloneConfig {
      pool_target: self.pool_target.unwrap_or(base.pool_target),
      pool_low_water: self.pool_low_water.unwrap_or(base.pool_low_water),
      spawn_timeout_secs: self.spawn_timeout_secs.unwrap_or(base.spawn_timeout_secs),
      snapshot_diff_threshold: self
        .snapshot_diff_threshold
        .unwrap_or(base.snapshot_diff_threshold),
      discussion_timeout_secs: self
        .discussion_timeout_secs
        .unwrap_or(base.discussion_timeout_secs),
      command: self.command.unwrap_or(base.command),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct PartialConfig {
  pub log_level: Option<LogLevel>,
  pub rate: Option<PartialRateConfig>,
  pub aging: Option<PartialAgingConfig>,
  pub lease: Option<PartialLeaseConfig>,
  pub clones: Option<PartialCloneConfig>,
  pub agents: Option<BTreeMap<String, AgentConfig>>,
}

impl PartialConfig {
  fn merge_over(self, base: Config) -> Config {
    let PartialConfig {
      log_level,
      rate,
      aging,
      lease,
      clones,
      agents,
    } = self;

    let Config {
      log_level: base_log_level,
      rate: base_rate,
      aging: base_aging,
      lease: base_lease,
      clones: base_clones,
      agents: base_agents,
    } = base;

    let mut merged_agents = base_agents;
    if let Some(overrides) = agents {
      for (name, cfg) in overrides {
        merged_agents.insert(name, cfg);
      }
    }

    Config {
      log_level: log_level.unwrap_or(base_log_level),
      rate: rate.unwrap_or_default().merge_over(base_rate),
      aging: aging.unwrap_or_default().merge_over(base_aging),
      lease: lease.unwrap_or_default().merge_over(base_lease),
      clones: clones.unwrap_or_default().merge_over(base_clones),
      agents: merged_agents,
    }
  }
}

/// Load configuration by resolving the default global and project paths.
/// Project config overrides global; both override defaults.
pub fn load(project_root: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();

  // Global
  if let Some(global_path) = global_config_path()
    && let Ok(s) = fs::read_to_string(&global_path)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  // Project
  if let Some(root) = project_root {
    let project_path = project_config_path(root);
    if let Ok(s) = fs::read_to_string(&project_path) {
      let partial: PartialConfig = toml::from_str(&s)?;
      cfg = partial.merge_over(cfg);
    }
  }

  validate(&cfg)?;

  Ok(cfg)
}

/// Test helper: load configuration from explicit file paths (if present).
#[cfg(test)]
pub(crate) fn load_from_paths(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();

  if let Some(g) = global
    && let Ok(s) = fs::read_to_string(g)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  if let Some(p) = project
    && let Ok(s) = fs::read_to_string(p)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  validate(&cfg)?;

  Ok(cfg)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::types::ConfigError;
  use std::fs;

  #[test]
  fn defaults_are_correct() {
    let cfg = Config::default();
    assert_eq!(cfg.log_level, LogLevel::Info);
    assert_eq!(cfg.rate.cost_info, 1);
    assert_eq!(cfg.rate.cost_coordinate, 5);
    assert_eq!(cfg.rate.cost_blocking, 20);
    assert_eq!(cfg.rate.cost_critical, 100);
    assert_eq!(cfg.aging.first_threshold_secs, 60);
    assert_eq!(cfg.aging.second_threshold_secs, 300);
    assert_eq!(cfg.lease.defer_threshold_secs, 30);
    assert!((cfg.lease.progress_defer - 0.8).abs() < f64::EPSILON);
    assert_eq!(cfg.lease.escalation_queue_depth, 2);
    assert_eq!(cfg.clones.snapshot_diff_threshold, 100);
    let fake = cfg.agents.get("fake").expect("fake agent");
    assert_eq!(fake.start, vec!["sh".to_string()]);
  }

  #[test]
  fn merge_precedence_project_overrides_global_over_defaults() {
    let td = tempfile::tempdir().unwrap();
    let global = td.path().join("global.toml");
    let project = td.path().join("project.toml");

    fs::write(
      &global,
      r#"
log_level = "warn"

[rate]
refill_per_sec = 5.0

[lease]
defer_threshold_secs = 45
"#,
    )
    .unwrap();

    fs::write(
      &project,
      r#"
log_level = "debug"

[aging]
first_threshold_secs = 10

[lease]
escalation_queue_depth = 4

[clones]
pool_target = 8
"#,
    )
    .unwrap();

    let cfg = load_from_paths(Some(&global), Some(&project)).unwrap();
    // project overrides global
    assert_eq!(cfg.log_level, LogLevel::Debug);
    // global overrides default
    assert!((cfg.rate.refill_per_sec - 5.0).abs() < f64::EPSILON);
    assert_eq!(cfg.lease.defer_threshold_secs, 45);
    // project adds values
    assert_eq!(cfg.aging.first_threshold_secs, 10);
    assert_eq!(cfg.lease.escalation_queue_depth, 4);
    assert_eq!(cfg.clones.pool_target, 8);
    // untouched values keep defaults
    assert_eq!(cfg.rate.cost_critical, 100);
    assert_eq!(cfg.clones.pool_low_water, 2);
  }

  #[test]
  fn empty_start_list_is_invalid() {
    let td = tempfile::tempdir().unwrap();
    let project = td.path().join("project.toml");

    fs::write(
      &project,
      r#"
[agents.fake]
start = []
"#,
    )
    .unwrap();

    let err = load_from_paths(None, Some(&project)).unwrap_err();
    match err {
      ConfigError::InvalidAgentDefinition { agent } => assert_eq!(agent, "fake"),
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[test]
  fn nonsense_thresholds_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let project = td.path().join("project.toml");

    fs::write(
      &project,
      r#"
[rate]
refill_per_sec = 0.0
"#,
    )
    .unwrap();

    let err = load_from_paths(None, Some(&project)).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidOption { .. }));
  }
}
