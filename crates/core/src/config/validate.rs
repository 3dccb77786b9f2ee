use super::types::{Config, ConfigError, Result};

/// Reject configurations the core cannot run with. Called after merging.
pub(crate) fn validate(cfg: &Config) -> Result<()> {
  for (name, agent_cfg) in &cfg.agents {
    if agent_cfg.start.is_empty() {
      return Err(ConfigError::InvalidAgentDefinition {
        agent: name.to_string(),
      });
    }
  }

  if cfg.rate.capacity <= 0.0 {
    return Err(invalid("rate.capacity", "must be positive"));
  }
  if cfg.rate.refill_per_sec <= 0.0 {
    return Err(invalid("rate.refill_per_sec", "must be positive"));
  }
  if cfg.aging.first_threshold_secs == 0 {
    return Err(invalid("aging.first_threshold_secs", "must be nonzero"));
  }
  if cfg.aging.second_threshold_secs == 0 {
    return Err(invalid("aging.second_threshold_secs", "must be nonzero"));
  }
  if !(0.0..=1.0).contains(&cfg.lease.progress_defer) {
    return Err(invalid("lease.progress_defer", "must be within [0.0, 1.0]"));
  }
  if cfg.lease.default_duration_secs == 0 {
    return Err(invalid("lease.default_duration_secs", "must be nonzero"));
  }
  if cfg.clones.pool_low_water > cfg.clones.pool_target {
    return Err(invalid(
      "clones.pool_low_water",
      "must not exceed clones.pool_target",
    ));
  }
  if cfg.clones.command.is_empty() {
    return Err(invalid("clones.command", "must name a program"));
  }
  if cfg.clones.discussion_timeout_secs == 0 {
    return Err(invalid("clones.discussion_timeout_secs", "must be nonzero"));
  }

  Ok(())
}

fn invalid(option: &'static str, reason: &str) -> ConfigError {
  ConfigError::InvalidOption {
    option,
    reason: reason.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_validates() {
    validate(&Config::default()).unwrap();
  }

  #[test]
  fn low_water_above_target_is_rejected() {
    let mut cfg = Config::default();
    cfg.clones.pool_low_water = cfg.clones.pool_target + 1;
    assert!(validate(&cfg).is_err());
  }

  #[test]
  fn progress_defer_out_of_range_is_rejected() {
    let mut cfg = Config::default();
    cfg.lease.progress_defer = 1.5;
    assert!(validate(&cfg).is_err());
  }
}
