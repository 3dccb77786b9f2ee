mod defaults;
mod load;
mod paths;
mod types;
mod validate;
mod write;

pub use load::load;
pub use paths::{global_config_path, project_config_path, resolve_socket_path};
pub use types::{
  AgentConfig, AgingConfig, CloneConfig, Config, ConfigError, LeaseConfig, LogLevel, RateConfig,
  Result,
};
pub use write::write_default_project_config;
