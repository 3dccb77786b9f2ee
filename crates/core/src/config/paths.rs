use std::env;
use std::path::{Path, PathBuf};

use dirs::data_dir;
use dirs::runtime_dir;

use super::types::{ConfigError, Result};

/// Location of the global config file (~/.config/conclave/config.toml)
pub fn global_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|p| p.join("conclave").join("config.toml"))
}

/// Location of the project config file (./.conclave/config.toml)
pub fn project_config_path(project_root: &Path) -> PathBuf {
  project_root.join(".conclave").join("config.toml")
}

/// Resolve the socket path using CONCLAVE_SOCKET or platform defaults.
pub fn resolve_socket_path() -> Result<PathBuf> {
  let env_socket = env::var("CONCLAVE_SOCKET").ok().map(PathBuf::from);
  // Prefer runtime_dir for ephemeral sockets; fall back to data_dir
  let base_dir = runtime_dir().or(data_dir());
  if let Some(val) = env_socket {
    return Ok(val);
  }
  if let Some(dir) = base_dir {
    return Ok(dir.join("conclave.sock"));
  }
  Err(ConfigError::UnsupportedPlatform)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn socket_env_overrides() {
    let td = tempfile::tempdir().unwrap();
    let p = td.path().join("sock");
    unsafe { std::env::set_var("CONCLAVE_SOCKET", &p) };
    let got = resolve_socket_path().unwrap();
    assert_eq!(got, p);
    unsafe { std::env::remove_var("CONCLAVE_SOCKET") };
  }
}
