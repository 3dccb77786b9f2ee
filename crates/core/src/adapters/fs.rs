use std::fs;
use std::path::{Path, PathBuf};

/// Return path to the `.conclave` folder inside the given project root
pub fn conclave_dir(project_root: &Path) -> PathBuf {
  project_root.join(".conclave")
}

/// Standard subpaths under `.conclave`
pub fn logs_path(project_root: &Path) -> PathBuf {
  conclave_dir(project_root).join("logs.jsonl")
}

pub fn ledger_path(project_root: &Path) -> PathBuf {
  conclave_dir(project_root).join("ledger.jsonl")
}

/// Ensure the `.conclave` layout exists (directories are created if missing)
pub fn ensure_layout(project_root: &Path) -> std::io::Result<()> {
  fs::create_dir_all(conclave_dir(project_root))?;
  Ok(())
}
