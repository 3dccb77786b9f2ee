use std::collections::BTreeMap;

use super::types::AgentConfig;

pub(crate) fn builtin_agents() -> BTreeMap<String, AgentConfig> {
  let mut agents = BTreeMap::new();
  agents.insert(
    "fake".to_string(),
    AgentConfig {
      display_name: Some("Shell".to_string()),
      start: vec!["sh".to_string()],
    },
  );
  agents
}
