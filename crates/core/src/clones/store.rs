use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::context::{AgentContext, ContextDelta};
use crate::domain::message::AgentId;

/// Shared per-agent context table. The only mutation paths are single
/// key/value applications and whole-delta merges, each one short critical
/// section; reads hand out clones so serialization happens with no lock
/// held.
#[derive(Default)]
pub struct ContextStore {
  inner: RwLock<HashMap<AgentId, AgentContext>>,
}

impl ContextStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy an agent's context under a brief read lock. Missing agents get an
  /// empty context.
  pub fn snapshot_of(&self, agent: &AgentId) -> AgentContext {
    self.inner.read().get(agent).cloned().unwrap_or_default()
  }

  pub fn mutations_since_full(&self, agent: &AgentId) -> usize {
    self
      .inner
      .read()
      .get(agent)
      .map(AgentContext::mutations_since_full)
      .unwrap_or(0)
  }

  pub fn apply(&self, agent: &AgentId, key: &str, value: serde_json::Value, now: DateTime<Utc>) {
    let mut inner = self.inner.write();
    inner.entry(agent.clone()).or_default().apply(key, value, now);
  }

  /// Apply an agreed delta in one atomic critical section for this parent.
  pub fn apply_delta(&self, agent: &AgentId, delta: &ContextDelta, now: DateTime<Utc>) {
    let mut inner = self.inner.write();
    inner.entry(agent.clone()).or_default().apply_delta(delta, now);
  }

  /// Restart the mutation log after a full snapshot was taken.
  pub fn note_full_snapshot(&self, agent: &AgentId) {
    let mut inner = self.inner.write();
    if let Some(ctx) = inner.get_mut(agent) {
      ctx.note_full_snapshot();
    }
  }

  pub fn forget(&self, agent: &AgentId) {
    self.inner.write().remove(agent);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn snapshots_are_copies_not_views() {
    let store = ContextStore::new();
    let a = AgentId::from("a1");
    let now = Utc::now();
    store.apply(&a, "k", json!(1), now);
    let copy = store.snapshot_of(&a);
    store.apply(&a, "k", json!(2), now);
    assert_eq!(copy.entries.get("k"), Some(&json!(1)));
    assert_eq!(store.snapshot_of(&a).entries.get("k"), Some(&json!(2)));
  }

  #[test]
  fn delta_merge_is_visible_atomically() {
    let store = ContextStore::new();
    let a = AgentId::from("a1");
    let now = Utc::now();
    let mut delta = ContextDelta::default();
    delta.entries.insert("x".into(), json!("agreed"));
    delta.entries.insert("y".into(), json!(2));
    store.apply_delta(&a, &delta, now);
    let ctx = store.snapshot_of(&a);
    assert_eq!(ctx.entries.len(), 2);
    assert_eq!(ctx.mutations_since_full(), 2);
  }
}
