use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single recorded change to an agent's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMutation {
  pub seq: u64,
  pub key: String,
  pub value: serde_json::Value,
  pub at: DateTime<Utc>,
}

/// A set of key/value changes agreed in a discussion, applied to a parent
/// context in one critical section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContextDelta {
  pub entries: BTreeMap<String, serde_json::Value>,
}

impl ContextDelta {
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// The mutable per-agent state snapshots are taken of: a key/value map plus
/// the ordered mutation log accumulated since the last full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentContext {
  pub entries: BTreeMap<String, serde_json::Value>,
  /// Mutations since the last full snapshot, in application order.
  pub mutation_log: Vec<ContextMutation>,
  /// Total mutations ever applied; monotonic.
  pub mutation_seq: u64,
}

impl AgentContext {
  pub fn new() -> Self {
    Self::default()
  }

  /// Apply one key/value mutation, recording it in the log.
  pub fn apply(&mut self, key: impl Into<String>, value: serde_json::Value, now: DateTime<Utc>) {
    let key = key.into();
    self.mutation_seq += 1;
    self.mutation_log.push(ContextMutation {
      seq: self.mutation_seq,
      key: key.clone(),
      value: value.clone(),
      at: now,
    });
    self.entries.insert(key, value);
  }

  /// Apply an agreed delta as one batch. Each entry is logged like a normal
  /// mutation so differential snapshots stay coherent.
  pub fn apply_delta(&mut self, delta: &ContextDelta, now: DateTime<Utc>) {
    for (key, value) in &delta.entries {
      self.apply(key.clone(), value.clone(), now);
    }
  }

  /// Number of mutations accumulated since the last full snapshot.
  pub fn mutations_since_full(&self) -> usize {
    self.mutation_log.len()
  }

  /// Called after a full snapshot was taken: the log restarts from here.
  pub fn note_full_snapshot(&mut self) {
    self.mutation_log.clear();
  }
}
