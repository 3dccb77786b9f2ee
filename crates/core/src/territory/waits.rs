use std::collections::{HashMap, HashSet};

use crate::domain::lease::Lease;
use crate::domain::message::AgentId;

/// Directed wait-for graph over agents: an edge `a -> b` means `a` is queued
/// on a resource `b` holds. Recomputed per conflict from the live lease
/// table; cheap at the scale of one machine's agents.
#[derive(Debug, Default)]
pub struct WaitForGraph {
  edges: HashMap<AgentId, HashSet<AgentId>>,
}

impl WaitForGraph {
  pub fn from_leases<'a>(leases: impl Iterator<Item = &'a Lease>) -> Self {
    let mut graph = Self::default();
    for lease in leases {
      if let Some(holder) = &lease.holder {
        for pending in &lease.pending {
          graph.add_wait(pending.agent.clone(), holder.clone());
        }
      }
    }
    graph
  }

  pub fn add_wait(&mut self, waiter: AgentId, holder: AgentId) {
    self.edges.entry(waiter).or_default().insert(holder);
  }

  /// Would adding `requester -> holder` close a cycle? True exactly when the
  /// holder already (transitively) waits on the requester.
  pub fn would_deadlock(&self, requester: &AgentId, holder: &AgentId) -> bool {
    if requester == holder {
      return true;
    }
    self.has_path(holder, requester)
  }

  /// DFS reachability.
  fn has_path(&self, from: &AgentId, to: &AgentId) -> bool {
    let mut stack = vec![from];
    let mut seen: HashSet<&AgentId> = HashSet::new();
    while let Some(node) = stack.pop() {
      if node == to {
        return true;
      }
      if !seen.insert(node) {
        continue;
      }
      if let Some(next) = self.edges.get(node) {
        stack.extend(next.iter());
      }
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::lease::{PendingRequest, ResourceKey};
  use crate::domain::message::Priority;
  use chrono::{Duration, Utc};

  fn lease_with(holder: &str, waiters: &[&str]) -> Lease {
    let now = Utc::now();
    let mut lease = Lease::new(ResourceKey::new(format!("r/{}", holder)));
    lease
      .grant(AgentId::from(holder), Priority::Coordinate, Duration::seconds(60), now)
      .unwrap();
    for w in waiters {
      lease.pending.push_back(PendingRequest {
        agent: AgentId::from(*w),
        priority: Priority::Coordinate,
        duration_secs: 60,
        requested_at: now,
      });
    }
    lease
  }

  #[test]
  fn two_party_cycle_is_detected() {
    // b waits on a's resource; a asking for b's resource closes the loop.
    let leases = vec![lease_with("a", &["b"]), lease_with("b", &[])];
    let graph = WaitForGraph::from_leases(leases.iter());
    assert!(graph.would_deadlock(&AgentId::from("a"), &AgentId::from("b")));
    assert!(!graph.would_deadlock(&AgentId::from("c"), &AgentId::from("b")));
  }

  #[test]
  fn transitive_cycle_is_detected() {
    // c waits on b, b waits on a; a asking from c completes a three-hop loop.
    let leases = vec![lease_with("a", &["b"]), lease_with("b", &["c"])];
    let graph = WaitForGraph::from_leases(leases.iter());
    assert!(graph.would_deadlock(&AgentId::from("a"), &AgentId::from("c")));
  }

  #[test]
  fn self_wait_counts_as_deadlock() {
    let graph = WaitForGraph::default();
    assert!(graph.would_deadlock(&AgentId::from("a"), &AgentId::from("a")));
  }
}
