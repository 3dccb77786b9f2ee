use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::message::{AgentId, Priority};

macro_rules! uuid_id {
  ($(#[$doc:meta])* $name:ident) => {
    $(#[$doc])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct $name(pub Uuid);

    impl $name {
      pub fn new() -> Self {
        Self(Uuid::new_v4())
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::new()
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

uuid_id!(
  /// Identifier of a clone delegate session.
  CloneId
);
uuid_id!(
  /// Identifier of a paired negotiation discussion.
  DiscussionId
);
uuid_id!(
  /// Identifier of a context snapshot.
  SnapshotId
);
uuid_id!(
  /// Identifier of an escalation awaiting a director verdict.
  EscalationId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
  Full,
  Differential,
}

/// A short-lived delegate session seeded from a parent's context snapshot.
///
/// Owned by the orchestrator's session table and referenced only by id.
/// Destroyed on merge, timeout, or explicit parent termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneSession {
  pub id: CloneId,
  pub parent: AgentId,
  /// Free-form purpose tag, e.g. `lease-negotiation`.
  pub purpose: String,
  pub snapshot: SnapshotId,
  pub snapshot_kind: SnapshotKind,
  pub spawned_at: DateTime<Utc>,
  /// Clones never author above this tier.
  pub priority_cap: Priority,
  pub deadline: DateTime<Utc>,
}

impl CloneSession {
  pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
    now >= self.deadline
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn deadline_expiry() {
    let now = Utc::now();
    let s = CloneSession {
      id: CloneId::new(),
      parent: AgentId::from("a1"),
      purpose: "lease-negotiation".into(),
      snapshot: SnapshotId::new(),
      snapshot_kind: SnapshotKind::Full,
      spawned_at: now,
      priority_cap: Priority::Coordinate,
      deadline: now + Duration::seconds(30),
    };
    assert!(!s.is_overdue(now));
    assert!(s.is_overdue(now + Duration::seconds(30)));
  }
}
