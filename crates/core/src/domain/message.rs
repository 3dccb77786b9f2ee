use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an agent process known to the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for AgentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for AgentId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for MessageId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for MessageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Priority tiers, lowest to highest. Derived `Ord` follows declaration order.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  #[default]
  Info,
  Coordinate,
  Blocking,
  Critical,
  DirectorOverride,
}

impl Priority {
  pub const COUNT: usize = 5;

  /// All tiers in ascending order.
  pub const ALL: [Priority; Priority::COUNT] = [
    Priority::Info,
    Priority::Coordinate,
    Priority::Blocking,
    Priority::Critical,
    Priority::DirectorOverride,
  ];

  /// Queue index for this tier (0 = Info).
  pub fn index(self) -> usize {
    match self {
      Priority::Info => 0,
      Priority::Coordinate => 1,
      Priority::Blocking => 2,
      Priority::Critical => 3,
      Priority::DirectorOverride => 4,
    }
  }

  /// The next tier up, saturating at Critical. Aging never produces
  /// DirectorOverride.
  pub fn promoted(self) -> Priority {
    match self {
      Priority::Info => Priority::Coordinate,
      Priority::Coordinate => Priority::Blocking,
      Priority::Blocking => Priority::Critical,
      Priority::Critical | Priority::DirectorOverride => self,
    }
  }

  /// Whether delivery at this tier waits for a natural pause point.
  pub fn is_gated(self) -> bool {
    matches!(self, Priority::Info | Priority::Coordinate)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Priority::Info => "info",
      Priority::Coordinate => "coordinate",
      Priority::Blocking => "blocking",
      Priority::Critical => "critical",
      Priority::DirectorOverride => "director_override",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Role of the submitting party, as established by the adapter or the daemon
/// surface. Determines which tiers a sender may author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
  Agent,
  Clone,
  Director,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
  Agent(AgentId),
  Broadcast,
}

#[derive(Debug, Error)]
pub enum MessageError {
  #[error("sender `{sender}` may not author director_override messages")]
  DirectorOverrideForbidden { sender: AgentId },
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// A routable message. Created on submission, mutated only by the router
/// (aging promotion), destroyed on delivery or drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: MessageId,
  pub sender: AgentId,
  pub sender_role: SenderRole,
  pub recipient: Recipient,
  pub priority: Priority,
  pub body: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub payload: Option<serde_json::Value>,
  pub created_at: DateTime<Utc>,
  pub queued_at: DateTime<Utc>,
  /// Number of aging promotions applied so far.
  pub boosts: u8,
}

impl Message {
  /// Build a message at submission time, enforcing role-based tier rules:
  /// only the director authors DirectorOverride; clone senders are clamped
  /// to Coordinate (clamping is silent but logged by the caller).
  pub fn submit(
    sender: AgentId,
    sender_role: SenderRole,
    recipient: Recipient,
    requested: Priority,
    body: String,
    payload: Option<serde_json::Value>,
    now: DateTime<Utc>,
  ) -> Result<(Self, bool)> {
    if requested == Priority::DirectorOverride && sender_role != SenderRole::Director {
      return Err(MessageError::DirectorOverrideForbidden { sender });
    }
    let mut priority = requested;
    let mut clamped = false;
    if sender_role == SenderRole::Clone && priority > Priority::Coordinate {
      priority = Priority::Coordinate;
      clamped = true;
    }
    Ok((
      Message {
        id: MessageId::new(),
        sender,
        sender_role,
        recipient,
        priority,
        body,
        payload,
        created_at: now,
        queued_at: now,
        boosts: 0,
      },
      clamped,
    ))
  }

  /// Apply one aging promotion. Returns the new tier if the message moved.
  pub fn promote(&mut self) -> Option<Priority> {
    let next = self.priority.promoted();
    if next == self.priority {
      return None;
    }
    self.priority = next;
    self.boosts += 1;
    Some(next)
  }

  /// Seconds this message has been waiting since it was first enqueued.
  pub fn waited_secs(&self, now: DateTime<Utc>) -> i64 {
    (now - self.queued_at).num_seconds()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn msg(role: SenderRole, requested: Priority) -> Result<(Message, bool)> {
    Message::submit(
      AgentId::from("a1"),
      role,
      Recipient::Agent(AgentId::from("a2")),
      requested,
      "hello".into(),
      None,
      Utc::now(),
    )
  }

  #[test]
  fn only_director_authors_override() {
    let err = msg(SenderRole::Agent, Priority::DirectorOverride).unwrap_err();
    match err {
      MessageError::DirectorOverrideForbidden { sender } => assert_eq!(sender.as_str(), "a1"),
    }
    let (m, clamped) = msg(SenderRole::Director, Priority::DirectorOverride).unwrap();
    assert_eq!(m.priority, Priority::DirectorOverride);
    assert!(!clamped);
  }

  #[test]
  fn clone_senders_are_clamped_to_coordinate() {
    let (m, clamped) = msg(SenderRole::Clone, Priority::Critical).unwrap();
    assert_eq!(m.priority, Priority::Coordinate);
    assert!(clamped);
    let (m, clamped) = msg(SenderRole::Clone, Priority::Info).unwrap();
    assert_eq!(m.priority, Priority::Info);
    assert!(!clamped);
  }

  #[test]
  fn promotion_saturates_at_critical() {
    let (mut m, _) = msg(SenderRole::Agent, Priority::Info).unwrap();
    assert_eq!(m.promote(), Some(Priority::Coordinate));
    assert_eq!(m.promote(), Some(Priority::Blocking));
    assert_eq!(m.promote(), Some(Priority::Critical));
    assert_eq!(m.promote(), None);
    assert_eq!(m.priority, Priority::Critical);
    assert_eq!(m.boosts, 3);
  }

  #[test]
  fn tier_order_is_ascending() {
    let mut prev = None;
    for p in Priority::ALL {
      if let Some(q) = prev {
        assert!(p > q);
      }
      prev = Some(p);
    }
    assert!(Priority::DirectorOverride > Priority::Critical);
  }
}
