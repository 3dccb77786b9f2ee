use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::config::AgingConfig;
use crate::domain::message::{Message, MessageId, Priority};

/// Five FIFO sub-queues, one per tier. Within a tier, order is always by
/// original enqueue time — promotion inserts at the sorted position rather
/// than the back, so an aged message never loses its place to younger ones.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueSet {
  tiers: [VecDeque<Message>; Priority::COUNT],
}

impl QueueSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, message: Message) {
    let idx = message.priority.index();
    insert_by_enqueue_time(&mut self.tiers[idx], message);
  }

  pub fn len(&self) -> usize {
    self.tiers.iter().map(VecDeque::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.tiers.iter().all(VecDeque::is_empty)
  }

  pub fn tier_len(&self, priority: Priority) -> usize {
    self.tiers[priority.index()].len()
  }

  pub fn iter_tier(&self, priority: Priority) -> impl Iterator<Item = &Message> {
    self.tiers[priority.index()].iter()
  }

  /// Drain every DirectorOverride message, oldest first.
  pub fn drain_director(&mut self) -> Vec<Message> {
    self.tiers[Priority::DirectorOverride.index()]
      .drain(..)
      .collect()
  }

  /// Remove a message by id, wherever it sits.
  pub fn remove(&mut self, id: MessageId) -> Option<Message> {
    for tier in &mut self.tiers {
      if let Some(pos) = tier.iter().position(|m| m.id == id) {
        return tier.remove(pos);
      }
    }
    None
  }

  pub fn get(&self, id: MessageId) -> Option<&Message> {
    self.tiers.iter().flat_map(|t| t.iter()).find(|m| m.id == id)
  }

  /// Move a message to the given tier preserving enqueue-time order. Used
  /// by ledger replay; live promotion goes through [`QueueSet::age`].
  pub fn reprioritize(&mut self, id: MessageId, to: Priority) {
    if let Some(mut msg) = self.remove(id) {
      while msg.priority < to {
        if msg.promote().is_none() {
          break;
        }
      }
      self.push(msg);
    }
  }

  /// Aging pass: a message waiting past the first threshold is one tier up,
  /// past first + second it is two, capped at Critical. Returns every move
  /// made so the caller can record them.
  pub fn age(&mut self, cfg: &AgingConfig, now: DateTime<Utc>) -> Vec<(MessageId, Priority)> {
    let mut moved = Vec::new();
    // Only Info..=Blocking can promote; Critical is the aging ceiling.
    for idx in 0..Priority::Critical.index() {
      let mut keep = VecDeque::new();
      while let Some(mut msg) = self.tiers[idx].pop_front() {
        let waited = msg.waited_secs(now);
        let earned = earned_boosts(waited, cfg);
        let mut promoted = false;
        while (msg.boosts as u64) < earned {
          if msg.promote().is_none() {
            break;
          }
          promoted = true;
        }
        if promoted {
          moved.push((msg.id, msg.priority));
          let dest = msg.priority.index();
          insert_by_enqueue_time(&mut self.tiers[dest], msg);
        } else {
          keep.push_back(msg);
        }
      }
      self.tiers[idx] = keep;
    }
    moved
  }

  /// Collect deliverable messages: DirectorOverride drains unconditionally,
  /// then tiers are scanned highest-first in FIFO order, removing each
  /// message the predicate accepts. Rejected messages keep their place.
  pub fn take_deliverable(&mut self, mut accept: impl FnMut(&Message) -> bool) -> Vec<Message> {
    let mut out = self.drain_director();
    for idx in (0..Priority::DirectorOverride.index()).rev() {
      let mut keep = VecDeque::new();
      while let Some(msg) = self.tiers[idx].pop_front() {
        if accept(&msg) {
          out.push(msg);
        } else {
          keep.push_back(msg);
        }
      }
      self.tiers[idx] = keep;
    }
    out
  }
}

fn earned_boosts(waited_secs: i64, cfg: &AgingConfig) -> u64 {
  let waited = waited_secs.max(0) as u64;
  if waited >= cfg.first_threshold_secs + cfg.second_threshold_secs {
    2
  } else if waited >= cfg.first_threshold_secs {
    1
  } else {
    0
  }
}

fn insert_by_enqueue_time(tier: &mut VecDeque<Message>, message: Message) {
  let pos = tier
    .iter()
    .position(|m| m.queued_at > message.queued_at)
    .unwrap_or(tier.len());
  tier.insert(pos, message);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::message::{AgentId, Recipient, SenderRole};
  use chrono::Duration;
  use proptest::prelude::*;

  fn msg_at(priority: Priority, queued_at: DateTime<Utc>) -> Message {
    let (m, _) = Message::submit(
      AgentId::from("s"),
      SenderRole::Agent,
      Recipient::Agent(AgentId::from("r")),
      priority,
      "m".into(),
      None,
      queued_at,
    )
    .unwrap();
    m
  }

  fn cfg() -> AgingConfig {
    AgingConfig {
      first_threshold_secs: 60,
      second_threshold_secs: 300,
    }
  }

  #[test]
  fn director_override_drains_before_everything() {
    let mut q = QueueSet::new();
    let now = Utc::now();
    q.push(msg_at(Priority::Critical, now));
    let (d, _) = Message::submit(
      AgentId::from("director"),
      SenderRole::Director,
      Recipient::Broadcast,
      Priority::DirectorOverride,
      "halt".into(),
      None,
      now,
    )
    .unwrap();
    let d_id = d.id;
    q.push(d);
    let taken = q.take_deliverable(|_| true);
    assert_eq!(taken[0].id, d_id);
    assert_eq!(taken.len(), 2);
  }

  #[test]
  fn aging_promotes_once_then_twice() {
    let mut q = QueueSet::new();
    let start = Utc::now();
    let m = msg_at(Priority::Info, start);
    let id = m.id;
    q.push(m);

    assert!(q.age(&cfg(), start + Duration::seconds(59)).is_empty());

    let moved = q.age(&cfg(), start + Duration::seconds(61));
    assert_eq!(moved, vec![(id, Priority::Coordinate)]);
    assert_eq!(q.tier_len(Priority::Coordinate), 1);

    let moved = q.age(&cfg(), start + Duration::seconds(361));
    assert_eq!(moved, vec![(id, Priority::Blocking)]);
    assert_eq!(q.tier_len(Priority::Blocking), 1);

    // No third aging promotion.
    assert!(q.age(&cfg(), start + Duration::seconds(10_000)).is_empty());
  }

  #[test]
  fn aging_jumps_two_tiers_in_one_pass_when_overdue() {
    let mut q = QueueSet::new();
    let start = Utc::now();
    let m = msg_at(Priority::Coordinate, start);
    let id = m.id;
    q.push(m);
    let moved = q.age(&cfg(), start + Duration::seconds(400));
    assert_eq!(moved, vec![(id, Priority::Critical)]);
    assert_eq!(q.tier_len(Priority::Critical), 1);
  }

  #[test]
  fn promotion_preserves_fifo_by_enqueue_time() {
    let mut q = QueueSet::new();
    let start = Utc::now();
    // An old Info message and a younger Coordinate message.
    let old = msg_at(Priority::Info, start);
    let old_id = old.id;
    let young = msg_at(Priority::Coordinate, start + Duration::seconds(30));
    let young_id = young.id;
    q.push(young);
    q.push(old);
    // The Info message ages into Coordinate and must sort ahead of the
    // younger native Coordinate message.
    q.age(&cfg(), start + Duration::seconds(61));
    let order: Vec<MessageId> = q.iter_tier(Priority::Coordinate).map(|m| m.id).collect();
    assert_eq!(order, vec![old_id, young_id]);
  }

  #[test]
  fn rejected_messages_keep_their_place() {
    let mut q = QueueSet::new();
    let now = Utc::now();
    let a = msg_at(Priority::Info, now);
    let b = msg_at(Priority::Info, now + Duration::seconds(1));
    let (a_id, b_id) = (a.id, b.id);
    q.push(a);
    q.push(b);
    let taken = q.take_deliverable(|m| m.id == b_id);
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].id, b_id);
    assert_eq!(q.len(), 1);
    assert!(q.get(a_id).is_some());
  }

  proptest! {
    /// Priority never decreases over any aging schedule.
    #[test]
    fn aging_is_monotonic(waits in proptest::collection::vec(0i64..10_000, 1..8)) {
      let mut q = QueueSet::new();
      let start = Utc::now();
      let m = msg_at(Priority::Info, start);
      let id = m.id;
      q.push(m);
      let mut last = Priority::Info;
      let mut elapsed = 0;
      for w in waits {
        elapsed += w;
        q.age(&cfg(), start + Duration::seconds(elapsed));
        let p = q.get(id).map(|m| m.priority).unwrap();
        prop_assert!(p >= last);
        last = p;
      }
    }
  }
}
