use chrono::Duration;
use std::time::Duration as StdDuration;

use crate::config::LeaseConfig;
use crate::domain::message::Priority;

/// Everything a conflict ruling looks at. Computed fresh per negotiation
/// call; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictFactors {
  pub requester_priority: Priority,
  /// Holder priority after any inheritance boost.
  pub holder_priority: Priority,
  pub remaining: Duration,
  pub progress: f64,
  pub queue_depth: usize,
  pub deadlock: bool,
}

/// Outcome of the decision tree, before any state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ruling {
  EscalateDeadlock,
  EscalateQueueDepth,
  /// Requester outranks the holder by at least the override delta: revoke
  /// and grant.
  Override,
  Defer { retry_after: StdDuration },
  Negotiate,
}

/// Apply the decision tree in its fixed order.
pub fn decide(f: &ConflictFactors, cfg: &LeaseConfig) -> Ruling {
  if f.deadlock {
    return Ruling::EscalateDeadlock;
  }
  if f.queue_depth >= cfg.escalation_queue_depth {
    return Ruling::EscalateQueueDepth;
  }
  let delta = f.requester_priority.index() as i64 - f.holder_priority.index() as i64;
  if delta >= i64::from(cfg.override_priority_delta) {
    return Ruling::Override;
  }
  let near_done = f.remaining < Duration::seconds(cfg.defer_threshold_secs as i64);
  let mostly_done = f.progress > cfg.progress_defer;
  if near_done || mostly_done {
    let wait = f.remaining + Duration::seconds(cfg.defer_grace_secs as i64);
    let retry_after = StdDuration::from_millis(wait.num_milliseconds().max(0) as u64);
    return Ruling::Defer { retry_after };
  }
  Ruling::Negotiate
}
