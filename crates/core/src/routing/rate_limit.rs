use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::{Result, RouterError};
use crate::config::RateConfig;
use crate::domain::message::{AgentId, Priority};

/// Per-sender token bucket. Tokens refill lazily on every check; there is no
/// background timer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
  tokens: f64,
  capacity: f64,
  refill_per_sec: f64,
  last_refill: DateTime<Utc>,
}

impl TokenBucket {
  fn new(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
    Self {
      tokens: capacity,
      capacity,
      refill_per_sec,
      last_refill: now,
    }
  }

  fn refill(&mut self, now: DateTime<Utc>) {
    let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
    if elapsed > 0.0 {
      self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
      self.last_refill = now;
    }
  }

  /// Time until the bucket holds `cost` tokens at the current refill rate.
  fn retry_after(&self, cost: f64) -> Duration {
    let missing = (cost - self.tokens).max(0.0);
    Duration::from_secs_f64(missing / self.refill_per_sec)
  }

  fn try_take(&mut self, cost: f64, now: DateTime<Utc>) -> std::result::Result<(), Duration> {
    self.refill(now);
    if self.tokens + f64::EPSILON >= cost {
      self.tokens -= cost;
      Ok(())
    } else {
      Err(self.retry_after(cost))
    }
  }

  pub fn tokens(&self) -> f64 {
    self.tokens
  }
}

/// Admission control over all senders. Buckets are created full on first
/// contact and mutated on every check under one short mutex.
pub struct RateLimiter {
  cfg: RateConfig,
  buckets: Mutex<HashMap<AgentId, TokenBucket>>,
}

impl RateLimiter {
  pub fn new(cfg: RateConfig) -> Self {
    Self {
      cfg,
      buckets: Mutex::new(HashMap::new()),
    }
  }

  /// Token cost for a tier. DirectorOverride is free and unlimited.
  pub fn cost(&self, priority: Priority) -> f64 {
    match priority {
      Priority::Info => f64::from(self.cfg.cost_info),
      Priority::Coordinate => f64::from(self.cfg.cost_coordinate),
      Priority::Blocking => f64::from(self.cfg.cost_blocking),
      Priority::Critical => f64::from(self.cfg.cost_critical),
      Priority::DirectorOverride => 0.0,
    }
  }

  /// Admission check at submission time: consumes tokens or reports how long
  /// until enough have refilled.
  pub fn admit(&self, sender: &AgentId, priority: Priority, now: DateTime<Utc>) -> Result<()> {
    if priority == Priority::DirectorOverride {
      return Ok(());
    }
    let cost = self.cost(priority);
    let mut buckets = self.buckets.lock();
    let bucket = buckets
      .entry(sender.clone())
      .or_insert_with(|| TokenBucket::new(self.cfg.capacity, self.cfg.refill_per_sec, now));
    bucket
      .try_take(cost, now)
      .map_err(|retry_after| RouterError::RateLimited { retry_after })
  }

  /// Delivery-time validation: non-consuming. A sender that drained its
  /// bucket to empty after enqueueing has delivery of queued messages held
  /// until tokens recover, so a pre-staged burst cannot starve others.
  pub fn ready(&self, sender: &AgentId, priority: Priority, now: DateTime<Utc>) -> bool {
    if priority == Priority::DirectorOverride {
      return true;
    }
    let mut buckets = self.buckets.lock();
    match buckets.get_mut(sender) {
      Some(bucket) => {
        bucket.refill(now);
        bucket.tokens() > 0.0
      }
      // Unknown sender: nothing was ever consumed.
      None => true,
    }
  }

  /// Current token count for a sender, refilled to `now`.
  pub fn tokens(&self, sender: &AgentId, now: DateTime<Utc>) -> f64 {
    let mut buckets = self.buckets.lock();
    match buckets.get_mut(sender) {
      Some(bucket) => {
        bucket.refill(now);
        bucket.tokens()
      }
      None => self.cfg.capacity,
    }
  }
}
