use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use super::message::{AgentId, Priority};

/// Normalized resource path key, e.g. `api/users.ts`. Leading `./` and
/// trailing `/` are stripped so equivalent spellings collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
  pub fn new(raw: impl AsRef<str>) -> Self {
    let mut s = raw.as_ref().trim();
    while let Some(rest) = s.strip_prefix("./") {
      s = rest;
    }
    let s = s.trim_start_matches('/').trim_end_matches('/');
    Self(s.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
  #[default]
  Available,
  Granted,
  InUse,
  Negotiating,
  Deferred,
  Overridden,
  Expired,
}

impl LeaseState {
  pub fn as_str(self) -> &'static str {
    match self {
      LeaseState::Available => "available",
      LeaseState::Granted => "granted",
      LeaseState::InUse => "in_use",
      LeaseState::Negotiating => "negotiating",
      LeaseState::Deferred => "deferred",
      LeaseState::Overridden => "overridden",
      LeaseState::Expired => "expired",
    }
  }

  /// States in which the holder actively counts against the
  /// one-holder-per-resource invariant. A negotiating holder does not.
  pub fn holds_exclusively(self) -> bool {
    matches!(
      self,
      LeaseState::Granted | LeaseState::InUse | LeaseState::Deferred
    )
  }
}

#[derive(Debug, Error)]
pub enum LeaseError {
  #[error("invalid lease transition on `{resource}`: {from:?} -> {to:?}")]
  InvalidTransition {
    resource: ResourceKey,
    from: LeaseState,
    to: LeaseState,
  },
  #[error("lease on `{resource}` is not held by `{agent}`")]
  NotHolder { resource: ResourceKey, agent: AgentId },
  #[error("renewal of `{resource}` must extend the expiry")]
  RenewalDoesNotExtend { resource: ResourceKey },
}

pub type Result<T> = std::result::Result<T, LeaseError>;

/// One queued contender for a held resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
  pub agent: AgentId,
  pub priority: Priority,
  pub duration_secs: u64,
  pub requested_at: DateTime<Utc>,
}

/// A time-bounded, revocable claim on a resource path. Created on the first
/// request for its key; reset to `Available` on release or expiry.
///
/// Transitions move forward through the state order, with two sanctioned
/// exceptions: renewal (`InUse -> InUse`, also the path by which a holder
/// resumes from `Negotiating`/`Deferred`) and release (any active state ->
/// `Available`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
  pub resource: ResourceKey,
  pub holder: Option<AgentId>,
  pub holder_priority: Priority,
  pub state: LeaseState,
  pub negotiable: bool,
  pub granted_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
  /// Holder-reported progress fraction in [0.0, 1.0].
  pub progress: f64,
  pub pending: VecDeque<PendingRequest>,
}

impl Lease {
  pub fn new(resource: ResourceKey) -> Self {
    Self {
      resource,
      holder: None,
      holder_priority: Priority::Info,
      state: LeaseState::Available,
      negotiable: true,
      granted_at: None,
      expires_at: None,
      progress: 0.0,
      pending: VecDeque::new(),
    }
  }

  pub fn can_transition(from: LeaseState, to: LeaseState) -> bool {
    use LeaseState::*;
    // Release: every state may reset to Available.
    if to == Available && from != Available {
      return true;
    }
    matches!(
      (from, to),
      (Available, Granted)
        | (Granted, InUse)
        | (Granted, Negotiating)
        | (Granted, Deferred)
        | (Granted, Overridden)
        | (Granted, Expired)
        | (InUse, InUse)
        | (InUse, Negotiating)
        | (InUse, Deferred)
        | (InUse, Overridden)
        | (InUse, Expired)
        | (Negotiating, InUse)
        | (Negotiating, Deferred)
        | (Negotiating, Overridden)
        | (Negotiating, Expired)
        | (Deferred, InUse)
        | (Deferred, Negotiating)
        | (Deferred, Overridden)
        | (Deferred, Expired)
    )
  }

  pub fn transition_to(&mut self, to: LeaseState) -> Result<()> {
    if !Self::can_transition(self.state, to) {
      return Err(LeaseError::InvalidTransition {
        resource: self.resource.clone(),
        from: self.state,
        to,
      });
    }
    self.state = to;
    Ok(())
  }

  /// Grant this lease to `holder`. Only valid from `Available`.
  pub fn grant(
    &mut self,
    holder: AgentId,
    priority: Priority,
    duration: Duration,
    now: DateTime<Utc>,
  ) -> Result<()> {
    self.transition_to(LeaseState::Granted)?;
    self.holder = Some(holder);
    self.holder_priority = priority;
    self.granted_at = Some(now);
    self.expires_at = Some(now + duration);
    self.progress = 0.0;
    Ok(())
  }

  /// Renew, extending the expiry. `InUse -> InUse`; also brings the holder
  /// back from `Granted`/`Negotiating`/`Deferred`.
  pub fn renew(&mut self, agent: &AgentId, extension: Duration, now: DateTime<Utc>) -> Result<()> {
    self.ensure_holder(agent)?;
    let new_expiry = self.expires_at.unwrap_or(now) + extension;
    if let Some(current) = self.expires_at
      && new_expiry <= current
    {
      return Err(LeaseError::RenewalDoesNotExtend {
        resource: self.resource.clone(),
      });
    }
    self.transition_to(LeaseState::InUse)?;
    self.expires_at = Some(new_expiry);
    Ok(())
  }

  /// Release the claim and reset to `Available`. Pending requests survive.
  pub fn release(&mut self, agent: &AgentId) -> Result<()> {
    self.ensure_holder(agent)?;
    self.reset();
    Ok(())
  }

  /// Reset to `Available` without holder checks (expiry sweep, revocation
  /// follow-up).
  pub fn reset(&mut self) {
    self.holder = None;
    self.holder_priority = Priority::Info;
    self.state = LeaseState::Available;
    self.negotiable = true;
    self.granted_at = None;
    self.expires_at = None;
    self.progress = 0.0;
  }

  pub fn ensure_holder(&self, agent: &AgentId) -> Result<()> {
    if self.holder.as_ref() != Some(agent) {
      return Err(LeaseError::NotHolder {
        resource: self.resource.clone(),
        agent: agent.clone(),
      });
    }
    Ok(())
  }

  pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
    match self.expires_at {
      Some(t) if t > now => t - now,
      _ => Duration::zero(),
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.state.holds_exclusively() && self.expires_at.is_some_and(|t| t <= now)
  }
}
