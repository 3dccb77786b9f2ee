pub mod conflict;
pub mod waits;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::{info, warn};

use conflict::{ConflictFactors, Ruling, decide};
use waits::WaitForGraph;

use crate::config::LeaseConfig;
use crate::domain::clone_session::{DiscussionId, EscalationId};
use crate::domain::event::LogEvent;
use crate::domain::lease::{Lease, LeaseError, LeaseState, PendingRequest, ResourceKey};
use crate::domain::message::{AgentId, Priority};
use crate::domain::negotiation::{AgreedTerms, DirectorVerdict, EscalateReason};

#[derive(Debug, Error)]
pub enum TerritoryError {
  #[error(transparent)]
  Lease(#[from] LeaseError),
  #[error("unknown escalation `{0}`")]
  UnknownEscalation(EscalationId),
  #[error("unknown negotiation `{0}`")]
  UnknownNegotiation(DiscussionId),
}

pub type Result<T> = std::result::Result<T, TerritoryError>;

/// Handle for a negotiation the manager started but does not wait on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationHandle {
  pub discussion: DiscussionId,
  pub resource: ResourceKey,
  pub holder: AgentId,
  pub requester: AgentId,
}

/// A conflict that left the decision tree, retained until the director
/// answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
  pub id: EscalationId,
  pub resource: ResourceKey,
  pub requester: AgentId,
  pub reason: EscalateReason,
  pub raised_at: DateTime<Utc>,
  pub verdict: Option<DirectorVerdict>,
}

/// What `acquire` resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  Grant { expires_at: DateTime<Utc> },
  Defer { retry_after: StdDuration },
  Negotiate(NegotiationHandle),
  Escalate(Escalation),
}

/// Side effects the caller must push over the adapter after the lock is
/// released.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
  Granted {
    resource: ResourceKey,
    agent: AgentId,
    expires_at: DateTime<Utc>,
  },
  Deferred {
    resource: ResourceKey,
    agent: AgentId,
    retry_after: StdDuration,
  },
  Revoked {
    resource: ResourceKey,
    agent: AgentId,
  },
  Expired {
    resource: ResourceKey,
    agent: AgentId,
  },
  Escalated {
    resource: ResourceKey,
    agent: AgentId,
    reason: EscalateReason,
  },
  Denied {
    resource: ResourceKey,
    agent: AgentId,
  },
}

#[derive(Default)]
struct TerritoryState {
  leases: HashMap<ResourceKey, Lease>,
  /// Priority inheritance overlay: a holder temporarily adopts the highest
  /// waiting requester's priority. The lease table itself is never mutated
  /// by inheritance.
  boosts: HashMap<AgentId, Priority>,
  escalations: HashMap<EscalationId, Escalation>,
  negotiations: HashMap<DiscussionId, NegotiationHandle>,
}

impl TerritoryState {
  fn effective_priority(&self, holder: &AgentId, base: Priority) -> Priority {
    match self.boosts.get(holder) {
      Some(boost) if *boost > base => *boost,
      _ => base,
    }
  }
}

/// The territory manager: lease table, conflict arbitration, escalation
/// ledger. All state sits behind one read-write lock; every method locks,
/// mutates, and returns the events/notices for the caller to record and
/// send — no I/O ever happens under the lock.
pub struct TerritoryManager {
  cfg: LeaseConfig,
  state: RwLock<TerritoryState>,
}

impl TerritoryManager {
  pub fn new(cfg: LeaseConfig) -> Self {
    Self {
      cfg,
      state: RwLock::new(TerritoryState::default()),
    }
  }

  /// Resolve a claim on `resource`. Never blocks on negotiation outcomes.
  pub fn acquire(
    &self,
    agent: AgentId,
    resource: ResourceKey,
    duration_secs: Option<u64>,
    priority: Priority,
    now: DateTime<Utc>,
  ) -> (Decision, Vec<LogEvent>) {
    let duration_secs = duration_secs.unwrap_or(self.cfg.default_duration_secs);
    let duration = Duration::seconds(duration_secs as i64);
    let mut events = vec![LogEvent::LeaseRequested {
      resource: resource.clone(),
      agent: agent.clone(),
      priority,
      duration_secs,
    }];

    let mut st = self.state.write();

    // Deadlock check needs the whole table; do it before touching one entry.
    let deadlock = match st.leases.get(&resource) {
      Some(l) if l.state != LeaseState::Available => match &l.holder {
        Some(holder) => {
          WaitForGraph::from_leases(st.leases.values()).would_deadlock(&agent, holder)
        }
        None => false,
      },
      _ => false,
    };

    let lease = st
      .leases
      .entry(resource.clone())
      .or_insert_with(|| Lease::new(resource.clone()));

    // Fresh or released territory: grant immediately. A lingering entry
    // without a holder is treated the same after a reset.
    if lease.state == LeaseState::Available || lease.holder.is_none() {
      if lease.state != LeaseState::Available {
        lease.reset();
      }
      if lease.grant(agent.clone(), priority, duration, now).is_err() {
        // Unreachable from Available; keep the request scoped anyway.
        warn!(event = "lease_grant_rejected", resource = %resource, agent = %agent);
      }
      let expires_at = lease.expires_at.expect("granted lease has expiry");
      lease.pending.retain(|r| r.agent != agent);
      events.push(LogEvent::LeaseGranted {
        resource: resource.clone(),
        agent,
        priority,
        expires_at,
        negotiable: lease.negotiable,
      });
      return (Decision::Grant { expires_at }, events);
    }

    let holder = lease.holder.clone().expect("checked above");
    let base_priority = lease.holder_priority;
    let remaining = lease.remaining(now);
    let progress = lease.progress;
    let queue_depth = lease.pending.len();
    let negotiable = lease.negotiable;
    let negotiating = lease.state == LeaseState::Negotiating;
    let holder_priority = st.effective_priority(&holder, base_priority);

    // An already-negotiating lease queues further contenders until the
    // discussion settles.
    if negotiating {
      if queue_depth >= self.cfg.escalation_queue_depth {
        return self.escalate(&mut st, resource, agent, EscalateReason::QueueDepth, now, events);
      }
      queue_request(
        &mut st,
        &resource,
        agent.clone(),
        priority,
        duration_secs,
        now,
        &mut events,
      );
      let retry_after = defer_wait(remaining, self.cfg.defer_grace_secs);
      return (Decision::Defer { retry_after }, events);
    }

    let factors = ConflictFactors {
      requester_priority: priority,
      holder_priority,
      remaining,
      progress,
      queue_depth,
      deadlock,
    };

    let mut ruling = decide(&factors, &self.cfg);
    // A non-negotiable lease (director force-grant) is deferred around, not
    // renegotiated.
    if matches!(ruling, Ruling::Negotiate) && !negotiable {
      ruling = Ruling::Defer {
        retry_after: defer_wait(remaining, self.cfg.defer_grace_secs),
      };
    }

    match ruling {
      Ruling::EscalateDeadlock => {
        self.escalate(&mut st, resource, agent, EscalateReason::Deadlock, now, events)
      }
      Ruling::EscalateQueueDepth => {
        self.escalate(&mut st, resource, agent, EscalateReason::QueueDepth, now, events)
      }
      Ruling::Override => {
        let lease = st.leases.get_mut(&resource).expect("entry exists");
        events.push(LogEvent::LeaseRevoked {
          resource: resource.clone(),
          holder: holder.clone(),
          requester: agent.clone(),
        });
        lease.reset();
        let _ = lease.grant(agent.clone(), priority, duration, now);
        let expires_at = lease.expires_at.expect("granted lease has expiry");
        lease.pending.retain(|r| r.agent != agent);
        events.push(LogEvent::LeaseGranted {
          resource: resource.clone(),
          agent,
          priority,
          expires_at,
          negotiable: lease.negotiable,
        });
        st.boosts.remove(&holder);
        (Decision::Grant { expires_at }, events)
      }
      Ruling::Defer { retry_after } => {
        queue_request(
          &mut st,
          &resource,
          agent.clone(),
          priority,
          duration_secs,
          now,
          &mut events,
        );
        events.push(LogEvent::LeaseDeferred {
          resource: resource.clone(),
          agent: agent.clone(),
          retry_after_ms: retry_after.as_millis() as u64,
        });
        let lease = st.leases.get_mut(&resource).expect("entry exists");
        if lease.state != LeaseState::Deferred {
          let _ = lease.transition_to(LeaseState::Deferred);
        }
        if priority > holder_priority {
          st.boosts.insert(holder, priority);
        }
        (Decision::Defer { retry_after }, events)
      }
      Ruling::Negotiate => {
        let discussion = DiscussionId::new();
        queue_request(
          &mut st,
          &resource,
          agent.clone(),
          priority,
          duration_secs,
          now,
          &mut events,
        );
        events.push(LogEvent::LeaseNegotiating {
          resource: resource.clone(),
          holder: holder.clone(),
          requester: agent.clone(),
          discussion,
        });
        let lease = st.leases.get_mut(&resource).expect("entry exists");
        let _ = lease.transition_to(LeaseState::Negotiating);
        if priority > holder_priority {
          st.boosts.insert(holder.clone(), priority);
        }
        let handle = NegotiationHandle {
          discussion,
          resource,
          holder,
          requester: agent,
        };
        st.negotiations.insert(discussion, handle.clone());
        (Decision::Negotiate(handle), events)
      }
    }
  }

  fn escalate(
    &self,
    st: &mut TerritoryState,
    resource: ResourceKey,
    requester: AgentId,
    reason: EscalateReason,
    now: DateTime<Utc>,
    mut events: Vec<LogEvent>,
  ) -> (Decision, Vec<LogEvent>) {
    let escalation = Escalation {
      id: EscalationId::new(),
      resource: resource.clone(),
      requester: requester.clone(),
      reason,
      raised_at: now,
      verdict: None,
    };
    events.push(LogEvent::EscalationRaised {
      id: escalation.id,
      resource,
      requester,
      reason,
    });
    st.escalations.insert(escalation.id, escalation.clone());
    (Decision::Escalate(escalation), events)
  }

  /// Holder gives the resource back; the next queued contender is granted.
  pub fn release(
    &self,
    agent: &AgentId,
    resource: &ResourceKey,
    now: DateTime<Utc>,
  ) -> Result<(Vec<Notice>, Vec<LogEvent>)> {
    let mut st = self.state.write();
    let lease = st
      .leases
      .get_mut(resource)
      .ok_or_else(|| LeaseError::NotHolder {
        resource: resource.clone(),
        agent: agent.clone(),
      })?;
    lease.release(agent)?;
    let mut events = vec![LogEvent::LeaseReleased {
      resource: resource.clone(),
      agent: agent.clone(),
    }];
    st.boosts.remove(agent);
    let notices = self.grant_next_locked(&mut st, resource, now, &mut events);
    Ok((notices, events))
  }

  /// Holder extends its claim. `InUse -> InUse`.
  pub fn renew(
    &self,
    agent: &AgentId,
    resource: &ResourceKey,
    extension_secs: u64,
    now: DateTime<Utc>,
  ) -> Result<(DateTime<Utc>, Vec<LogEvent>)> {
    let mut st = self.state.write();
    let lease = st
      .leases
      .get_mut(resource)
      .ok_or_else(|| LeaseError::NotHolder {
        resource: resource.clone(),
        agent: agent.clone(),
      })?;
    lease.renew(agent, Duration::seconds(extension_secs as i64), now)?;
    let expires_at = lease.expires_at.expect("renewed lease has expiry");
    let events = vec![LogEvent::LeaseRenewed {
      resource: resource.clone(),
      agent: agent.clone(),
      expires_at,
    }];
    Ok((expires_at, events))
  }

  /// Holder progress report; first progress moves `Granted -> InUse`.
  pub fn progress(
    &self,
    agent: &AgentId,
    resource: &ResourceKey,
    fraction: f64,
  ) -> Result<Vec<LogEvent>> {
    let mut st = self.state.write();
    let lease = st
      .leases
      .get_mut(resource)
      .ok_or_else(|| LeaseError::NotHolder {
        resource: resource.clone(),
        agent: agent.clone(),
      })?;
    lease.ensure_holder(agent)?;
    lease.progress = fraction.clamp(0.0, 1.0);
    if matches!(lease.state, LeaseState::Granted | LeaseState::Deferred) {
      let _ = lease.transition_to(LeaseState::InUse);
    }
    Ok(vec![LogEvent::LeaseProgress {
      resource: resource.clone(),
      agent: agent.clone(),
      fraction: lease.progress,
    }])
  }

  /// Expiry sweep: overdue holders lose their claim; next contenders are
  /// granted.
  pub fn expire_due(&self, now: DateTime<Utc>) -> (Vec<Notice>, Vec<LogEvent>) {
    let mut st = self.state.write();
    let due: Vec<ResourceKey> = st
      .leases
      .values()
      .filter(|l| l.is_expired(now))
      .map(|l| l.resource.clone())
      .collect();

    let mut notices = Vec::new();
    let mut events = Vec::new();
    for resource in due {
      let lease = st.leases.get_mut(&resource).expect("listed above");
      let holder = lease.holder.clone().expect("expired lease has holder");
      events.push(LogEvent::LeaseExpired {
        resource: resource.clone(),
        agent: holder.clone(),
      });
      lease.reset();
      st.boosts.remove(&holder);
      notices.push(Notice::Expired {
        resource: resource.clone(),
        agent: holder,
      });
      notices.extend(self.grant_next_locked(&mut st, &resource, now, &mut events));
    }
    (notices, events)
  }

  /// A negotiation converged; apply the agreed terms.
  pub fn complete_negotiation(
    &self,
    discussion: DiscussionId,
    terms: AgreedTerms,
    now: DateTime<Utc>,
  ) -> Result<(Vec<Notice>, Vec<LogEvent>)> {
    let mut st = self.state.write();
    let handle = st
      .negotiations
      .remove(&discussion)
      .ok_or(TerritoryError::UnknownNegotiation(discussion))?;
    let mut notices = Vec::new();
    let mut events = Vec::new();

    match terms {
      AgreedTerms::ReleaseToRequester => {
        let lease = st
          .leases
          .get_mut(&handle.resource)
          .ok_or(TerritoryError::UnknownNegotiation(discussion))?;
        events.push(LogEvent::LeaseReleased {
          resource: handle.resource.clone(),
          agent: handle.holder.clone(),
        });
        lease.reset();
        notices.push(Notice::Revoked {
          resource: handle.resource.clone(),
          agent: handle.holder.clone(),
        });
        st.boosts.remove(&handle.holder);
        // The requester is first in line by agreement.
        if let Some(lease) = st.leases.get_mut(&handle.resource) {
          if let Some(pos) = lease.pending.iter().position(|r| r.agent == handle.requester) {
            let request = lease.pending.remove(pos).expect("position exists");
            lease.pending.push_front(request);
          }
        }
        notices.extend(self.grant_next_locked(&mut st, &handle.resource, now, &mut events));
      }
      AgreedTerms::HolderRetains { extension_secs } => {
        let lease = st
          .leases
          .get_mut(&handle.resource)
          .ok_or(TerritoryError::UnknownNegotiation(discussion))?;
        lease.renew(&handle.holder, Duration::seconds(extension_secs as i64), now)?;
        let expires_at = lease.expires_at.expect("renewed lease has expiry");
        events.push(LogEvent::LeaseRenewed {
          resource: handle.resource.clone(),
          agent: handle.holder.clone(),
          expires_at,
        });
        let retry_after = defer_wait(lease.remaining(now), self.cfg.defer_grace_secs);
        notices.push(Notice::Deferred {
          resource: handle.resource.clone(),
          agent: handle.requester.clone(),
          retry_after,
        });
      }
    }
    Ok((notices, events))
  }

  /// A discussion ended without consensus (timeout, contradiction, or a
  /// spawn failure): the holder resumes, the requesting parent gets an
  /// escalation with the given reason. No partial outcome is applied.
  pub fn fail_negotiation(
    &self,
    discussion: DiscussionId,
    reason: EscalateReason,
    now: DateTime<Utc>,
  ) -> Result<(Vec<Notice>, Vec<LogEvent>)> {
    let mut st = self.state.write();
    let handle = st
      .negotiations
      .remove(&discussion)
      .ok_or(TerritoryError::UnknownNegotiation(discussion))?;
    let mut resume_event = None;
    if let Some(lease) = st.leases.get_mut(&handle.resource)
      && lease.state == LeaseState::Negotiating
    {
      let _ = lease.transition_to(LeaseState::InUse);
      if let Some(holder) = lease.holder.clone() {
        resume_event = Some(LogEvent::LeaseResumed {
          resource: handle.resource.clone(),
          agent: holder,
        });
      }
    }
    let escalation = Escalation {
      id: EscalationId::new(),
      resource: handle.resource.clone(),
      requester: handle.requester.clone(),
      reason,
      raised_at: now,
      verdict: None,
    };
    let mut events = Vec::new();
    events.extend(resume_event);
    events.push(LogEvent::EscalationRaised {
      id: escalation.id,
      resource: handle.resource.clone(),
      requester: handle.requester.clone(),
      reason,
    });
    st.escalations.insert(escalation.id, escalation.clone());
    let notice = Notice::Escalated {
      resource: escalation.resource,
      agent: escalation.requester,
      reason: escalation.reason,
    };
    Ok((vec![notice], events))
  }

  /// Director verdict on a retained escalation. Force-grant is the one path
  /// that bypasses normal arbitration, and it is always logged.
  pub fn resolve_escalation(
    &self,
    id: EscalationId,
    verdict: DirectorVerdict,
    now: DateTime<Utc>,
  ) -> Result<(Vec<Notice>, Vec<LogEvent>)> {
    let mut st = self.state.write();
    let escalation = st
      .escalations
      .get_mut(&id)
      .ok_or(TerritoryError::UnknownEscalation(id))?;
    escalation.verdict = Some(verdict);
    let escalation = escalation.clone();

    let mut events = vec![LogEvent::EscalationResolved { id, verdict }];
    let mut notices = Vec::new();
    info!(
      event = "escalation_resolved",
      id = %id,
      resource = %escalation.resource,
      verdict = ?verdict,
      "director verdict applied"
    );

    match verdict {
      DirectorVerdict::ForceGrant => {
        let lease = st
          .leases
          .entry(escalation.resource.clone())
          .or_insert_with(|| Lease::new(escalation.resource.clone()));
        if let Some(holder) = lease.holder.clone() {
          events.push(LogEvent::LeaseRevoked {
            resource: escalation.resource.clone(),
            holder: holder.clone(),
            requester: escalation.requester.clone(),
          });
          notices.push(Notice::Revoked {
            resource: escalation.resource.clone(),
            agent: holder.clone(),
          });
          lease.reset();
          st.boosts.remove(&holder);
        }
        let lease = st.leases.get_mut(&escalation.resource).expect("entry exists");
        let duration = Duration::seconds(self.cfg.default_duration_secs as i64);
        let _ = lease.grant(
          escalation.requester.clone(),
          Priority::Critical,
          duration,
          now,
        );
        // Force-granted leases are not renegotiable.
        lease.negotiable = false;
        let expires_at = lease.expires_at.expect("granted lease has expiry");
        lease.pending.retain(|r| r.agent != escalation.requester);
        events.push(LogEvent::LeaseGranted {
          resource: escalation.resource.clone(),
          agent: escalation.requester.clone(),
          priority: Priority::Critical,
          expires_at,
          negotiable: false,
        });
        notices.push(Notice::Granted {
          resource: escalation.resource.clone(),
          agent: escalation.requester.clone(),
          expires_at,
        });
      }
      DirectorVerdict::Deny => {
        notices.push(Notice::Denied {
          resource: escalation.resource.clone(),
          agent: escalation.requester.clone(),
        });
      }
      DirectorVerdict::ExtendWait => {
        let lease = st
          .leases
          .entry(escalation.resource.clone())
          .or_insert_with(|| Lease::new(escalation.resource.clone()));
        if !lease.pending.iter().any(|r| r.agent == escalation.requester) {
          let request = PendingRequest {
            agent: escalation.requester.clone(),
            priority: Priority::Coordinate,
            duration_secs: self.cfg.default_duration_secs,
            requested_at: now,
          };
          events.push(LogEvent::LeaseQueued {
            resource: escalation.resource.clone(),
            request: request.clone(),
          });
          lease.pending.push_back(request);
        }
        let retry_after = defer_wait(
          st.leases[&escalation.resource].remaining(now),
          self.cfg.defer_grace_secs,
        );
        notices.push(Notice::Deferred {
          resource: escalation.resource.clone(),
          agent: escalation.requester.clone(),
          retry_after,
        });
      }
    }
    Ok((notices, events))
  }

  /// Grant the front of the pending queue, if any. Caller holds the lock.
  fn grant_next_locked(
    &self,
    st: &mut TerritoryState,
    resource: &ResourceKey,
    now: DateTime<Utc>,
    events: &mut Vec<LogEvent>,
  ) -> Vec<Notice> {
    let Some(lease) = st.leases.get_mut(resource) else {
      return Vec::new();
    };
    let Some(next) = lease.pending.pop_front() else {
      return Vec::new();
    };
    let duration = Duration::seconds(next.duration_secs as i64);
    if lease
      .grant(next.agent.clone(), next.priority, duration, now)
      .is_err()
    {
      warn!(event = "lease_grant_rejected", resource = %resource, agent = %next.agent);
      return Vec::new();
    }
    let expires_at = lease.expires_at.expect("granted lease has expiry");
    events.push(LogEvent::LeaseGranted {
      resource: resource.clone(),
      agent: next.agent.clone(),
      priority: next.priority,
      expires_at,
      negotiable: lease.negotiable,
    });
    vec![Notice::Granted {
      resource: resource.clone(),
      agent: next.agent,
      expires_at,
    }]
  }

  pub fn escalations(&self) -> Vec<Escalation> {
    let mut list: Vec<Escalation> = self.state.read().escalations.values().cloned().collect();
    list.sort_by_key(|e| e.raised_at);
    list
  }

  pub fn negotiation(&self, discussion: DiscussionId) -> Option<NegotiationHandle> {
    self.state.read().negotiations.get(&discussion).cloned()
  }

  /// Cloned snapshot of the lease table, for status and replay comparison.
  pub fn lease_table(&self) -> HashMap<ResourceKey, Lease> {
    self.state.read().leases.clone()
  }
}

fn defer_wait(remaining: Duration, grace_secs: u64) -> StdDuration {
  let wait = remaining + Duration::seconds(grace_secs as i64);
  StdDuration::from_millis(wait.num_milliseconds().max(0) as u64)
}

/// Queue a contender once; a retrying agent keeps its original place.
fn queue_request(
  st: &mut TerritoryState,
  resource: &ResourceKey,
  agent: AgentId,
  priority: Priority,
  duration_secs: u64,
  now: DateTime<Utc>,
  events: &mut Vec<LogEvent>,
) {
  let lease = st.leases.get_mut(resource).expect("entry exists");
  if lease.pending.iter().any(|r| r.agent == agent) {
    return;
  }
  let request = PendingRequest {
    agent,
    priority,
    duration_secs,
    requested_at: now,
  };
  events.push(LogEvent::LeaseQueued {
    resource: resource.clone(),
    request: request.clone(),
  });
  lease.pending.push_back(request);
}
