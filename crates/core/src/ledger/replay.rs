use std::collections::HashMap;

use crate::domain::event::{EventRecord, LogEvent};
use crate::domain::lease::{Lease, LeaseState, ResourceKey};
use crate::routing::queue::QueueSet;

/// State rebuilt from the event log: the lease table and the queue contents.
/// Replay is a pure fold, so running it twice over the same records yields
/// identical results.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayState {
  pub leases: HashMap<ResourceKey, Lease>,
  pub queues: QueueSet,
}

/// Rebuild state from persisted records.
pub fn replay<I>(records: I) -> ReplayState
where
  I: IntoIterator<Item = EventRecord>,
{
  let mut state = ReplayState::default();
  for record in records {
    apply(&mut state, record);
  }
  state
}

fn lease_entry<'a>(state: &'a mut ReplayState, resource: &ResourceKey) -> &'a mut Lease {
  state
    .leases
    .entry(resource.clone())
    .or_insert_with(|| Lease::new(resource.clone()))
}

fn apply(state: &mut ReplayState, record: EventRecord) {
  let at = record.at;
  match record.event {
    LogEvent::MessageSubmitted { message } => {
      state.queues.push(message);
    }
    LogEvent::MessagePromoted { id, to } => {
      state.queues.reprioritize(id, to);
    }
    LogEvent::MessageDelivered { id, .. } | LogEvent::MessageDropped { id, .. } => {
      state.queues.remove(id);
    }
    LogEvent::MessageRateLimited { .. } => {}
    LogEvent::LeaseRequested { resource, .. } => {
      lease_entry(state, &resource);
    }
    LogEvent::LeaseGranted {
      resource,
      agent,
      priority,
      expires_at,
      negotiable,
    } => {
      let lease = lease_entry(state, &resource);
      lease.holder = Some(agent.clone());
      lease.holder_priority = priority;
      lease.state = LeaseState::Granted;
      lease.negotiable = negotiable;
      lease.granted_at = Some(at);
      lease.expires_at = Some(expires_at);
      lease.progress = 0.0;
      // A grant consumes the grantee's queued request, if any.
      lease.pending.retain(|r| r.agent != agent);
    }
    LogEvent::LeaseQueued { resource, request } => {
      let lease = lease_entry(state, &resource);
      if !lease.pending.iter().any(|r| r.agent == request.agent) {
        lease.pending.push_back(request);
      }
    }
    LogEvent::LeaseDeferred { resource, .. } => {
      let lease = lease_entry(state, &resource);
      lease.state = LeaseState::Deferred;
    }
    LogEvent::LeaseNegotiating { resource, .. } => {
      let lease = lease_entry(state, &resource);
      lease.state = LeaseState::Negotiating;
    }
    LogEvent::LeaseRevoked { resource, .. } => {
      lease_entry(state, &resource).reset();
    }
    LogEvent::LeaseRenewed {
      resource,
      expires_at,
      ..
    } => {
      let lease = lease_entry(state, &resource);
      lease.state = LeaseState::InUse;
      lease.expires_at = Some(expires_at);
    }
    LogEvent::LeaseProgress {
      resource, fraction, ..
    } => {
      let lease = lease_entry(state, &resource);
      lease.progress = fraction;
      if matches!(lease.state, LeaseState::Granted | LeaseState::Deferred) {
        lease.state = LeaseState::InUse;
      }
    }
    LogEvent::LeaseResumed { resource, .. } => {
      let lease = lease_entry(state, &resource);
      if lease.state == LeaseState::Negotiating {
        lease.state = LeaseState::InUse;
      }
    }
    LogEvent::LeaseReleased { resource, .. } | LogEvent::LeaseExpired { resource, .. } => {
      lease_entry(state, &resource).reset();
    }
    // Escalation, clone, and discussion events do not shape the lease table
    // or the queues.
    LogEvent::EscalationRaised { .. }
    | LogEvent::EscalationResolved { .. }
    | LogEvent::CloneSpawned { .. }
    | LogEvent::CloneMerged { .. }
    | LogEvent::CloneFailed { .. }
    | LogEvent::DiscussionOpened { .. }
    | LogEvent::DiscussionConsensus { .. }
    | LogEvent::DiscussionFailed { .. } => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::message::{AgentId, Message, Priority, Recipient, SenderRole};
  use chrono::{Duration, Utc};

  fn record(seq: u64, event: LogEvent) -> EventRecord {
    EventRecord {
      seq,
      at: Utc::now(),
      event,
    }
  }

  #[test]
  fn replay_is_idempotent() {
    let now = Utc::now();
    let (msg, _) = Message::submit(
      AgentId::from("a1"),
      SenderRole::Agent,
      Recipient::Agent(AgentId::from("a2")),
      Priority::Info,
      "hi".into(),
      None,
      now,
    )
    .unwrap();
    let records = vec![
      record(
        1,
        LogEvent::LeaseGranted {
          resource: ResourceKey::new("api/users.ts"),
          agent: AgentId::from("a1"),
          priority: Priority::Coordinate,
          expires_at: now + Duration::seconds(60),
          negotiable: true,
        },
      ),
      record(2, LogEvent::MessageSubmitted { message: msg }),
    ];
    let once = replay(records.clone());
    let twice = replay(records);
    assert_eq!(once, twice);
    assert_eq!(once.queues.len(), 1);
    let lease = once.leases.get(&ResourceKey::new("api/users.ts")).unwrap();
    assert_eq!(lease.holder, Some(AgentId::from("a1")));
  }

  #[test]
  fn grant_consumes_queued_request() {
    let now = Utc::now();
    let resource = ResourceKey::new("api/users.ts");
    let records = vec![
      record(
        1,
        LogEvent::LeaseQueued {
          resource: resource.clone(),
          request: crate::domain::lease::PendingRequest {
            agent: AgentId::from("a2"),
            priority: Priority::Coordinate,
            duration_secs: 60,
            requested_at: now,
          },
        },
      ),
      record(
        2,
        LogEvent::LeaseGranted {
          resource: resource.clone(),
          agent: AgentId::from("a2"),
          priority: Priority::Coordinate,
          expires_at: now + Duration::seconds(60),
          negotiable: true,
        },
      ),
    ];
    let state = replay(records);
    let lease = state.leases.get(&resource).unwrap();
    assert!(lease.pending.is_empty());
    assert_eq!(lease.holder, Some(AgentId::from("a2")));
  }
}
