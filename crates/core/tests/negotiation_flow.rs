//! End-to-end negotiation: contention spawns a paired clone discussion,
//! consensus merges both parents and transfers the lease, and timeouts
//! escalate without any partial merge.

use conclave_core::Core;
use conclave_core::adapters::frame::AgentRecord;
use conclave_core::config::Config;
use conclave_core::domain::context::ContextDelta;
use conclave_core::domain::event::LogEvent;
use conclave_core::domain::lease::{LeaseState, ResourceKey};
use conclave_core::domain::message::{AgentId, Priority, SenderRole};
use conclave_core::domain::negotiation::{AgreedTerms, Proposal};
use conclave_core::territory::Decision;
use serde_json::json;

fn config() -> Config {
  let mut cfg = Config::default();
  cfg.clones.pool_target = 2;
  cfg.clones.pool_low_water = 2;
  // Pooled processes only need to stay alive while the test drives the
  // discussion by injecting records.
  cfg.clones.command = vec!["sleep".to_string(), "30".to_string()];
  cfg
}

fn proposal(handle: &conclave_core::territory::NegotiationHandle, note: &str) -> Proposal {
  let mut delta = ContextDelta::default();
  delta.entries.insert(note.to_string(), json!("agreed"));
  Proposal {
    discussion: handle.discussion,
    terms: AgreedTerms::ReleaseToRequester,
    parent_delta: delta,
  }
}

#[tokio::test]
async fn consensus_transfers_lease_and_merges_both_parents() {
  let td = tempfile::tempdir().unwrap();
  let core = Core::new(config(), td.path()).unwrap();
  core
    .registry()
    .attach_virtual(AgentId::from("a1"), SenderRole::Agent);
  core
    .registry()
    .attach_virtual(AgentId::from("a2"), SenderRole::Agent);

  let resource = ResourceKey::new("api/users.ts");
  // Holder with 50s remaining and 10% progress; a Coordinate contender:
  // neither defer condition holds, so the claim goes to negotiation.
  assert!(matches!(
    core.request_lease(AgentId::from("a1"), resource.clone(), Some(50), Priority::Coordinate),
    Decision::Grant { .. }
  ));
  core
    .territory()
    .progress(&AgentId::from("a1"), &resource, 0.1)
    .unwrap();
  let handle = match core.request_lease(
    AgentId::from("a2"),
    resource.clone(),
    Some(60),
    Priority::Coordinate,
  ) {
    Decision::Negotiate(handle) => handle,
    other => panic!("expected negotiation, got {:?}", other),
  };
  assert_eq!(core.clones().session_count(), 2);
  assert_eq!(
    core.territory().lease_table()[&resource].state,
    LeaseState::Negotiating
  );

  // Both clone delegates report the same terms over the adapter boundary.
  let clone_agents: Vec<AgentId> = core
    .registry()
    .agent_ids()
    .into_iter()
    .filter(|id| id.as_str().starts_with("clone:"))
    .collect();
  assert_eq!(clone_agents.len(), 2);
  for (i, id) in clone_agents.iter().enumerate() {
    let agent = core.registry().get(id).unwrap();
    agent.inject(AgentRecord::Proposal(proposal(&handle, &format!("note{}", i))));
  }
  core.tick().await;

  // The lease moved to the requester; the sessions are gone.
  let table = core.territory().lease_table();
  assert_eq!(table[&resource].holder, Some(AgentId::from("a2")));
  assert_eq!(core.clones().session_count(), 0);

  // Each parent adopted exactly one agreed entry.
  let a1_ctx = core.contexts().snapshot_of(&AgentId::from("a1"));
  let a2_ctx = core.contexts().snapshot_of(&AgentId::from("a2"));
  let merged: usize = [&a1_ctx, &a2_ctx]
    .iter()
    .map(|c| c.entries.keys().filter(|k| k.starts_with("note")).count())
    .sum();
  assert_eq!(merged, 2);

  // The ledger saw the whole story.
  let records = core.ledger().read_all().unwrap();
  assert!(records.iter().any(|r| matches!(r.event, LogEvent::DiscussionOpened { .. })));
  assert!(records.iter().any(|r| matches!(r.event, LogEvent::DiscussionConsensus { .. })));
  assert_eq!(
    records
      .iter()
      .filter(|r| matches!(r.event, LogEvent::CloneMerged { .. }))
      .count(),
    2
  );
}

#[tokio::test]
async fn disagreement_escalates_with_no_partial_merge() {
  let td = tempfile::tempdir().unwrap();
  let core = Core::new(config(), td.path()).unwrap();
  core
    .registry()
    .attach_virtual(AgentId::from("a1"), SenderRole::Agent);
  core
    .registry()
    .attach_virtual(AgentId::from("a2"), SenderRole::Agent);

  let resource = ResourceKey::new("api/orders.ts");
  core.request_lease(AgentId::from("a1"), resource.clone(), Some(50), Priority::Coordinate);
  core
    .territory()
    .progress(&AgentId::from("a1"), &resource, 0.1)
    .unwrap();
  let handle = match core.request_lease(
    AgentId::from("a2"),
    resource.clone(),
    Some(60),
    Priority::Coordinate,
  ) {
    Decision::Negotiate(handle) => handle,
    other => panic!("expected negotiation, got {:?}", other),
  };

  let clone_agents: Vec<AgentId> = core
    .registry()
    .agent_ids()
    .into_iter()
    .filter(|id| id.as_str().starts_with("clone:"))
    .collect();
  // One side wants the transfer, the other wants to keep the lease.
  let first = core.registry().get(&clone_agents[0]).unwrap();
  first.inject(AgentRecord::Proposal(Proposal {
    discussion: handle.discussion,
    terms: AgreedTerms::ReleaseToRequester,
    parent_delta: ContextDelta::default(),
  }));
  let second = core.registry().get(&clone_agents[1]).unwrap();
  second.inject(AgentRecord::Proposal(Proposal {
    discussion: handle.discussion,
    terms: AgreedTerms::HolderRetains { extension_secs: 60 },
    parent_delta: ContextDelta::default(),
  }));
  core.tick().await;

  // Holder kept the lease, the requester's claim escalated, and neither
  // parent context was touched.
  let table = core.territory().lease_table();
  assert_eq!(table[&resource].holder, Some(AgentId::from("a1")));
  assert_eq!(table[&resource].state, LeaseState::InUse);
  assert_eq!(core.clones().session_count(), 0);
  assert!(core.contexts().snapshot_of(&AgentId::from("a1")).entries.is_empty());
  assert!(core.contexts().snapshot_of(&AgentId::from("a2")).entries.is_empty());
  let escalations = core.escalations();
  assert_eq!(escalations.len(), 1);
  assert_eq!(escalations[0].requester, AgentId::from("a2"));

  let records = core.ledger().read_all().unwrap();
  assert!(records.iter().any(|r| matches!(r.event, LogEvent::DiscussionFailed { .. })));
  assert!(!records.iter().any(|r| matches!(r.event, LogEvent::CloneMerged { .. })));
}
