use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::pool::{ClonePool, PoolHandle};
use super::snapshot::{Snapshot, SnapshotError};
use super::store::ContextStore;
use crate::adapters::frame::HostRecord;
use crate::adapters::process::AgentRegistry;
use crate::config::CloneConfig;
use crate::domain::clone_session::{CloneId, CloneSession, DiscussionId, SnapshotKind};
use crate::domain::context::ContextDelta;
use crate::domain::event::LogEvent;
use crate::domain::lease::ResourceKey;
use crate::domain::message::{AgentId, Priority};
use crate::domain::negotiation::{AgreedTerms, Proposal};
use crate::territory::NegotiationHandle;

#[derive(Debug, Error)]
pub enum CloneError {
  /// Pool exhausted or process start failed, after the one allowed retry.
  #[error("clone spawn failed: {0}")]
  SpawnFailure(String),
  #[error("unknown discussion `{0}`")]
  UnknownDiscussion(DiscussionId),
  #[error("no clone session for agent `{0}`")]
  UnknownSession(AgentId),
  #[error(transparent)]
  Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, CloneError>;

/// What a successful spawn hands back to the service: the session id, the
/// pooled process to talk to, and the seed record to write to it.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
  pub clone_id: CloneId,
  pub agent: AgentId,
  pub seed: HostRecord,
}

/// Result of a completed proposal exchange.
#[derive(Debug, Clone)]
pub enum DiscussionOutcome {
  Consensus {
    discussion: DiscussionId,
    terms: AgreedTerms,
  },
  Disagreement {
    discussion: DiscussionId,
  },
}

struct SessionEntry {
  session: CloneSession,
  handle: PoolHandle,
  agent: AgentId,
  discussion: Option<DiscussionId>,
}

struct Discussion {
  resource: ResourceKey,
  holder_session: CloneId,
  requester_session: CloneId,
  deadline: DateTime<Utc>,
  proposals: HashMap<CloneId, Proposal>,
}

#[derive(Default)]
struct CloneState {
  sessions: HashMap<CloneId, SessionEntry>,
  by_agent: HashMap<AgentId, CloneId>,
  discussions: HashMap<DiscussionId, Discussion>,
  /// Retained snapshots; full ones stay while they are some parent's
  /// differential base.
  snapshots: HashMap<crate::domain::clone_session::SnapshotId, Snapshot>,
  last_full: HashMap<AgentId, crate::domain::clone_session::SnapshotId>,
}

/// The clone orchestrator: session table, discussion pairing, snapshot
/// bookkeeping. Sessions are owned here and referenced only by id; the
/// underlying processes live in the pool's arena.
pub struct CloneOrchestrator {
  cfg: CloneConfig,
  pool: ClonePool,
  contexts: Arc<ContextStore>,
  state: RwLock<CloneState>,
}

impl CloneOrchestrator {
  pub fn new(cfg: CloneConfig, registry: Arc<AgentRegistry>, contexts: Arc<ContextStore>) -> Self {
    Self {
      pool: ClonePool::new(cfg.clone(), registry),
      cfg,
      contexts,
      state: RwLock::new(CloneState::default()),
    }
  }

  pub fn pool(&self) -> &ClonePool {
    &self.pool
  }

  /// Spawn one delegate session for `parent`. The pool is retried once
  /// (after a replenish attempt); a second failure surfaces as
  /// `SpawnFailure` for the caller to escalate.
  pub fn spawn(
    &self,
    parent: &AgentId,
    purpose: &str,
    discussion: Option<DiscussionId>,
    now: DateTime<Utc>,
  ) -> Result<(SpawnOutcome, Vec<LogEvent>)> {
    let (handle, agent) = match self.pool.acquire() {
      Ok(got) => got,
      Err(first) => {
        self.pool.replenish();
        match self.pool.acquire() {
          Ok(got) => got,
          Err(_) => return Err(CloneError::SpawnFailure(first.to_string())),
        }
      }
    };

    // Copy the parent context under a brief read lock; serialize and
    // compress on the copy with no lock held.
    let ctx = self.contexts.snapshot_of(parent);
    let last_full = self.state.read().last_full.get(parent).copied();
    let (snapshot, kind) = match last_full {
      Some(base) if ctx.mutations_since_full() < self.cfg.snapshot_diff_threshold => (
        Snapshot::differential(parent.clone(), base, &ctx, now)?,
        SnapshotKind::Differential,
      ),
      _ => {
        let snap = Snapshot::full(parent.clone(), &ctx, now)?;
        self.contexts.note_full_snapshot(parent);
        (snap, SnapshotKind::Full)
      }
    };

    // Discussion delegates live until the consensus deadline; standalone
    // delegates must finish within the spawn timeout.
    let lifetime = if discussion.is_some() {
      self.cfg.discussion_timeout_secs
    } else {
      self.cfg.spawn_timeout_secs
    };
    let session = CloneSession {
      id: CloneId::new(),
      parent: parent.clone(),
      purpose: purpose.to_string(),
      snapshot: snapshot.id,
      snapshot_kind: kind,
      spawned_at: now,
      priority_cap: Priority::Coordinate,
      deadline: now + Duration::seconds(lifetime as i64),
    };
    let clone_id = session.id;
    let seed = HostRecord::Seed {
      purpose: purpose.to_string(),
      discussion,
      snapshot_b64: snapshot.payload_b64(),
    };
    let events = vec![LogEvent::CloneSpawned {
      id: clone_id,
      parent: parent.clone(),
      purpose: purpose.to_string(),
      snapshot_kind: kind,
    }];

    let mut st = self.state.write();
    if kind == SnapshotKind::Full {
      st.last_full.insert(parent.clone(), snapshot.id);
    }
    st.snapshots.insert(snapshot.id, snapshot);
    st.by_agent.insert(agent.clone(), clone_id);
    st.sessions.insert(
      clone_id,
      SessionEntry {
        session,
        handle,
        agent: agent.clone(),
        discussion,
      },
    );

    Ok((
      SpawnOutcome {
        clone_id,
        agent,
        seed,
      },
      events,
    ))
  }

  /// Spawn the holder-side and requester-side sessions for a negotiation.
  /// Neither parent blocks; the clones talk while the parents keep working.
  pub fn open_discussion(
    &self,
    handle: &NegotiationHandle,
    now: DateTime<Utc>,
  ) -> Result<(Vec<SpawnOutcome>, Vec<LogEvent>)> {
    let (holder_out, mut events) = self.spawn(
      &handle.holder,
      "lease-negotiation",
      Some(handle.discussion),
      now,
    )?;
    let (requester_out, more) = match self.spawn(
      &handle.requester,
      "lease-negotiation",
      Some(handle.discussion),
      now,
    ) {
      Ok(ok) => ok,
      Err(e) => {
        // Half-open discussions are torn down immediately.
        self.teardown(&[holder_out.clone_id]);
        return Err(e);
      }
    };
    events.extend(more);

    let mut st = self.state.write();
    st.discussions.insert(
      handle.discussion,
      Discussion {
        resource: handle.resource.clone(),
        holder_session: holder_out.clone_id,
        requester_session: requester_out.clone_id,
        deadline: now + Duration::seconds(self.cfg.discussion_timeout_secs as i64),
        proposals: HashMap::new(),
      },
    );
    drop(st);

    events.push(LogEvent::DiscussionOpened {
      id: handle.discussion,
      resource: handle.resource.clone(),
      holder: handle.holder.clone(),
      requester: handle.requester.clone(),
    });
    Ok((vec![holder_out, requester_out], events))
  }

  /// A clone reported its negotiation result. Returns an outcome once both
  /// sides have spoken.
  pub fn on_proposal(
    &self,
    from: &AgentId,
    proposal: Proposal,
  ) -> Result<Option<DiscussionOutcome>> {
    let mut st = self.state.write();
    let clone_id = *st
      .by_agent
      .get(from)
      .ok_or_else(|| CloneError::UnknownSession(from.clone()))?;
    let discussion_id = proposal.discussion;
    let discussion = st
      .discussions
      .get_mut(&discussion_id)
      .ok_or(CloneError::UnknownDiscussion(discussion_id))?;
    if clone_id != discussion.holder_session && clone_id != discussion.requester_session {
      return Err(CloneError::UnknownSession(from.clone()));
    }
    discussion.proposals.insert(clone_id, proposal);
    if discussion.proposals.len() < 2 {
      return Ok(None);
    }
    let holder_terms = discussion.proposals[&discussion.holder_session].terms;
    let requester_terms = discussion.proposals[&discussion.requester_session].terms;
    if holder_terms == requester_terms {
      Ok(Some(DiscussionOutcome::Consensus {
        discussion: discussion_id,
        terms: holder_terms,
      }))
    } else {
      Ok(Some(DiscussionOutcome::Disagreement {
        discussion: discussion_id,
      }))
    }
  }

  /// Consensus reached: apply each side's agreed delta to its parent in one
  /// atomic critical section per parent, then tear the sessions down.
  pub fn merge(
    &self,
    discussion_id: DiscussionId,
    now: DateTime<Utc>,
  ) -> Result<(AgreedTerms, Vec<LogEvent>)> {
    let (terms, merges, session_ids) = {
      let mut st = self.state.write();
      let discussion = st
        .discussions
        .remove(&discussion_id)
        .ok_or(CloneError::UnknownDiscussion(discussion_id))?;
      let both = [discussion.holder_session, discussion.requester_session];
      let mut merges: Vec<(AgentId, ContextDelta)> = Vec::new();
      let mut terms = None;
      for id in both {
        let proposal = discussion
          .proposals
          .get(&id)
          .ok_or(CloneError::UnknownDiscussion(discussion_id))?;
        let parent = st
          .sessions
          .get(&id)
          .map(|e| e.session.parent.clone())
          .ok_or(CloneError::UnknownDiscussion(discussion_id))?;
        terms = Some(proposal.terms);
        if !proposal.parent_delta.is_empty() {
          merges.push((parent, proposal.parent_delta.clone()));
        }
      }
      (terms.expect("both proposals present"), merges, both)
    };

    // Deltas first, teardown second; a failure before this point leaves
    // every parent untouched.
    for (parent, delta) in &merges {
      self.contexts.apply_delta(parent, delta, now);
    }

    let mut events = vec![LogEvent::DiscussionConsensus {
      id: discussion_id,
      terms,
    }];
    events.extend(self.teardown_as_merged(&session_ids));
    Ok((terms, events))
  }

  /// Discussion over without agreement (timeout or contradictory terms).
  /// Sessions are destroyed and no partial merge is ever applied.
  pub fn fail_discussion(
    &self,
    discussion_id: DiscussionId,
    reason: &str,
  ) -> Result<Vec<LogEvent>> {
    let session_ids = {
      let mut st = self.state.write();
      let discussion = st
        .discussions
        .remove(&discussion_id)
        .ok_or(CloneError::UnknownDiscussion(discussion_id))?;
      [discussion.holder_session, discussion.requester_session]
    };
    let mut events = vec![LogEvent::DiscussionFailed {
      id: discussion_id,
      reason: reason.to_string(),
    }];
    events.extend(self.teardown_as_failed(&session_ids, reason));
    Ok(events)
  }

  /// Discussions whose deadline has passed without consensus.
  pub fn overdue_discussions(&self, now: DateTime<Utc>) -> Vec<DiscussionId> {
    self
      .state
      .read()
      .discussions
      .iter()
      .filter(|(_, d)| now >= d.deadline)
      .map(|(id, _)| *id)
      .collect()
  }

  /// Cancel standalone sessions past their deadline. Discussion-paired
  /// sessions are handled through [`CloneOrchestrator::overdue_discussions`].
  pub fn expire_sessions(&self, now: DateTime<Utc>) -> Vec<LogEvent> {
    let overdue: Vec<CloneId> = {
      let st = self.state.read();
      st.sessions
        .values()
        .filter(|e| e.discussion.is_none() && e.session.is_overdue(now))
        .map(|e| e.session.id)
        .collect()
    };
    self.teardown_as_failed(&overdue, "deadline exceeded")
  }

  /// Explicit parent termination: destroy every session the parent owns and
  /// report which discussions that killed.
  pub fn terminate_parent(&self, parent: &AgentId) -> (Vec<DiscussionId>, Vec<LogEvent>) {
    let (session_ids, discussions) = {
      let st = self.state.read();
      let sessions: Vec<CloneId> = st
        .sessions
        .values()
        .filter(|e| &e.session.parent == parent)
        .map(|e| e.session.id)
        .collect();
      let discussions: Vec<DiscussionId> = st
        .sessions
        .values()
        .filter(|e| &e.session.parent == parent)
        .filter_map(|e| e.discussion)
        .collect();
      (sessions, discussions)
    };
    let events = self.teardown_as_failed(&session_ids, "parent terminated");
    (discussions, events)
  }

  pub fn session_count(&self) -> usize {
    self.state.read().sessions.len()
  }

  pub fn resource_of(&self, discussion: DiscussionId) -> Option<ResourceKey> {
    self
      .state
      .read()
      .discussions
      .get(&discussion)
      .map(|d| d.resource.clone())
  }

  fn teardown_as_merged(&self, session_ids: &[CloneId]) -> Vec<LogEvent> {
    self
      .teardown(session_ids)
      .into_iter()
      .map(|(id, parent)| LogEvent::CloneMerged { id, parent })
      .collect()
  }

  fn teardown_as_failed(&self, session_ids: &[CloneId], reason: &str) -> Vec<LogEvent> {
    self
      .teardown(session_ids)
      .into_iter()
      .map(|(id, parent)| LogEvent::CloneFailed {
        id,
        parent,
        reason: reason.to_string(),
      })
      .collect()
  }

  /// Remove sessions from every table and release their pool slots (which
  /// cancels the underlying processes). Returns (id, parent) pairs for
  /// event construction.
  fn teardown(&self, session_ids: &[CloneId]) -> Vec<(CloneId, AgentId)> {
    let mut removed = Vec::new();
    let mut handles = Vec::new();
    {
      let mut st = self.state.write();
      for id in session_ids {
        if let Some(entry) = st.sessions.remove(id) {
          st.by_agent.remove(&entry.agent);
          // Differential snapshots die with the session; a full snapshot
          // survives while it is the parent's differential base.
          let snap_id = entry.session.snapshot;
          let is_base = st.last_full.get(&entry.session.parent) == Some(&snap_id);
          if !is_base {
            st.snapshots.remove(&snap_id);
          }
          removed.push((entry.session.id, entry.session.parent.clone()));
          handles.push(entry.handle);
        }
      }
    }
    for handle in handles {
      if let Err(e) = self.pool.release(handle) {
        warn!(event = "clone_pool_release_failed", error = %e);
      }
    }
    removed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn orchestrator() -> CloneOrchestrator {
    let cfg = CloneConfig {
      pool_target: 4,
      pool_low_water: 2,
      snapshot_diff_threshold: 3,
      command: vec!["sleep".to_string(), "5".to_string()],
      ..CloneConfig::default()
    };
    let registry = Arc::new(AgentRegistry::new());
    CloneOrchestrator::new(cfg, registry, Arc::new(ContextStore::new()))
  }

  fn negotiation(orc: &CloneOrchestrator, now: DateTime<Utc>) -> (NegotiationHandle, Vec<SpawnOutcome>) {
    let handle = NegotiationHandle {
      discussion: DiscussionId::new(),
      resource: ResourceKey::new("api/users.ts"),
      holder: AgentId::from("a1"),
      requester: AgentId::from("a2"),
    };
    orc.pool().replenish();
    let (outcomes, _events) = orc.open_discussion(&handle, now).unwrap();
    (handle, outcomes)
  }

  fn proposal(discussion: DiscussionId, terms: AgreedTerms, key: &str) -> Proposal {
    let mut delta = ContextDelta::default();
    delta.entries.insert(key.to_string(), json!("agreed"));
    Proposal {
      discussion,
      terms,
      parent_delta: delta,
    }
  }

  #[tokio::test]
  async fn consensus_merges_both_parents_and_removes_sessions() {
    let orc = orchestrator();
    let now = Utc::now();
    let (handle, outcomes) = negotiation(&orc, now);
    assert_eq!(orc.session_count(), 2);

    let first = orc
      .on_proposal(
        &outcomes[0].agent,
        proposal(handle.discussion, AgreedTerms::ReleaseToRequester, "holder-note"),
      )
      .unwrap();
    assert!(first.is_none());
    let second = orc
      .on_proposal(
        &outcomes[1].agent,
        proposal(handle.discussion, AgreedTerms::ReleaseToRequester, "requester-note"),
      )
      .unwrap();
    let Some(DiscussionOutcome::Consensus { discussion, terms }) = second else {
      panic!("expected consensus");
    };
    assert_eq!(terms, AgreedTerms::ReleaseToRequester);

    let (_terms, events) = orc.merge(discussion, now).unwrap();
    assert_eq!(orc.session_count(), 0);
    assert!(events.iter().any(|e| matches!(e, LogEvent::DiscussionConsensus { .. })));
    assert_eq!(
      events.iter().filter(|e| matches!(e, LogEvent::CloneMerged { .. })).count(),
      2
    );
    // Both parents got exactly the agreed delta.
    let holder_ctx = orc.contexts.snapshot_of(&AgentId::from("a1"));
    assert_eq!(holder_ctx.entries.get("holder-note"), Some(&json!("agreed")));
    let requester_ctx = orc.contexts.snapshot_of(&AgentId::from("a2"));
    assert_eq!(requester_ctx.entries.get("requester-note"), Some(&json!("agreed")));
  }

  #[tokio::test]
  async fn contradictory_terms_are_a_disagreement_with_no_merge() {
    let orc = orchestrator();
    let now = Utc::now();
    let (handle, outcomes) = negotiation(&orc, now);

    orc
      .on_proposal(
        &outcomes[0].agent,
        proposal(handle.discussion, AgreedTerms::ReleaseToRequester, "h"),
      )
      .unwrap();
    let second = orc
      .on_proposal(
        &outcomes[1].agent,
        proposal(
          handle.discussion,
          AgreedTerms::HolderRetains { extension_secs: 60 },
          "r",
        ),
      )
      .unwrap();
    assert!(matches!(second, Some(DiscussionOutcome::Disagreement { .. })));

    let events = orc.fail_discussion(handle.discussion, "no consensus").unwrap();
    assert!(events.iter().any(|e| matches!(e, LogEvent::DiscussionFailed { .. })));
    assert_eq!(orc.session_count(), 0);
    // No partial merge was applied to either parent.
    assert!(orc.contexts.snapshot_of(&AgentId::from("a1")).entries.is_empty());
    assert!(orc.contexts.snapshot_of(&AgentId::from("a2")).entries.is_empty());
  }

  #[tokio::test]
  async fn snapshots_go_differential_below_the_change_threshold() {
    let orc = orchestrator();
    let now = Utc::now();
    let parent = AgentId::from("a1");
    orc.contexts.apply(&parent, "k", json!(1), now);
    orc.pool().replenish();

    let (_out, events) = orc.spawn(&parent, "scout", None, now).unwrap();
    assert!(matches!(
      events[0],
      LogEvent::CloneSpawned { snapshot_kind: SnapshotKind::Full, .. }
    ));

    // One mutation since the full snapshot: under the threshold of 3.
    orc.contexts.apply(&parent, "k", json!(2), now);
    let (_out, events) = orc.spawn(&parent, "scout", None, now).unwrap();
    assert!(matches!(
      events[0],
      LogEvent::CloneSpawned { snapshot_kind: SnapshotKind::Differential, .. }
    ));

    // Blow past the threshold: the next snapshot is full again.
    for i in 0..4 {
      orc.contexts.apply(&parent, &format!("k{}", i), json!(i), now);
    }
    let (_out, events) = orc.spawn(&parent, "scout", None, now).unwrap();
    assert!(matches!(
      events[0],
      LogEvent::CloneSpawned { snapshot_kind: SnapshotKind::Full, .. }
    ));
  }

  #[tokio::test]
  async fn overdue_discussions_are_reported_for_failure() {
    let orc = orchestrator();
    let now = Utc::now();
    let (handle, _outcomes) = negotiation(&orc, now);
    assert!(orc.overdue_discussions(now).is_empty());
    let later = now + Duration::seconds(CloneConfig::default().discussion_timeout_secs as i64 + 1);
    assert_eq!(orc.overdue_discussions(later), vec![handle.discussion]);
  }

  #[tokio::test]
  async fn spawn_failure_after_retry_is_reported() {
    let cfg = CloneConfig {
      pool_target: 0,
      pool_low_water: 0,
      command: vec!["sleep".to_string(), "5".to_string()],
      ..CloneConfig::default()
    };
    let orc = CloneOrchestrator::new(cfg, Arc::new(AgentRegistry::new()), Arc::new(ContextStore::new()));
    let err = orc
      .spawn(&AgentId::from("a1"), "scout", None, Utc::now())
      .unwrap_err();
    assert!(matches!(err, CloneError::SpawnFailure(_)));
  }

  #[tokio::test]
  async fn terminate_parent_kills_its_sessions_and_names_their_discussions() {
    let orc = orchestrator();
    let now = Utc::now();
    let (handle, _outcomes) = negotiation(&orc, now);
    let (discussions, events) = orc.terminate_parent(&AgentId::from("a1"));
    assert_eq!(discussions, vec![handle.discussion]);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LogEvent::CloneFailed { .. }));
    assert_eq!(orc.session_count(), 1);
  }

}
