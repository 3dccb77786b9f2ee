use serde::{Deserialize, Serialize};

use super::clone_session::DiscussionId;
use super::context::ContextDelta;

/// Why a lease conflict left the normal decision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalateReason {
  Deadlock,
  QueueDepth,
  SpawnFailure,
  ConsensusTimeout,
}

impl EscalateReason {
  pub fn as_str(self) -> &'static str {
    match self {
      EscalateReason::Deadlock => "deadlock",
      EscalateReason::QueueDepth => "queue_depth",
      EscalateReason::SpawnFailure => "spawn_failure",
      EscalateReason::ConsensusTimeout => "consensus_timeout",
    }
  }
}

/// Asynchronous director response to an escalation. Accepted at any time;
/// the core never blocks waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectorVerdict {
  ForceGrant,
  Deny,
  ExtendWait,
}

/// Terms two negotiating clones can settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreedTerms {
  /// Holder releases; the requester is granted next.
  ReleaseToRequester,
  /// Holder keeps the lease, extended by the given amount; the requester
  /// stays queued.
  HolderRetains { extension_secs: u64 },
}

/// One clone's reported negotiation result: the terms it agreed to plus the
/// context changes its parent should adopt if the discussion converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
  pub discussion: DiscussionId,
  pub terms: AgreedTerms,
  #[serde(default)]
  pub parent_delta: ContextDelta,
}
