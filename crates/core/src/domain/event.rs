use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clone_session::{CloneId, DiscussionId, EscalationId, SnapshotKind};
use super::lease::{PendingRequest, ResourceKey};
use super::message::{AgentId, Message, MessageId, Priority, Recipient};
use super::negotiation::{AgreedTerms, DirectorVerdict, EscalateReason};

fn default_true() -> bool {
  true
}

/// One appended ledger record: a monotonic sequence number, a wall-clock
/// stamp, and the transition itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
  pub seq: u64,
  pub at: DateTime<Utc>,
  #[serde(flatten)]
  pub event: LogEvent,
}

/// Every state transition the core persists. Carries enough data for a
/// deterministic replay of the lease table and queue contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
  MessageSubmitted {
    message: Message,
  },
  MessageRateLimited {
    sender: AgentId,
    priority: Priority,
    retry_after_ms: u64,
  },
  MessagePromoted {
    id: MessageId,
    to: Priority,
  },
  MessageDelivered {
    id: MessageId,
    recipient: Recipient,
  },
  MessageDropped {
    id: MessageId,
    reason: String,
  },
  LeaseRequested {
    resource: ResourceKey,
    agent: AgentId,
    priority: Priority,
    duration_secs: u64,
  },
  LeaseGranted {
    resource: ResourceKey,
    agent: AgentId,
    priority: Priority,
    expires_at: DateTime<Utc>,
    /// False for director force-grants, which are not renegotiable.
    #[serde(default = "default_true")]
    negotiable: bool,
  },
  LeaseQueued {
    resource: ResourceKey,
    request: PendingRequest,
  },
  LeaseDeferred {
    resource: ResourceKey,
    agent: AgentId,
    retry_after_ms: u64,
  },
  LeaseNegotiating {
    resource: ResourceKey,
    holder: AgentId,
    requester: AgentId,
    discussion: DiscussionId,
  },
  LeaseRevoked {
    resource: ResourceKey,
    holder: AgentId,
    requester: AgentId,
  },
  LeaseRenewed {
    resource: ResourceKey,
    agent: AgentId,
    expires_at: DateTime<Utc>,
  },
  LeaseProgress {
    resource: ResourceKey,
    agent: AgentId,
    fraction: f64,
  },
  /// Holder resumed exclusive use after a negotiation ended without
  /// transferring the lease.
  LeaseResumed {
    resource: ResourceKey,
    agent: AgentId,
  },
  LeaseReleased {
    resource: ResourceKey,
    agent: AgentId,
  },
  LeaseExpired {
    resource: ResourceKey,
    agent: AgentId,
  },
  EscalationRaised {
    id: EscalationId,
    resource: ResourceKey,
    requester: AgentId,
    reason: EscalateReason,
  },
  EscalationResolved {
    id: EscalationId,
    verdict: DirectorVerdict,
  },
  CloneSpawned {
    id: CloneId,
    parent: AgentId,
    purpose: String,
    snapshot_kind: SnapshotKind,
  },
  CloneMerged {
    id: CloneId,
    parent: AgentId,
  },
  CloneFailed {
    id: CloneId,
    parent: AgentId,
    reason: String,
  },
  DiscussionOpened {
    id: DiscussionId,
    resource: ResourceKey,
    holder: AgentId,
    requester: AgentId,
  },
  DiscussionConsensus {
    id: DiscussionId,
    terms: AgreedTerms,
  },
  DiscussionFailed {
    id: DiscussionId,
    reason: String,
  },
}

impl LogEvent {
  /// Short kind tag used in log lines.
  pub fn kind(&self) -> &'static str {
    match self {
      LogEvent::MessageSubmitted { .. } => "message_submitted",
      LogEvent::MessageRateLimited { .. } => "message_rate_limited",
      LogEvent::MessagePromoted { .. } => "message_promoted",
      LogEvent::MessageDelivered { .. } => "message_delivered",
      LogEvent::MessageDropped { .. } => "message_dropped",
      LogEvent::LeaseRequested { .. } => "lease_requested",
      LogEvent::LeaseGranted { .. } => "lease_granted",
      LogEvent::LeaseQueued { .. } => "lease_queued",
      LogEvent::LeaseDeferred { .. } => "lease_deferred",
      LogEvent::LeaseNegotiating { .. } => "lease_negotiating",
      LogEvent::LeaseRevoked { .. } => "lease_revoked",
      LogEvent::LeaseRenewed { .. } => "lease_renewed",
      LogEvent::LeaseProgress { .. } => "lease_progress",
      LogEvent::LeaseResumed { .. } => "lease_resumed",
      LogEvent::LeaseReleased { .. } => "lease_released",
      LogEvent::LeaseExpired { .. } => "lease_expired",
      LogEvent::EscalationRaised { .. } => "escalation_raised",
      LogEvent::EscalationResolved { .. } => "escalation_resolved",
      LogEvent::CloneSpawned { .. } => "clone_spawned",
      LogEvent::CloneMerged { .. } => "clone_merged",
      LogEvent::CloneFailed { .. } => "clone_failed",
      LogEvent::DiscussionOpened { .. } => "discussion_opened",
      LogEvent::DiscussionConsensus { .. } => "discussion_consensus",
      LogEvent::DiscussionFailed { .. } => "discussion_failed",
    }
  }
}
