use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::adapters::frame::{AgentRecord, HostRecord};
use crate::adapters::process::AgentRegistry;
use crate::adapters::fs as fsutil;
use crate::clones::{CloneError, CloneOrchestrator, ContextStore, DiscussionOutcome};
use crate::config::Config;
use crate::domain::clone_session::{DiscussionId, EscalationId};
use crate::domain::event::LogEvent;
use crate::domain::lease::ResourceKey;
use crate::domain::message::{AgentId, Message, MessageId, Priority, Recipient, SenderRole};
use crate::domain::negotiation::{DirectorVerdict, EscalateReason, Proposal};
use crate::ledger::Ledger;
use crate::routing::dispatch::Router;
use crate::routing::{Result as RoutingResult, RouterError};
use crate::rpc::{LeaseInfo, TerritoryStatusResult};
use crate::territory::{Decision, Escalation, Notice, TerritoryError, TerritoryManager};

/// Identity the daemon surface submits under.
pub const DIRECTOR_ID: &str = "director";

/// The assembled core: router, territory manager, clone orchestrator,
/// adapter registry, and ledger. All mutation is synchronous under the
/// component locks; adapter writes are queued in an outbox and flushed by
/// the async tick, so no lock is ever held across I/O.
pub struct Core {
  cfg: Config,
  registry: Arc<AgentRegistry>,
  contexts: Arc<ContextStore>,
  router: Router,
  territory: TerritoryManager,
  clones: CloneOrchestrator,
  ledger: Ledger,
  outbox: Mutex<Vec<(AgentId, HostRecord)>>,
}

impl Core {
  pub fn new(cfg: Config, project_root: &Path) -> anyhow::Result<Arc<Self>> {
    fsutil::ensure_layout(project_root)?;
    let ledger = Ledger::open(fsutil::ledger_path(project_root))?;
    let registry = Arc::new(AgentRegistry::new());
    registry.attach_virtual(AgentId::from(DIRECTOR_ID), SenderRole::Director);
    let contexts = Arc::new(ContextStore::new());
    let core = Self {
      router: Router::new(cfg.rate.clone(), cfg.aging.clone()),
      territory: TerritoryManager::new(cfg.lease.clone()),
      clones: CloneOrchestrator::new(cfg.clones.clone(), Arc::clone(&registry), Arc::clone(&contexts)),
      registry,
      contexts,
      ledger,
      cfg,
      outbox: Mutex::new(Vec::new()),
    };
    Ok(Arc::new(core))
  }

  pub fn registry(&self) -> &Arc<AgentRegistry> {
    &self.registry
  }

  pub fn contexts(&self) -> &Arc<ContextStore> {
    &self.contexts
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  pub fn territory(&self) -> &TerritoryManager {
    &self.territory
  }

  pub fn clones(&self) -> &CloneOrchestrator {
    &self.clones
  }

  pub fn ledger(&self) -> &Ledger {
    &self.ledger
  }

  /// Submit a message into the router, recording the outcome either way.
  pub fn submit_message(
    &self,
    sender: AgentId,
    role: SenderRole,
    recipient: Recipient,
    priority: Priority,
    body: String,
    payload: Option<serde_json::Value>,
  ) -> RoutingResult<MessageId> {
    let now = Utc::now();
    match self
      .router
      .submit(sender.clone(), role, recipient, priority, body, payload, now)
    {
      Ok((id, events)) => {
        self.ledger.record_all(events, now);
        Ok(id)
      }
      Err(RouterError::RateLimited { retry_after }) => {
        self.ledger.record(
          LogEvent::MessageRateLimited {
            sender: sender.clone(),
            priority,
            retry_after_ms: retry_after.as_millis() as u64,
          },
          now,
        );
        self.queue_send(
          sender,
          HostRecord::Throttled {
            retry_after_ms: retry_after.as_millis() as u64,
          },
        );
        Err(RouterError::RateLimited { retry_after })
      }
      Err(other) => Err(other),
    }
  }

  /// Arbitrate a lease claim and carry out whatever the decision demands:
  /// grants and deferrals notify the agents involved; a negotiation spawns
  /// the paired clone sessions without blocking; escalations are retained
  /// for the director.
  pub fn request_lease(
    &self,
    agent: AgentId,
    resource: ResourceKey,
    duration_secs: Option<u64>,
    priority: Priority,
  ) -> Decision {
    let now = Utc::now();
    let (decision, events) =
      self
        .territory
        .acquire(agent.clone(), resource.clone(), duration_secs, priority, now);
    self.ledger.record_all(events, now);

    match &decision {
      Decision::Grant { expires_at } => {
        self.queue_send(
          agent,
          HostRecord::LeaseGranted {
            resource,
            expires_at_ms: expires_at.timestamp_millis() as u64,
          },
        );
      }
      Decision::Defer { retry_after } => {
        self.queue_send(
          agent,
          HostRecord::LeaseDeferred {
            resource,
            retry_after_ms: retry_after.as_millis() as u64,
          },
        );
      }
      Decision::Escalate(escalation) => {
        self.queue_send(
          agent,
          HostRecord::LeaseEscalated {
            resource,
            reason: escalation.reason,
          },
        );
      }
      Decision::Negotiate(handle) => match self.clones.open_discussion(handle, now) {
        Ok((outcomes, events)) => {
          self.ledger.record_all(events, now);
          for outcome in outcomes {
            self.queue_send(outcome.agent, outcome.seed);
          }
        }
        Err(CloneError::SpawnFailure(reason)) => {
          warn!(event = "negotiation_spawn_failed", resource = %handle.resource, reason = %reason);
          self.fail_discussion_scoped(handle.discussion, "spawn failure", EscalateReason::SpawnFailure, now);
        }
        Err(e) => {
          warn!(event = "negotiation_open_failed", error = %e);
          self.fail_discussion_scoped(handle.discussion, "internal error", EscalateReason::SpawnFailure, now);
        }
      },
    }
    decision
  }

  /// Director verdict on a retained escalation.
  pub fn resolve_escalation(
    &self,
    id: EscalationId,
    verdict: DirectorVerdict,
  ) -> Result<(), TerritoryError> {
    let now = Utc::now();
    let (notices, events) = self.territory.resolve_escalation(id, verdict, now)?;
    self.ledger.record_all(events, now);
    self.queue_notices(notices);
    Ok(())
  }

  pub fn escalations(&self) -> Vec<Escalation> {
    self.territory.escalations()
  }

  /// Spawn a configured agent process.
  pub fn start_agent(&self, key: &str, id: Option<String>) -> anyhow::Result<AgentId> {
    let agent_cfg = self
      .cfg
      .agents
      .get(key)
      .ok_or_else(|| anyhow::anyhow!("agent `{}` is not configured", key))?;
    let id = AgentId::new(id.unwrap_or_else(|| key.to_string()));
    self
      .registry
      .spawn(id.clone(), SenderRole::Agent, &agent_cfg.start)?;
    info!(event = "agent_started", agent = %id, key);
    Ok(id)
  }

  pub fn status(&self) -> TerritoryStatusResult {
    let leases = self
      .territory
      .lease_table()
      .into_values()
      .map(|l| LeaseInfo {
        resource: l.resource.to_string(),
        holder: l.holder.map(|h| h.to_string()),
        state: l.state,
        expires_at: l.expires_at,
        progress: l.progress,
        pending: l.pending.len(),
      })
      .collect();
    TerritoryStatusResult {
      leases,
      queues: self.router.status(),
      pool: self.clones.pool().stats(),
      clone_sessions: self.clones.session_count(),
    }
  }

  /// One scheduler turn: drain agent records, age the queues, sweep lease
  /// expiry and discussion deadlines, deliver, flush the outbox, and top up
  /// the clone pool.
  pub async fn tick(&self) {
    let now = Utc::now();

    for id in self.registry.agent_ids() {
      for record in self.registry.poll_events(&id) {
        self.handle_record(&id, record, now);
      }
    }

    let promotions = self.router.age_tick(now);
    self.ledger.record_all(promotions, now);

    let (notices, events) = self.territory.expire_due(now);
    self.ledger.record_all(events, now);
    self.queue_notices(notices);

    for discussion in self.clones.overdue_discussions(now) {
      self.fail_discussion_scoped(discussion, "consensus timeout", EscalateReason::ConsensusTimeout, now);
    }
    let expired_sessions = self.clones.expire_sessions(now);
    self.ledger.record_all(expired_sessions, now);

    let deliveries = self.router.collect_deliveries(now);
    for message in deliveries {
      self.deliver(message, now).await;
    }

    self.flush_outbox().await;
    self.clones.pool().replenish();
  }

  /// Event loop: tick on a short interval and whenever the adapter signals
  /// new records, until shutdown.
  pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
    let notify = self.registry.notifier();
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
    info!(event = "core_started", "router core running");
    loop {
      tokio::select! {
        _ = shutdown_rx.changed() => {
          info!(event = "core_shutdown", "shutdown signal received");
          break;
        }
        _ = interval.tick() => self.tick().await,
        _ = notify.notified() => self.tick().await,
      }
    }
  }

  /// Handle one decoded agent record. Failures are scoped to the record:
  /// nothing here can take the process down.
  fn handle_record(&self, agent: &AgentId, record: AgentRecord, now: DateTime<Utc>) {
    let role = self
      .registry
      .get(agent)
      .map(|p| p.role)
      .unwrap_or(SenderRole::Agent);
    match record {
      AgentRecord::Lifecycle { phase } => {
        debug!(event = "agent_lifecycle", agent = %agent, phase = %phase);
        if phase == "exited" {
          self.router.gate().forget(agent);
        }
      }
      AgentRecord::TaskStatus { state, detail } => {
        self.router.gate().record_activity(agent);
        self.contexts.apply(
          agent,
          "task_status",
          serde_json::json!({ "state": state, "detail": detail }),
          now,
        );
      }
      AgentRecord::LeaseRequest {
        resource,
        duration_secs,
        priority,
      } => {
        self.router.gate().record_activity(agent);
        let _ = self.request_lease(
          agent.clone(),
          ResourceKey::new(&resource),
          duration_secs,
          priority.unwrap_or(Priority::Coordinate),
        );
      }
      AgentRecord::LeaseRelease { resource } => {
        let resource = ResourceKey::new(&resource);
        match self.territory.release(agent, &resource, now) {
          Ok((notices, events)) => {
            self.ledger.record_all(events, now);
            self.queue_notices(notices);
          }
          Err(e) => {
            warn!(event = "lease_release_rejected", agent = %agent, resource = %resource, error = %e);
          }
        }
      }
      AgentRecord::LeaseRenew {
        resource,
        extension_secs,
      } => {
        self.router.gate().record_activity(agent);
        let resource = ResourceKey::new(&resource);
        match self.territory.renew(agent, &resource, extension_secs, now) {
          Ok((expires_at, events)) => {
            self.ledger.record_all(events, now);
            self.queue_send(
              agent.clone(),
              HostRecord::LeaseGranted {
                resource,
                expires_at_ms: expires_at.timestamp_millis() as u64,
              },
            );
          }
          Err(e) => {
            warn!(event = "lease_renew_rejected", agent = %agent, resource = %resource, error = %e);
          }
        }
      }
      AgentRecord::Progress { resource, fraction } => {
        self.router.gate().record_activity(agent);
        let resource = ResourceKey::new(&resource);
        match self.territory.progress(agent, &resource, fraction) {
          Ok(events) => {
            self.ledger.record_all(events, now);
          }
          Err(e) => {
            debug!(event = "progress_ignored", agent = %agent, resource = %resource, error = %e);
          }
        }
      }
      AgentRecord::Pause { kind, next_in_ms } => {
        self.router.gate().record_pause(agent, kind, next_in_ms, now);
      }
      AgentRecord::Message {
        to,
        priority,
        body,
        payload,
      } => {
        let recipient = match to {
          Some(name) => Recipient::Agent(AgentId::new(name)),
          None => Recipient::Broadcast,
        };
        if let Err(e) = self.submit_message(agent.clone(), role, recipient, priority, body, payload)
        {
          debug!(event = "message_rejected", agent = %agent, error = %e);
        }
      }
      AgentRecord::Proposal(proposal) => self.handle_proposal(agent, proposal, now),
    }
  }

  fn handle_proposal(&self, agent: &AgentId, proposal: Proposal, now: DateTime<Utc>) {
    match self.clones.on_proposal(agent, proposal) {
      Ok(None) => {}
      Ok(Some(DiscussionOutcome::Consensus { discussion, .. })) => match self.clones.merge(discussion, now) {
        Ok((terms, events)) => {
          self.ledger.record_all(events, now);
          match self.territory.complete_negotiation(discussion, terms, now) {
            Ok((notices, events)) => {
              self.ledger.record_all(events, now);
              self.queue_notices(notices);
            }
            Err(e) => warn!(event = "negotiation_completion_failed", error = %e),
          }
        }
        Err(e) => warn!(event = "discussion_merge_failed", error = %e),
      },
      Ok(Some(DiscussionOutcome::Disagreement { discussion })) => {
        self.fail_discussion_scoped(discussion, "no consensus", EscalateReason::ConsensusTimeout, now);
      }
      Err(e) => {
        warn!(event = "proposal_rejected", agent = %agent, error = %e);
      }
    }
  }

  /// Tear down a discussion and escalate to the requesting parent. Used for
  /// timeouts, disagreements, and spawn failures; never applies any merge.
  fn fail_discussion_scoped(
    &self,
    discussion: DiscussionId,
    reason: &str,
    escalate_as: EscalateReason,
    now: DateTime<Utc>,
  ) {
    match self.clones.fail_discussion(discussion, reason) {
      Ok(events) => {
        self.ledger.record_all(events, now);
      }
      Err(e) => debug!(event = "discussion_teardown_skipped", error = %e),
    }
    match self.territory.fail_negotiation(discussion, escalate_as, now) {
      Ok((notices, events)) => {
        self.ledger.record_all(events, now);
        self.queue_notices(notices);
      }
      Err(e) => debug!(event = "negotiation_failure_skipped", error = %e),
    }
  }

  async fn deliver(&self, message: Message, now: DateTime<Utc>) {
    match &message.recipient {
      Recipient::Agent(recipient) => {
        let record = HostRecord::Deliver {
          message: message.clone(),
        };
        match self.registry.send_event(recipient, &record).await {
          Ok(()) => {
            self
              .ledger
              .record(self.router.delivered_event(&message), now);
          }
          Err(e) => {
            warn!(event = "delivery_failed", id = %message.id, recipient = %recipient, error = %e);
            self
              .ledger
              .record(self.router.dropped_event(&message, e.to_string()), now);
          }
        }
      }
      Recipient::Broadcast => {
        for id in self.registry.agent_ids() {
          if id == message.sender {
            continue;
          }
          let record = HostRecord::Deliver {
            message: message.clone(),
          };
          if let Err(e) = self.registry.send_event(&id, &record).await {
            debug!(event = "broadcast_skip", recipient = %id, error = %e);
          }
        }
        self
          .ledger
          .record(self.router.delivered_event(&message), now);
      }
    }
  }

  fn queue_send(&self, agent: AgentId, record: HostRecord) {
    self.outbox.lock().push((agent, record));
  }

  fn queue_notices(&self, notices: Vec<Notice>) {
    for notice in notices {
      let (agent, record) = match notice {
        Notice::Granted {
          resource,
          agent,
          expires_at,
        } => (
          agent,
          HostRecord::LeaseGranted {
            resource,
            expires_at_ms: expires_at.timestamp_millis() as u64,
          },
        ),
        Notice::Deferred {
          resource,
          agent,
          retry_after,
        } => (
          agent,
          HostRecord::LeaseDeferred {
            resource,
            retry_after_ms: retry_after.as_millis() as u64,
          },
        ),
        Notice::Revoked { resource, agent } | Notice::Expired { resource, agent } => {
          (agent, HostRecord::LeaseRevoked { resource })
        }
        Notice::Escalated {
          resource,
          agent,
          reason,
        } => (agent, HostRecord::LeaseEscalated { resource, reason }),
        Notice::Denied { resource, agent } => (agent, HostRecord::LeaseDenied { resource }),
      };
      self.queue_send(agent, record);
    }
  }

  async fn flush_outbox(&self) {
    let jobs: Vec<(AgentId, HostRecord)> = std::mem::take(&mut *self.outbox.lock());
    for (agent, record) in jobs {
      if let Err(e) = self.registry.send_event(&agent, &record).await {
        debug!(event = "outbox_send_skipped", agent = %agent, error = %e);
      }
    }
  }
}
