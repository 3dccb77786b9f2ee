use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::adapters::frame::PauseKind;
use crate::domain::message::{AgentId, Priority};

/// What the gate knows about a recipient's next safe delivery moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausePoint {
  /// The recipient reported a natural break and has not resumed since.
  Available,
  /// The recipient estimated its next break.
  At(DateTime<Utc>),
  /// No adapter state for this recipient yet.
  Unknown,
}

#[derive(Debug, Clone)]
struct RecipientState {
  paused: bool,
  next_expected: Option<DateTime<Utc>>,
}

/// Pause-point delivery gate. Info/Coordinate delivery waits for a reported
/// natural break; Blocking and above bypass the gate entirely and interrupt
/// cooperatively at the recipient's next self-defined checkpoint.
///
/// Reads vastly outnumber writes (every dispatch tick consults the gate), so
/// the table sits behind a read-write lock.
#[derive(Default)]
pub struct PauseGate {
  inner: RwLock<HashMap<AgentId, RecipientState>>,
}

impl PauseGate {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a pause notification from the adapter.
  pub fn record_pause(
    &self,
    agent: &AgentId,
    kind: PauseKind,
    next_in_ms: Option<u64>,
    now: DateTime<Utc>,
  ) {
    let mut inner = self.inner.write();
    let state = inner.entry(agent.clone()).or_insert(RecipientState {
      paused: false,
      next_expected: None,
    });
    match kind {
      PauseKind::NaturalBreak => {
        state.paused = true;
        state.next_expected = None;
      }
      PauseKind::Checkpoint => {
        // The agent is about to resume; it may tell us when it expects the
        // next break.
        state.paused = false;
        state.next_expected =
          next_in_ms.map(|ms| now + Duration::milliseconds(ms.min(i64::MAX as u64) as i64));
      }
    }
  }

  /// Any non-pause activity from the agent means it resumed work.
  pub fn record_activity(&self, agent: &AgentId) {
    let mut inner = self.inner.write();
    if let Some(state) = inner.get_mut(agent) {
      state.paused = false;
    }
  }

  pub fn forget(&self, agent: &AgentId) {
    self.inner.write().remove(agent);
  }

  /// When can `recipient` next receive a gated message?
  pub fn next_pause(&self, recipient: &AgentId, now: DateTime<Utc>) -> PausePoint {
    let inner = self.inner.read();
    match inner.get(recipient) {
      None => PausePoint::Unknown,
      Some(state) if state.paused => PausePoint::Available,
      Some(state) => match state.next_expected {
        // A predicted break that has passed counts as available: the agent
        // said it would be interruptible by then.
        Some(t) if t <= now => PausePoint::Available,
        Some(t) => PausePoint::At(t),
        None => PausePoint::Unknown,
      },
    }
  }

  /// Gate check for one message tier. Blocking and above always pass; gated
  /// tiers need the recipient at a pause point. Recipients the adapter has
  /// never described are treated as not-ready for gated tiers.
  pub fn deliverable(&self, priority: Priority, recipient: &AgentId, now: DateTime<Utc>) -> bool {
    if !priority.is_gated() {
      return true;
    }
    matches!(self.next_pause(recipient, now), PausePoint::Available)
  }
}
