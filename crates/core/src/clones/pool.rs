use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::process::AgentRegistry;
use crate::config::CloneConfig;
use crate::domain::message::{AgentId, SenderRole};

#[derive(Debug, Error)]
pub enum PoolError {
  #[error("clone pool exhausted")]
  Exhausted,
  #[error("stale pool handle")]
  StaleHandle,
}

/// Index + generation pair addressing one pool slot. Generations make a
/// handle single-use: releasing bumps the generation, so a second release
/// or a use-after-release is rejected instead of touching a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
  index: usize,
  generation: u64,
}

#[derive(Debug)]
enum SlotState {
  Empty,
  Idle(AgentId),
  Leased(AgentId),
}

#[derive(Debug)]
struct Slot {
  generation: u64,
  state: SlotState,
}

/// Pre-warmed pool of clone processes: a bounded arena of reusable slots.
/// Spawn latency at session start is dominated by snapshotting because the
/// processes already exist; the replenisher tops the pool back up whenever
/// the idle count drops below the low-water mark.
pub struct ClonePool {
  cfg: CloneConfig,
  registry: Arc<AgentRegistry>,
  slots: Mutex<Vec<Slot>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
  pub idle: usize,
  pub leased: usize,
  pub target: usize,
}

impl ClonePool {
  pub fn new(cfg: CloneConfig, registry: Arc<AgentRegistry>) -> Self {
    Self {
      cfg,
      registry,
      slots: Mutex::new(Vec::new()),
    }
  }

  /// Take an idle process. Callers own the handle until `release`.
  pub fn acquire(&self) -> Result<(PoolHandle, AgentId), PoolError> {
    let mut slots = self.slots.lock();
    for (index, slot) in slots.iter_mut().enumerate() {
      if let SlotState::Idle(agent) = &slot.state {
        let agent = agent.clone();
        slot.state = SlotState::Leased(agent.clone());
        return Ok((
          PoolHandle {
            index,
            generation: slot.generation,
          },
          agent,
        ));
      }
    }
    Err(PoolError::Exhausted)
  }

  /// Return a slot after its session ended. The process is torn down — a
  /// seeded clone has a contaminated context and is never reused — and the
  /// slot waits for the replenisher.
  pub fn release(&self, handle: PoolHandle) -> Result<(), PoolError> {
    let agent = {
      let mut slots = self.slots.lock();
      let slot = slots.get_mut(handle.index).ok_or(PoolError::StaleHandle)?;
      if slot.generation != handle.generation {
        return Err(PoolError::StaleHandle);
      }
      let SlotState::Leased(agent) = &slot.state else {
        return Err(PoolError::StaleHandle);
      };
      let agent = agent.clone();
      slot.generation += 1;
      slot.state = SlotState::Empty;
      agent
    };
    // Process teardown happens after the slot lock is gone.
    self.registry.remove(&agent);
    Ok(())
  }

  /// Top the pool up to its target if the idle count fell below the
  /// low-water mark. Called from the service tick, never from the spawn
  /// path. Returns how many processes were started.
  pub fn replenish(&self) -> usize {
    let needed = {
      let slots = self.slots.lock();
      let idle = slots
        .iter()
        .filter(|s| matches!(s.state, SlotState::Idle(_)))
        .count();
      if idle >= self.cfg.pool_low_water {
        return 0;
      }
      self.cfg.pool_target - idle
    };

    let mut spawned = 0;
    for _ in 0..needed {
      let agent = AgentId::new(format!("clone:{}", Uuid::new_v4()));
      match self
        .registry
        .spawn(agent.clone(), SenderRole::Clone, &self.cfg.command)
      {
        Ok(_) => {
          let mut slots = self.slots.lock();
          if let Some(slot) = slots
            .iter_mut()
            .find(|s| matches!(s.state, SlotState::Empty))
          {
            slot.state = SlotState::Idle(agent);
          } else {
            slots.push(Slot {
              generation: 0,
              state: SlotState::Idle(agent),
            });
          }
          spawned += 1;
        }
        Err(e) => {
          warn!(event = "clone_pool_spawn_failed", error = %e, "stopping replenishment for this tick");
          break;
        }
      }
    }
    if spawned > 0 {
      debug!(event = "clone_pool_replenished", spawned);
    }
    spawned
  }

  pub fn stats(&self) -> PoolStats {
    let slots = self.slots.lock();
    PoolStats {
      idle: slots
        .iter()
        .filter(|s| matches!(s.state, SlotState::Idle(_)))
        .count(),
      leased: slots
        .iter()
        .filter(|s| matches!(s.state, SlotState::Leased(_)))
        .count(),
      target: self.cfg.pool_target,
    }
  }
}
