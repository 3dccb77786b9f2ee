use serde::{Deserialize, Serialize};

use crate::clones::PoolStats;
use crate::domain::clone_session::EscalationId;
use crate::domain::lease::LeaseState;
use crate::domain::message::Priority;
use crate::domain::negotiation::DirectorVerdict;
use crate::routing::dispatch::RouterStatus;
use crate::territory::Escalation;

/// Response type for daemon.status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DaemonStatus {
  pub version: String,
  pub pid: u32,
  pub socket_path: String,
}

// ---- Message routing DTOs ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct MessageSendParams {
  /// Recipient agent id; absent means broadcast.
  #[serde(default)]
  pub to: Option<String>,
  pub priority: Priority,
  pub body: String,
  #[serde(default)]
  pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MessageSendResult {
  pub id: String,
}

// ---- Territory DTOs ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct LeaseInfo {
  pub resource: String,
  #[serde(default)]
  pub holder: Option<String>,
  pub state: LeaseState,
  #[serde(default)]
  pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
  pub progress: f64,
  pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TerritoryStatusResult {
  pub leases: Vec<LeaseInfo>,
  pub queues: RouterStatus,
  pub pool: PoolStats,
  pub clone_sessions: usize,
}

// ---- Escalation DTOs ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EscalationListResult {
  pub escalations: Vec<Escalation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EscalationResolveParams {
  pub id: EscalationId,
  pub verdict: DirectorVerdict,
}

// ---- Agent lifecycle DTOs ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentStartParams {
  /// Key into the configured agent command table.
  pub agent: String,
  /// Identity the process registers under; defaults to the agent key.
  #[serde(default)]
  pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentStartResult {
  pub id: String,
}
