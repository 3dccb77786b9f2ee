use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::domain::lease::ResourceKey;
use crate::domain::message::{Message, Priority};
use crate::domain::negotiation::{EscalateReason, Proposal};

/// Upper bound for one record line. Anything longer is discarded up to the
/// next newline and reported as malformed.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Kind of pause an agent reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
  /// A natural break: gated tiers may deliver now.
  NaturalBreak,
  /// A cooperative checkpoint: the agent is about to resume, Blocking and
  /// above may interrupt here.
  Checkpoint,
}

/// One structured record read from an agent process. The line tag selects
/// the variant; the JSON payload fills it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentRecord {
  Lifecycle {
    phase: String,
  },
  TaskStatus {
    state: String,
    #[serde(default)]
    detail: Option<String>,
  },
  LeaseRequest {
    resource: String,
    #[serde(default)]
    duration_secs: Option<u64>,
    #[serde(default)]
    priority: Option<Priority>,
  },
  LeaseRelease {
    resource: String,
  },
  LeaseRenew {
    resource: String,
    extension_secs: u64,
  },
  Progress {
    resource: String,
    fraction: f64,
  },
  Pause {
    kind: PauseKind,
    /// Milliseconds until the agent expects its next pause, if it knows.
    #[serde(default)]
    next_in_ms: Option<u64>,
  },
  Message {
    /// Recipient agent id; absent means broadcast.
    #[serde(default)]
    to: Option<String>,
    priority: Priority,
    body: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
  },
  Proposal(Proposal),
}

/// One structured record written to an agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostRecord {
  Deliver {
    message: Message,
  },
  /// Seeds a freshly assigned clone with its discussion and snapshot bytes
  /// (gzip JSON, base64 on the wire).
  Seed {
    purpose: String,
    #[serde(default)]
    discussion: Option<crate::domain::clone_session::DiscussionId>,
    snapshot_b64: String,
  },
  LeaseGranted {
    resource: ResourceKey,
    expires_at_ms: u64,
  },
  LeaseDeferred {
    resource: ResourceKey,
    retry_after_ms: u64,
  },
  LeaseRevoked {
    resource: ResourceKey,
  },
  LeaseEscalated {
    resource: ResourceKey,
    reason: EscalateReason,
  },
  LeaseDenied {
    resource: ResourceKey,
  },
  /// Admission denial; the sender may drop, requeue lower, or retry later.
  Throttled {
    retry_after_ms: u64,
  },
  Shutdown,
}

fn tag_of(record: &AgentRecord) -> &'static str {
  match record {
    AgentRecord::Lifecycle { .. } => "lifecycle",
    AgentRecord::TaskStatus { .. } => "task-status",
    AgentRecord::LeaseRequest { .. } => "lease-request",
    AgentRecord::LeaseRelease { .. } => "lease-release",
    AgentRecord::LeaseRenew { .. } => "lease-renew",
    AgentRecord::Progress { .. } => "progress",
    AgentRecord::Pause { .. } => "pause",
    AgentRecord::Message { .. } => "message",
    AgentRecord::Proposal(_) => "proposal",
  }
}

fn host_tag(record: &HostRecord) -> &'static str {
  match record {
    HostRecord::Deliver { .. } => "deliver",
    HostRecord::Seed { .. } => "seed",
    HostRecord::LeaseGranted { .. } => "lease-granted",
    HostRecord::LeaseDeferred { .. } => "lease-deferred",
    HostRecord::LeaseRevoked { .. } => "lease-revoked",
    HostRecord::LeaseEscalated { .. } => "lease-escalated",
    HostRecord::LeaseDenied { .. } => "lease-denied",
    HostRecord::Throttled { .. } => "throttled",
    HostRecord::Shutdown => "shutdown",
  }
}

/// Serialize a host record as one `%tag json` line, newline-terminated.
pub fn encode_host(record: &HostRecord) -> String {
  // Externally tagged JSON would nest the variant; strip to the payload only
  // since the line tag already names it.
  let value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
  let payload = match value {
    serde_json::Value::Object(map) if map.len() == 1 => {
      map.into_iter().next().map(|(_, v)| v).unwrap_or(serde_json::Value::Null)
    }
    other => other,
  };
  format!("%{} {}\n", host_tag(record), payload)
}

/// Serialize an agent record the way a well-behaved agent process would.
/// Used by tests and by clone seeding round-trips.
pub fn encode_agent(record: &AgentRecord) -> String {
  let value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
  let payload = match value {
    serde_json::Value::Object(map) if map.len() == 1 => {
      map.into_iter().next().map(|(_, v)| v).unwrap_or(serde_json::Value::Null)
    }
    other => other,
  };
  format!("%{} {}\n", tag_of(record), payload)
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeItem {
  Record(AgentRecord),
  /// Unparsable or oversized line; dropped after logging by the caller.
  Malformed { reason: String },
}

/// Incremental line-record decoder. Framing is never trusted: bytes arrive
/// in arbitrary chunks, so partial lines are carried until their newline
/// shows up or the size cap trips.
#[derive(Debug, Default)]
pub struct FrameDecoder {
  buf: BytesMut,
  discarding: bool,
}

impl FrameDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed bytes, returning every record completed by this chunk.
  pub fn push(&mut self, data: &[u8]) -> Vec<DecodeItem> {
    self.buf.extend_from_slice(data);
    let mut out = Vec::new();

    loop {
      let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
        if self.buf.len() > MAX_RECORD_BYTES && !self.discarding {
          self.discarding = true;
          self.buf.clear();
          out.push(DecodeItem::Malformed {
            reason: format!("record exceeds {} bytes", MAX_RECORD_BYTES),
          });
        }
        break;
      };
      let line = self.buf.split_to(nl + 1);
      if self.discarding {
        // Tail of an oversized record; already reported.
        self.discarding = false;
        continue;
      }
      let line = &line[..line.len() - 1];
      if line.is_empty() {
        continue;
      }
      match parse_line(line) {
        Ok(record) => out.push(DecodeItem::Record(record)),
        Err(reason) => out.push(DecodeItem::Malformed { reason }),
      }
    }

    out
  }

  /// Bytes currently buffered waiting for a newline.
  pub fn pending(&self) -> usize {
    self.buf.len()
  }
}

fn parse_line(line: &[u8]) -> Result<AgentRecord, String> {
  let text = std::str::from_utf8(line).map_err(|e| format!("not utf-8: {}", e))?;
  let rest = text
    .strip_prefix('%')
    .ok_or_else(|| format!("missing `%` tag prefix: {:?}", truncated(text)))?;
  let (tag, payload) = rest
    .split_once(' ')
    .ok_or_else(|| format!("missing payload: {:?}", truncated(text)))?;

  // Re-wrap the payload under its externally tagged variant name.
  let variant = match tag {
    "lifecycle" => "Lifecycle",
    "task-status" => "TaskStatus",
    "lease-request" => "LeaseRequest",
    "lease-release" => "LeaseRelease",
    "lease-renew" => "LeaseRenew",
    "progress" => "Progress",
    "pause" => "Pause",
    "message" => "Message",
    "proposal" => "Proposal",
    other => return Err(format!("unknown tag `{}`", other)),
  };
  let payload: serde_json::Value =
    serde_json::from_str(payload).map_err(|e| format!("bad json for `{}`: {}", tag, e))?;
  let wrapped = serde_json::json!({ variant: payload });
  serde_json::from_value(wrapped).map_err(|e| format!("bad `{}` record: {}", tag, e))
}

fn truncated(s: &str) -> String {
  const KEEP: usize = 48;
  match s.char_indices().nth(KEEP) {
    Some((idx, _)) => format!("{}…", &s[..idx]),
    None => s.to_string(),
  }
}
