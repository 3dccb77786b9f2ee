use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

use crate::domain::clone_session::{SnapshotId, SnapshotKind};
use crate::domain::context::{AgentContext, ContextMutation};
use crate::domain::message::AgentId;

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("serialize: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("compress: {0}")]
  Io(#[from] std::io::Error),
  #[error("differential snapshot `{0}` does not extend base `{1}`")]
  BaseMismatch(SnapshotId, SnapshotId),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// The decompressed snapshot content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum SnapshotBody {
  Full {
    context: AgentContext,
  },
  Differential {
    base: SnapshotId,
    mutations: Vec<ContextMutation>,
    mutation_seq: u64,
  },
}

/// A point-in-time capture of a parent context: either the whole thing, or
/// the mutations accumulated since the last full capture. The payload is
/// gzip-compressed JSON, produced from a context copy with no lock held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub id: SnapshotId,
  pub parent: AgentId,
  pub kind: SnapshotKind,
  pub base: Option<SnapshotId>,
  pub taken_at: DateTime<Utc>,
  payload: Vec<u8>,
}

impl Snapshot {
  /// Full capture. The stored context starts a fresh mutation log, matching
  /// the live context after the caller's `note_full_snapshot`.
  pub fn full(parent: AgentId, context: &AgentContext, now: DateTime<Utc>) -> Result<Self> {
    let mut stored = context.clone();
    stored.note_full_snapshot();
    let payload = encode(&SnapshotBody::Full { context: stored })?;
    Ok(Self {
      id: SnapshotId::new(),
      parent,
      kind: SnapshotKind::Full,
      base: None,
      taken_at: now,
      payload,
    })
  }

  /// Differential capture against the last full snapshot.
  pub fn differential(
    parent: AgentId,
    base: SnapshotId,
    context: &AgentContext,
    now: DateTime<Utc>,
  ) -> Result<Self> {
    let payload = encode(&SnapshotBody::Differential {
      base,
      mutations: context.mutation_log.clone(),
      mutation_seq: context.mutation_seq,
    })?;
    Ok(Self {
      id: SnapshotId::new(),
      parent,
      kind: SnapshotKind::Differential,
      base: Some(base),
      taken_at: now,
      payload,
    })
  }

  pub fn payload_len(&self) -> usize {
    self.payload.len()
  }

  /// Wire form for seeding a clone process.
  pub fn payload_b64(&self) -> String {
    BASE64.encode(&self.payload)
  }

  fn body(&self) -> Result<SnapshotBody> {
    decode(&self.payload)
  }
}

/// Rebuild a context from a full snapshot plus its differentials, oldest
/// first. With zero differentials this reproduces the full capture exactly.
pub fn reconstruct(full: &Snapshot, diffs: &[&Snapshot]) -> Result<AgentContext> {
  let SnapshotBody::Full { context } = full.body()? else {
    return Err(SnapshotError::BaseMismatch(
      full.id,
      full.base.unwrap_or(full.id),
    ));
  };
  let mut context = context;
  for diff in diffs {
    let SnapshotBody::Differential {
      base,
      mutations,
      mutation_seq,
    } = diff.body()?
    else {
      return Err(SnapshotError::BaseMismatch(diff.id, full.id));
    };
    if base != full.id {
      return Err(SnapshotError::BaseMismatch(diff.id, full.id));
    }
    for m in mutations {
      context.entries.insert(m.key.clone(), m.value.clone());
      context.mutation_log.push(m);
    }
    context.mutation_seq = mutation_seq;
  }
  Ok(context)
}

fn encode(body: &SnapshotBody) -> Result<Vec<u8>> {
  let json = serde_json::to_vec(body)?;
  let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
  encoder.write_all(&json)?;
  Ok(encoder.finish()?)
}

fn decode(payload: &[u8]) -> Result<SnapshotBody> {
  let mut decoder = GzDecoder::new(payload);
  let mut json = Vec::new();
  decoder.read_to_end(&mut json)?;
  Ok(serde_json::from_slice(&json)?)
}
