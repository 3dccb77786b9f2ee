mod replay;

pub use replay::{ReplayState, replay};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::domain::event::{EventRecord, LogEvent};

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

struct LedgerInner {
  seq: u64,
  file: File,
}

/// Append-only JSONL event log: one record per state transition, with a
/// monotonic sequence number. Records are serialized from owned copies, so
/// callers never hold their state locks while the line is written. A failed
/// write is retried once and then logged; in-memory state stays
/// authoritative either way.
pub struct Ledger {
  path: PathBuf,
  inner: Mutex<LedgerInner>,
}

impl Ledger {
  /// Open (or create) the ledger at `path`, continuing the sequence from
  /// the last persisted record.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let last_seq = if path.exists() {
      read_records(&path)?.last().map(|r| r.seq).unwrap_or(0)
    } else {
      0
    };
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Self {
      path,
      inner: Mutex::new(LedgerInner {
        seq: last_seq,
        file,
      }),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Append one event. Returns the stamped record.
  pub fn record(&self, event: LogEvent, now: DateTime<Utc>) -> EventRecord {
    let mut inner = self.inner.lock();
    inner.seq += 1;
    let record = EventRecord {
      seq: inner.seq,
      at: now,
      event,
    };
    match serde_json::to_string(&record) {
      Ok(line) => {
        if let Err(first) = write_line(&mut inner.file, &line) {
          warn!(event = "ledger_write_failed", error = %first, seq = record.seq, "retrying ledger append");
          if let Err(second) = write_line(&mut inner.file, &line) {
            warn!(event = "ledger_write_failed", error = %second, seq = record.seq, "ledger append dropped; memory stays authoritative");
          }
        }
      }
      Err(e) => {
        warn!(event = "ledger_serialize_failed", error = %e, seq = record.seq);
      }
    }
    record
  }

  /// Append a batch in order with one lock acquisition per record.
  pub fn record_all(&self, events: Vec<LogEvent>, now: DateTime<Utc>) -> Vec<EventRecord> {
    events.into_iter().map(|e| self.record(e, now)).collect()
  }

  /// Read every persisted record. Unparsable lines are skipped with a
  /// warning so one corrupt line cannot poison a replay.
  pub fn read_all(&self) -> Result<Vec<EventRecord>> {
    read_records(&self.path)
  }
}

fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
  file.write_all(line.as_bytes())?;
  file.write_all(b"\n")?;
  file.flush()
}

fn read_records(path: &Path) -> Result<Vec<EventRecord>> {
  let file = File::open(path)?;
  let reader = BufReader::new(file);
  let mut records = Vec::new();
  for (n, line) in reader.lines().enumerate() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<EventRecord>(&line) {
      Ok(r) => records.push(r),
      Err(e) => {
        warn!(event = "ledger_line_skipped", line_no = n + 1, error = %e);
      }
    }
  }
  Ok(records)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::lease::ResourceKey;
  use crate::domain::message::AgentId;

  #[test]
  fn sequence_numbers_are_monotonic_and_persisted() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("ledger.jsonl");
    let now = Utc::now();
    {
      let ledger = Ledger::open(&path).unwrap();
      let r1 = ledger.record(
        LogEvent::LeaseReleased {
          resource: ResourceKey::new("a"),
          agent: AgentId::from("x"),
        },
        now,
      );
      let r2 = ledger.record(
        LogEvent::LeaseReleased {
          resource: ResourceKey::new("b"),
          agent: AgentId::from("x"),
        },
        now,
      );
      assert_eq!(r1.seq, 1);
      assert_eq!(r2.seq, 2);
    }
    // Re-opening continues the sequence.
    let ledger = Ledger::open(&path).unwrap();
    let r3 = ledger.record(
      LogEvent::LeaseReleased {
        resource: ResourceKey::new("c"),
        agent: AgentId::from("x"),
      },
      now,
    );
    assert_eq!(r3.seq, 3);
    assert_eq!(ledger.read_all().unwrap().len(), 3);
  }

  #[test]
  fn corrupt_lines_are_skipped_on_read() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("ledger.jsonl");
    let ledger = Ledger::open(&path).unwrap();
    ledger.record(
      LogEvent::LeaseReleased {
        resource: ResourceKey::new("a"),
        agent: AgentId::from("x"),
      },
      Utc::now(),
    );
    // Corrupt the tail, then append another record.
    {
      let mut f = OpenOptions::new().append(true).open(&path).unwrap();
      f.write_all(b"{not json\n").unwrap();
    }
    ledger.record(
      LogEvent::LeaseReleased {
        resource: ResourceKey::new("b"),
        agent: AgentId::from("x"),
      },
      Utc::now(),
    );
    let records = ledger.read_all().unwrap();
    assert_eq!(records.len(), 2);
  }
}
