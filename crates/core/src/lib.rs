//! Core library for the Conclave orchestration daemon.
//!
//! Routes messages between local agent processes under five priority tiers
//! with per-sender token-bucket admission and pause-point delivery,
//! arbitrates resource claims through negotiable leases, and runs
//! short-lived clone delegate sessions that negotiate conflicts without
//! blocking their parents. Every state transition lands in an append-only
//! JSONL ledger suitable for deterministic replay.
//!
//! Quick start:
//! - Build the core with `Core::new(config, project_root)`.
//! - Serve it with `daemon::start(core, &socket_path)` — a JSON-RPC surface
//!   over a Unix socket exposing `daemon.status`, `message.send`,
//!   `territory.status`, `escalation.list`/`escalation.resolve`, and
//!   `agent.start`.
//! - Agent processes speak newline-framed `%tag json` records on stdio; see
//!   `adapters::frame`.

pub mod adapters;
pub mod clones;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod ledger;
pub mod logging;
pub mod routing;
pub mod rpc;
pub mod territory;

pub use daemon::Core;
