//! # folio-redis — tag-oriented record store over a Redis keyspace
//!
//! A storage engine for a building-automation platform's generic record API:
//! semi-structured records (dicts of name→value tags) identified by opaque
//! refs, queried by tag predicates, and — for records marked as historized
//! points — carrying time-series samples in per-record sorted sets.
//!
//! The engine provides:
//!
//! - **Atomic multi-record commits**: every batch persists in one
//!   transactional round-trip covering the record hashes, the all-records
//!   set, the tag-index deltas, and the version counter.
//! - **A hot read cache**: every record lives in memory; reads never touch
//!   the wire and never block behind writers.
//! - **Secondary tag indexes**: single-tag queries resolve candidates from
//!   the tag's index instead of scanning.
//! - **Optimistic concurrency**: non-force updates carry the `mod` stamp
//!   they were read at; lost updates fail with `ConcurrentChange`.
//! - **Per-record time-series**: bulk ingestion with range clears, span
//!   reads with boundary continuity, and transient summary tags.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Callers                                │
//! │     reads (lock-free, cache)      commits (async, batched)      │
//! └───────────────┬───────────────────────────┬─────────────────────┘
//!                 │                           │
//!                 ▼                           ▼
//!        ┌────────────────┐          ┌────────────────┐
//!        │  RecordStore   │          │  write actor   │
//!        │  cache+indexes │◄─────────│  (one thread)  │
//!        └────────────────┘  apply   └───────┬────────┘
//!                 ▲                          │ MULTI/EXEC
//!                 │ summary tags             ▼
//!        ┌────────┴───────┐          ┌────────────────┐
//!        │  HistoryStore  │─────────►│    ConnPool    │
//!        │  (sorted sets) │  borrow  │  (WireClients) │
//!        └────────────────┘          └───────┬────────┘
//!                                            ▼
//!                                    ┌────────────────┐
//!                                    │ Redis keyspace │
//!                                    └────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. A record's `id` tag equals its cache key.
//! 2. Cache, record hash, and tag indexes agree after every commit; the
//!    transactional boundary means a failed commit changes nothing.
//! 3. `mod` strictly increases per record; the version counter advances by
//!    exactly one per non-transient commit batch.
//! 4. History items are unique per timestamp with last-write-wins.
//!
//! ## Storage layout
//!
//! | Key | Type | Payload |
//! |-----|------|---------|
//! | `rec:{id}` | hash | `trio` = encoded record, `mod` = stamp millis |
//! | `idx:all` | set | id of every non-destroyed record |
//! | `idx:tag:{name}` | set | ids of records carrying tag `name` |
//! | `his:{id}` | sorted set | score = ts millis, value = encoded item |
//! | `meta:version` | string | decimal counter ≥ 1 |
//!
//! ## Example
//!
//! ```rust,ignore
//! use folio_redis::{Diff, Dict, Filter, FolioConfig, ReadOpts, RecordStore, Ref};
//!
//! #[tokio::main]
//! async fn main() -> folio_redis::Result<()> {
//!     let store = RecordStore::open(
//!         FolioConfig::new("demo").endpoint("redis://localhost:6379/0")?,
//!     )?;
//!
//!     let rec = store
//!         .commit_one(Diff::add(
//!             Ref::new("site-1"),
//!             Dict::new().set_marker("site").set("dis", "Headquarters"),
//!         ))
//!         .await?;
//!
//!     let sites = store.read_all(&Filter::has("site"), &ReadOpts::default());
//!     println!("{} sites, version {}", sites.len(), store.cur_ver());
//!
//!     let _ = rec;
//!     store.close().await;
//!     Ok(())
//! }
//! ```

/// Error types for all engine operations.
pub mod error;

/// Domain types: refs, tag values, dicts, diffs, spans, history items.
pub mod types;

/// Line-oriented textual codec for record dicts.
pub mod trio;

/// Filter adapter and history value-kind checks.
pub mod filter;

/// Wire session to the remote keyspace: framing, transactions, pipelining.
pub mod wire;

/// Bounded pool of wire sessions.
pub mod pool;

/// Store configuration, endpoint parsing, and host hook slots.
pub mod config;

/// The record store: cache, interning, reads, query planning, commits.
pub mod store;

/// Per-record time-series storage.
pub mod his;

mod writer;

pub use config::{CommitEvent, Endpoint, FolioConfig, HisWriteEvent, Hooks};
pub use error::{Error, Result};
pub use filter::Filter;
pub use his::HistoryStore;
pub use pool::ConnPool;
pub use store::RecordStore;
pub use types::{
    Coord, Dict, Diff, HisItem, HisReadOpts, HisWriteOpts, HisWriteResult, Number, ReadOpts,
    Ref, Span, TagVal,
};
pub use wire::{Reply, WireClient};
