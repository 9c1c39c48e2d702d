//! Error types for the folio engine.
//!
//! A single [`Error`] enum covers every failure mode, from socket-level
//! transport problems up to commit-pipeline violations. Callers usually only
//! care about a handful of variants ([`Error::ConcurrentChange`] for retry
//! loops, [`Error::UnknownRec`] for missing records); everything else is
//! propagated unchanged to the host platform.
//!
//! ## Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Wire | `Transport`, `Protocol`, `Remote` | discard the session, retry on a fresh one |
//! | Lookup | `UnknownRec` | treat as absent |
//! | Commit | `AlreadyExists`, `ConcurrentChange`, `Commit` | re-read and retry, or surface to the caller |
//! | History | `HisConfig` | fix the point record's configuration |
//! | Local | `Encoding`, `PoolClosed`, `Unsupported` | log / propagate |
//!
//! Transport and protocol errors poison the wire session that produced them;
//! the pool closes and replaces poisoned clients. A `Remote` error leaves the
//! session usable except inside a transaction, where the queue must be rolled
//! back first.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Ref;

/// All errors that can occur in folio operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure: connect, timeout, or unexpected EOF.
    ///
    /// The wire session that produced this is poisoned and must be discarded.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server sent a frame the client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    ///
    /// Carries the server's message verbatim (e.g. `WRONGTYPE ...`).
    #[error("server error: {0}")]
    Remote(String),

    /// The id is not present in the record cache.
    #[error("unknown rec: {0}")]
    UnknownRec(String),

    /// An `add` diff targeted an id that already exists.
    #[error("rec already exists: {0}")]
    AlreadyExists(Ref),

    /// Optimistic-concurrency failure: the record changed since it was read,
    /// or the storage transaction was aborted underneath the commit.
    ///
    /// Re-read the record and re-apply the change against the fresh `mod`.
    #[error("concurrent change on {id}: expected mod {expected:?}, found {actual:?}")]
    ConcurrentChange {
        id: String,
        expected: Option<DateTime<Utc>>,
        actual: Option<DateTime<Utc>>,
    },

    /// A diff is illegal in its context: reserved tags in the change set,
    /// transient combined with add/remove, remove of a nonexistent record.
    #[error("invalid commit: {0}")]
    Commit(String),

    /// A history operation targeted a record that is not configured as a
    /// historized point (missing `point`/`his` markers, `aux`, or trashed).
    #[error("his config on {id}: {reason}")]
    HisConfig { id: String, reason: String },

    /// A persisted record failed to decode.
    ///
    /// During startup this is swallowed per record: the id is dropped from
    /// the cache for the session and the failure is logged.
    #[error("encoding error at line {line}: {msg}")]
    Encoding { line: usize, msg: String },

    /// Checkout was attempted on a closed connection pool.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The requested operation is not supported by this storage engine.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownRec("a-1".to_string());
        assert_eq!(err.to_string(), "unknown rec: a-1");

        let err = Error::AlreadyExists(Ref::new("a-1"));
        assert_eq!(err.to_string(), "rec already exists: a-1");

        let err = Error::HisConfig {
            id: "p-1".to_string(),
            reason: "missing his marker".to_string(),
        };
        assert_eq!(err.to_string(), "his config on p-1: missing his marker");

        let err = Error::Encoding {
            line: 3,
            msg: "unterminated string".to_string(),
        };
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("transport error"));
    }
}
