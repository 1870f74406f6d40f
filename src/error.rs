//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias
//! over [`Error`]. The variants mirror the tagged error kinds a caller at
//! the boundary (HTTP/RPC translation, outside this crate) needs to
//! distinguish; the core itself never panics on a recoverable condition.

use std::fmt;
use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Tagged error kinds, see spec §7.
#[derive(Error, Debug)]
pub enum Error {
    /// Schema mismatch, vector length mismatch, out-of-range search limit,
    /// or `search_size < k`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A point id already exists in the shard, or is duplicated within a
    /// batch.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A point or node id was requested but does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was attempted against a read-only transaction or bucket.
    /// `ReadBucket` exposes no `put`/`delete` today, so nothing in this
    /// crate constructs this variant yet; reserved for a future transport
    /// boundary that dispatches over transaction kind dynamically.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Point data or vector length exceeds a user-plan cap.
    #[error("plan exceeded: {0}")]
    PlanExceeded(String),

    /// A configured size limit (cache capacity, memory quota) is
    /// effectively zero where data is required to flow through it.
    #[error("quota: {0}")]
    Quota(String),

    /// Underlying disk store failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation observed at a checkpoint.
    #[error("cancelled")]
    Cancelled,

    /// An invariant violation that should never happen in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short, stable, machine-readable tag for this error's kind, meant for
    /// boundary translation into HTTP/RPC status codes.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid-argument",
            Error::AlreadyExists(_) => "already-exists",
            Error::NotFound(_) => "not-found",
            Error::ReadOnly(_) => "read-only",
            Error::PlanExceeded(_) => "plan-exceeded",
            Error::Quota(_) => "quota",
            Error::Io(_) => "io",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a caller can reasonably retry the same request without
    /// changing its input.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Cancelled | Error::Quota(_))
    }

    pub(crate) fn internal(msg: impl fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    pub(crate) fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub(crate) fn invalid_argument(msg: impl fmt::Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    pub(crate) fn already_exists(msg: impl fmt::Display) -> Self {
        Error::AlreadyExists(msg.to_string())
    }

    pub(crate) fn plan_exceeded(msg: impl fmt::Display) -> Self {
        Error::PlanExceeded(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(Error::InvalidArgument("x".into()).kind(), "invalid-argument");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(Error::ReadOnly("b".into()).kind(), "read-only");
    }

    #[test]
    fn recoverability_matches_kind() {
        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(io_err.is_recoverable());
        assert!(Error::Cancelled.is_recoverable());
        assert!(!Error::AlreadyExists("p1".into()).is_recoverable());
        assert!(!Error::Internal("oops".into()).is_recoverable());
    }
}
