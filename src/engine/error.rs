use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another confirmed booking (plus buffer) intersects the candidate.
    SlotTaken,
    /// The consultant's commit lock was not acquired within `commit_timeout`.
    Timeout,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::SlotTaken => "slot_taken",
            ConflictReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict ({}) for consultant {consultant_id}", reason.as_str())]
    Conflict {
        consultant_id: Ulid,
        reason: ConflictReason,
        /// The booking that holds the time, when known.
        blocking: Option<Ulid>,
    },
    #[error("version conflict on booking {id}: expected {expected}, current {actual}")]
    VersionConflict { id: Ulid, expected: u64, actual: u64 },
    #[error("invalid transition for booking {id}: {from} -> {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("calendar sync: {0}")]
    Sync(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }

    /// Classes where refreshing state and trying again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::VersionConflict { .. } | EngineError::Sync(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { reason, .. } => reason.as_str(),
            EngineError::VersionConflict { .. } => "version_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Sync(_) => "sync",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "wal",
        }
    }
}
