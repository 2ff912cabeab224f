use chrono::{NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::model::RequestStatus;
use crate::store::StoreError;

/// Coarse classification callers use to decide whether to fix input,
/// re-query, or retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agenda must not be empty")]
    EmptyAgenda,
    #[error("start time {start} must be before end time {end}")]
    InvalidRange { start: NaiveTime, end: NaiveTime },
    #[error("slot starting at {starts_at} is in the past")]
    InThePast { starts_at: NaiveDateTime },
    #[error("meeting reference must not be blank")]
    EmptyReference,
    #[error("rejection reason must not be blank")]
    EmptyReason,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("slot {0} is no longer available")]
    SlotUnavailable(Ulid),
    #[error("slot {0} is already claimed")]
    AlreadyClaimed(Ulid),
    #[error("slot {0} is claimed and cannot be removed")]
    SlotInUse(Ulid),
    #[error("request {id} moved to {from} before it could become {to}")]
    InvalidTransition {
        id: Ulid,
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("request {id} is {status}, not pending")]
    NotPending { id: Ulid, status: RequestStatus },

    #[error("slot not found: {0}")]
    SlotNotFound(Ulid),
    #[error("request not found: {0}")]
    RequestNotFound(Ulid),

    #[error(transparent)]
    Store(StoreError),
    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Capacity(what) => EngineError::LimitExceeded(what),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::EmptyAgenda
            | EngineError::InvalidRange { .. }
            | EngineError::InThePast { .. }
            | EngineError::EmptyReference
            | EngineError::EmptyReason
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::SlotUnavailable(_)
            | EngineError::AlreadyClaimed(_)
            | EngineError::SlotInUse(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::NotPending { .. } => ErrorKind::Conflict,
            EngineError::SlotNotFound(_) | EngineError::RequestNotFound(_) => ErrorKind::NotFound,
            EngineError::Store(_) | EngineError::Aborted(_) => ErrorKind::Store,
        }
    }

    /// Stable machine-readable name, e.g. for metric labels and client branching.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::EmptyAgenda => "empty_agenda",
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::InThePast { .. } => "in_the_past",
            EngineError::EmptyReference => "empty_reference",
            EngineError::EmptyReason => "empty_reason",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::AlreadyClaimed(_) => "already_claimed",
            EngineError::SlotInUse(_) => "slot_in_use",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotPending { .. } => "not_pending",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::RequestNotFound(_) => "request_not_found",
            EngineError::Store(_) => "store",
            EngineError::Aborted(_) => "aborted",
        }
    }
}
