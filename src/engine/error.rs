use thiserror::Error;
use ulid::Ulid;

use crate::model::{Reservation, ReservationStatus, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid range [{}, {}): {reason}", .span.start, .span.end)]
    InvalidRange { span: Span, reason: &'static str },
    #[error("invalid quantity {quantity}: {reason}")]
    InvalidQuantity { quantity: u32, reason: &'static str },
    #[error("capacity {capacity} exceeded: {available} unit(s) free, {requested} requested")]
    CapacityExceeded {
        capacity: u32,
        requested: u32,
        available: u32,
        /// Active reservations in the way, by start ascending.
        conflicts: Vec<Reservation>,
        has_more: bool,
    },
    #[error("reservation {id} is {status}: {reason}")]
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
        reason: &'static str,
    },
    #[error("reservation {id}: transition {from} -> {to} not allowed")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    /// Stable machine-readable code, used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "InvalidRange",
            EngineError::InvalidQuantity { .. } => "InvalidQuantity",
            EngineError::CapacityExceeded { .. } => "CapacityExceeded",
            EngineError::InvalidState { .. } => "InvalidState",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::NotFound(_) => "NotFound",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::LimitExceeded(_) => "LimitExceeded",
            EngineError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }

    /// Caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}
