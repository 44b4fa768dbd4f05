use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("unknown or inactive practitioner: {0}")]
    UnknownPractitioner(Ulid),
    #[error("unknown subject: {0}")]
    UnknownSubject(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("scheduling conflict with booking {booking_id} [{}, {})", .span.start, .span.end)]
    SchedulingConflict { booking_id: Ulid, span: Span },
    #[error("booking {id}: cannot go from {from} to {to}")]
    InvalidStateTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "22023",
            EngineError::UnknownPractitioner(_)
            | EngineError::UnknownSubject(_)
            | EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::SchedulingConflict { .. } => "23P01",
            EngineError::InvalidStateTransition { .. } => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}
