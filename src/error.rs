use thiserror::Error;

use crate::model::Id;

/// Every failure a scheduling operation can surface to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// Malformed or out-of-range input. Raised before any transaction opens.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    /// A requested court is already committed for an overlapping time.
    #[error("court {court_id} is already booked by reservation {reservation_id} for that time")]
    Conflict { court_id: Id, reservation_id: Id },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Id },
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl SchedulingError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        SchedulingError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: Id) -> Self {
        SchedulingError::NotFound { entity, id }
    }

    /// HTTP status the boundary layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulingError::Validation { .. } => 400,
            SchedulingError::Forbidden(_) => 403,
            SchedulingError::NotFound { .. } => 404,
            SchedulingError::Conflict { .. } => 409,
            SchedulingError::LimitExceeded(_) => 422,
            SchedulingError::Storage(_) => 500,
            SchedulingError::Timeout(_) => 504,
        }
    }

    /// Storage and timeout failures are opaque to callers.
    pub fn is_internal(&self) -> bool {
        matches!(self, SchedulingError::Storage(_) | SchedulingError::Timeout(_))
    }
}
