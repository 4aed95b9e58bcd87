use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Engine failures are values, not control flow: the transport layer
/// renders each variant directly, so every variant carries the state an
/// actionable message needs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("this item is not tracked")]
    NotTracked,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid quantity; use a positive number or \"all\"")]
    InvalidQuantity,

    #[error("nothing available to claim")]
    NothingAvailable,

    #[error("only {remaining} remaining")]
    InsufficientStock { remaining: i32 },

    #[error("you already have active claims on this item; cancel first, then claim again")]
    DuplicateActiveClaim,

    #[error("no active claims on this item")]
    NoActiveClaims,

    #[error("cancellation window of {window_minutes} minutes has passed; contact the admin")]
    CancelWindowExpired { window_minutes: i64 },

    #[error("event {event} is not allowed from state {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("address format not recognised; all five fields are required")]
    InvalidAddress,

    #[error("tracking number not recognised")]
    InvalidTracking,

    #[error("inventory invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl EngineError {
    /// Transaction-level failures the caller may retry once with the same
    /// inputs. Claim revival keeps such retries idempotent-safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                _
            )) | EngineError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::ClosedConnection,
                _
            ))
        )
    }
}
