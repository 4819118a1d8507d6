use ulid::Ulid;

use crate::model::{MINUTE_MS, Ms};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Unauthorized { requester: Ulid, owner: Ulid },
    InvalidRequest(String),
    ResourceNotFound(Ulid),
    NotFound(Ulid),
    ResourceUnavailable(String),
    CancellationTooLate { notice: Ms, remaining: Ms },
    ServiceUnavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Unauthorized { requester, owner } => {
                write!(f, "user {requester} is not authorized to act for user {owner}")
            }
            EngineError::InvalidRequest(reason) => write!(f, "invalid reservation: {reason}"),
            EngineError::ResourceNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::ResourceUnavailable(reason) => write!(f, "vehicle unavailable: {reason}"),
            EngineError::CancellationTooLate { notice, remaining } => write!(
                f,
                "cancellation must be at least {} minutes before start time; {} minutes remaining",
                notice / MINUTE_MS,
                remaining / MINUTE_MS
            ),
            EngineError::ServiceUnavailable(e) => {
                write!(f, "service temporarily unavailable, try again later: {e}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::ServiceUnavailable(e.to_string())
    }
}
