mod durable;

pub use durable::DurableStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Booking, NewBooking, Resource, Span};

/// The shared store every engine instance coordinates through.
///
/// Implementations own the exclusion invariant: `insert_confirmed` must refuse
/// a booking that overlaps a confirmed one on the same resource, no matter
/// what the caller checked beforehand.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn resource_exists(&self, id: &Ulid) -> Result<bool, StoreError>;

    async fn get_resource(&self, id: &Ulid) -> Result<Option<Resource>, StoreError>;

    /// Half-open overlap against CONFIRMED bookings only:
    /// `existing.start < span.end && existing.end > span.start`.
    async fn has_overlap(&self, resource_id: &Ulid, span: &Span) -> Result<bool, StoreError>;

    /// Atomically write a CONFIRMED booking, assigning its id and creation time.
    async fn insert_confirmed(&self, booking: NewBooking) -> Result<Booking, InsertError>;

    async fn find_by_id(&self, id: &Ulid) -> Result<Option<Booking>, StoreError>;

    /// Persist a status change. Interval, owner and resource are immutable.
    async fn save(&self, booking: &Booking) -> Result<Booking, StoreError>;

    /// Resources with no confirmed booking overlapping `span`,
    /// ordered by make, model, license plate.
    async fn available_resources(&self, span: &Span) -> Result<Vec<Resource>, StoreError>;
}

/// Store access failures. None of these say anything about slot availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Timeout(String),
    Unavailable(String),
    Io(String),
    Duplicate(Ulid),
    ResourceMissing(Ulid),
    BookingMissing(Ulid),
    InvalidTransition(Ulid),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout(op) => write!(f, "store timed out during {op}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Io(e) => write!(f, "WAL error: {e}"),
            StoreError::Duplicate(id) => write!(f, "already exists: {id}"),
            StoreError::ResourceMissing(id) => write!(f, "resource not found: {id}"),
            StoreError::BookingMissing(id) => write!(f, "booking not found: {id}"),
            StoreError::InvalidTransition(id) => {
                write!(f, "booking {id}: cancelled bookings cannot change status")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome tags of a failed `insert_confirmed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// The exclusion invariant rejected the write. Definitive.
    ExclusionViolation { conflicting: Ulid },
    /// Coordination failure (lock wait, serialization). May succeed on retry.
    TransientConflict(String),
    Access(StoreError),
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertError::ExclusionViolation { conflicting } => {
                write!(f, "exclusion violation: overlaps booking {conflicting}")
            }
            InsertError::TransientConflict(e) => write!(f, "transient conflict: {e}"),
            InsertError::Access(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InsertError {}

impl From<StoreError> for InsertError {
    fn from(e: StoreError) -> Self {
        InsertError::Access(e)
    }
}
