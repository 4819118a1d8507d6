mod admission;
mod cancellation;
mod error;
mod validate;

pub use error::EngineError;
pub use validate::validate_slot;

use std::sync::Arc;

use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::store::BookingStore;

/// Admission and cancellation of vehicle bookings.
///
/// Holds no booking state of its own. Every decision is made against the
/// store, so any number of engines may share one store concurrently.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Vehicles free for the whole of `[start, end)`.
    pub async fn available_resources(&self, start: Ms, end: Ms) -> Result<Vec<Resource>, EngineError> {
        validate_slot(start, end, self.clock.now(), &self.config)?;
        let free = self.store.available_resources(&Span::new(start, end)).await?;
        tracing::debug!("{} vehicles free in [{start}, {end})", free.len());
        Ok(free)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store
            .find_by_id(&id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }
}
