use std::time::Instant;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{self, ADMISSION_DURATION_SECONDS, ADMISSION_RETRIES_TOTAL};
use crate::store::InsertError;

use super::{validate_slot, Engine, EngineError};

impl Engine {
    /// Book `[start, end)` on a vehicle for `owner_id`, on behalf of `requester_id`.
    ///
    /// The overlap reads are a fast path only. The store's exclusion check at
    /// insert time decides. Read-time overlaps and transient write conflicts
    /// draw from one budget of `max_attempts`. Store access failures are
    /// returned at once without touching that budget.
    ///
    /// Dropping the returned future during a backoff abandons the request;
    /// no further attempt is made.
    pub async fn create_booking(
        &self,
        resource_id: Ulid,
        requester_id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .admit(resource_id, requester_id, owner_id, start, end)
            .await;
        metrics::histogram!(ADMISSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1),
            Err(e) => metrics::counter!(
                observability::BOOKING_REJECTIONS_TOTAL,
                "reason" => observability::error_label(e)
            )
            .increment(1),
        }
        result
    }

    async fn admit(
        &self,
        resource_id: Ulid,
        requester_id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        if requester_id != owner_id {
            return Err(EngineError::Unauthorized {
                requester: requester_id,
                owner: owner_id,
            });
        }

        info!("creating booking on {resource_id} for {owner_id}: [{start}, {end})");
        validate_slot(start, end, self.clock.now(), &self.config)?;
        let span = Span::new(start, end);

        if !self.store.resource_exists(&resource_id).await.inspect_err(log_access)? {
            return Err(EngineError::ResourceNotFound(resource_id));
        }

        if self.store.has_overlap(&resource_id, &span).await.inspect_err(log_access)? {
            return Err(EngineError::ResourceUnavailable(
                "the vehicle is already booked for an overlapping time slot".into(),
            ));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;
        loop {
            if self.store.has_overlap(&resource_id, &span).await.inspect_err(log_access)? {
                attempts += 1;
                if attempts >= max_attempts {
                    warn!("overlap on {resource_id} persisted through {attempts} attempts");
                    return Err(EngineError::ResourceUnavailable(
                        "the vehicle is already booked for an overlapping time slot".into(),
                    ));
                }
                self.backoff(attempts, "overlap").await;
                continue;
            }

            let new = NewBooking {
                resource_id,
                owner_id,
                span,
            };
            match self.store.insert_confirmed(new).await {
                Ok(booking) => {
                    info!("booking {} confirmed on {resource_id}", booking.id);
                    return Ok(booking);
                }
                Err(InsertError::ExclusionViolation { conflicting }) => {
                    debug!("insert on {resource_id} lost race to booking {conflicting}");
                    return Err(EngineError::ResourceUnavailable(
                        "another reservation overlaps the requested time slot".into(),
                    ));
                }
                Err(InsertError::TransientConflict(reason)) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        warn!(
                            "giving up on {resource_id} after {attempts} transient conflicts: {reason}"
                        );
                        return Err(EngineError::ResourceUnavailable(
                            "persistent conflict, try again later".into(),
                        ));
                    }
                    debug!("transient conflict on attempt {attempts} for {resource_id}: {reason}");
                    self.backoff(attempts, "transient").await;
                }
                Err(InsertError::Access(e)) => {
                    log_access(&e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, cause: &'static str) {
        let delay = self.config.backoff_for(attempt);
        metrics::counter!(ADMISSION_RETRIES_TOTAL, "cause" => cause).increment(1);
        debug!("backing off {delay:?} before attempt {}", attempt + 1);
        tokio::time::sleep(delay).await;
    }
}

fn log_access(e: &crate::store::StoreError) {
    error!("store access failed during admission: {e}");
}
