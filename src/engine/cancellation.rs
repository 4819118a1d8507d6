use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::CANCELLATIONS_TOTAL;

use super::{Engine, EngineError};

impl Engine {
    /// Cancel a booking owned by `requester_id`.
    ///
    /// Cancelling an already cancelled booking returns it unchanged. A confirmed
    /// booking can only be cancelled while at least `min_cancellation_notice`
    /// remains before its start.
    pub async fn cancel_booking(&self, booking_id: Ulid, requester_id: Ulid) -> Result<Booking, EngineError> {
        let result = self.cancel(booking_id, requester_id).await;
        let outcome = match &result {
            Ok(_) => "cancelled",
            Err(EngineError::CancellationTooLate { .. }) => "too_late",
            Err(_) => "rejected",
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn cancel(&self, booking_id: Ulid, requester_id: Ulid) -> Result<Booking, EngineError> {
        info!("cancelling booking {booking_id} for {requester_id}");
        let booking = self
            .store
            .find_by_id(&booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;

        if booking.owner_id != requester_id {
            return Err(EngineError::Unauthorized {
                requester: requester_id,
                owner: booking.owner_id,
            });
        }

        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }

        let remaining = booking.span.start - self.clock.now();
        let notice = self.config.min_cancellation_notice;
        if remaining < notice {
            return Err(EngineError::CancellationTooLate { notice, remaining });
        }

        let cancelled = self
            .store
            .save(&Booking {
                status: BookingStatus::Cancelled,
                ..booking
            })
            .await?;
        info!("booking {booking_id} cancelled");
        Ok(cancelled)
    }
}
