use crate::config::EngineConfig;
use crate::model::{HOUR_MS, Ms};

use super::EngineError;

/// Check a candidate slot against the booking rules. First failing rule wins:
/// start strictly after `now`, end strictly after start, then duration bounds.
pub fn validate_slot(start: Ms, end: Ms, now: Ms, config: &EngineConfig) -> Result<(), EngineError> {
    if start <= now {
        return Err(EngineError::InvalidRequest(
            "start time must be in the future".into(),
        ));
    }
    if end <= start {
        return Err(EngineError::InvalidRequest(
            "end time must be after start time".into(),
        ));
    }
    let duration = end - start;
    if duration < config.min_duration {
        return Err(EngineError::InvalidRequest(format!(
            "reservation must be at least {}",
            describe(config.min_duration)
        )));
    }
    if duration > config.max_duration {
        return Err(EngineError::InvalidRequest(format!(
            "reservation cannot exceed {}",
            describe(config.max_duration)
        )));
    }
    Ok(())
}

fn describe(ms: Ms) -> String {
    if ms % HOUR_MS == 0 {
        format!("{} hours", ms / HOUR_MS)
    } else {
        format!("{ms} ms")
    }
}
