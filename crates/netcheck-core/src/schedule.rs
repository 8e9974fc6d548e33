//! Randomized scheduling helpers.
//!
//! Every recurring action is scheduled `U[0, max]` into the future, which
//! spreads probes and scans instead of firing them in lockstep.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// A uniformly random delay in `[0, max]`.
pub fn random_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::rng().random_range(0.0..=max.as_secs_f64()))
}

/// `now + delay`, saturating at the latest representable time.
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now + U[0, max]`.
pub fn randomly_after(now: DateTime<Utc>, max: Duration) -> DateTime<Utc> {
    after(now, random_delay(max))
}
