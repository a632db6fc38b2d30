//! Key lifetime checks.
//!
//! A key may only be exported or re-shared once its broadcast window has
//! closed. The window ends at `(rolling_start_number + rolling_period)` rolling
//! intervals after the epoch, shifted by a configurable variance offset.

use crate::ROLLING_INTERVAL_SECS;
use time::OffsetDateTime;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Instant (in Unix nanoseconds) at which a key's lifetime ends.
fn lifetime_end_nanos(rolling_start_number: i32, rolling_period: i32, variance_offset_minutes: i64) -> i128 {
    let intervals = i128::from(rolling_start_number) + i128::from(rolling_period);
    let secs = intervals * i128::from(ROLLING_INTERVAL_SECS) + i128::from(variance_offset_minutes) * 60;
    secs * NANOS_PER_SEC
}

/// Returns true while the key's lifetime end is strictly after `now`.
pub fn is_still_valid(
    rolling_start_number: i32,
    rolling_period: i32,
    variance_offset_minutes: i64,
    now: OffsetDateTime,
) -> bool {
    lifetime_end_nanos(rolling_start_number, rolling_period, variance_offset_minutes)
        > now.unix_timestamp_nanos()
}

/// Validity check carrying the deployment's variance offset and disable flag.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidityFilter {
    variance_offset_minutes: i64,
    disabled: bool,
}

impl ValidityFilter {
    pub fn new(variance_offset_minutes: i64, disabled: bool) -> Self {
        Self {
            variance_offset_minutes,
            disabled,
        }
    }

    /// Whether the key is still inside its broadcast window.
    ///
    /// Always false when the check is disabled, which lets environments
    /// without synchronized clocks export every key immediately.
    pub fn is_still_valid(&self, rolling_start_number: i32, rolling_period: i32, now: OffsetDateTime) -> bool {
        if self.disabled {
            return false;
        }
        is_still_valid(
            rolling_start_number,
            rolling_period,
            self.variance_offset_minutes,
            now,
        )
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

/// Rolling interval number containing `at`.
pub fn rolling_interval_number(at: OffsetDateTime) -> i32 {
    (at.unix_timestamp() / ROLLING_INTERVAL_SECS) as i32
}
