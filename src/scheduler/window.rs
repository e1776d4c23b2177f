//! Delivery window computation.
//!
//! The delivery instant is defined as a wall-clock time in a named time
//! zone (default 06:00 Asia/Kolkata), so the UTC offset of "tomorrow at
//! 06:00" depends on the date. All conversions go through [`chrono_tz`] and
//! resolve DST folds and gaps deterministically: ambiguous local times take
//! the earlier instant, and times that fall inside a spring-forward gap are
//! pushed to the first valid instant after it.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::RngExt;
use serde::{Deserialize, Serialize};

/// The concrete UTC window a scheduling run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    /// Start of the window: the local delivery instant in UTC.
    pub opens_at: DateTime<Utc>,
    /// End of the window: `opens_at` plus the jitter width.
    pub closes_at: DateTime<Utc>,
}

impl DeliveryWindow {
    /// Computes the next delivery window at or after `now`.
    ///
    /// If today's local delivery instant has not yet passed it is used;
    /// otherwise the window moves to the same wall-clock time tomorrow.
    pub fn next(
        now: DateTime<Utc>,
        timezone: Tz,
        hour: u32,
        minute: u32,
        jitter: Duration,
    ) -> Self {
        let local_today = now.with_timezone(&timezone).date_naive();
        let mut opens_at = resolve_local(timezone, local_today, hour, minute);
        if opens_at <= now {
            let tomorrow = local_today + ChronoDuration::days(1);
            opens_at = resolve_local(timezone, tomorrow, hour, minute);
        }
        let closes_at = opens_at
            + ChronoDuration::from_std(jitter).unwrap_or_else(|_| ChronoDuration::zero());
        Self { opens_at, closes_at }
    }

    /// Delay from `now` until the window opens, saturating at zero.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        (self.opens_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Width of the window.
    pub fn width(&self) -> Duration {
        (self.closes_at - self.opens_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Resolves a local wall-clock time on `date` to a UTC instant.
///
/// Folds (the repeated hour at the end of DST) take the earlier instant.
/// Gaps (the skipped hour at the start of DST) advance minute by minute to
/// the first local time that exists.
fn resolve_local(timezone: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let mut naive = date
        .and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap_or_default());
    loop {
        match timezone.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earlier, _later) => {
                return earlier.with_timezone(&Utc);
            }
            chrono::LocalResult::None => {
                // Inside a spring-forward gap; DST gaps are bounded so this
                // terminates within a couple of hours of wall-clock time.
                naive += ChronoDuration::minutes(1);
            }
        }
    }
}

/// Draws a uniform jitter delay in `[0, window]`.
///
/// Spreading individual jobs across the window keeps a large batch from
/// hitting the channel provider at a single instant.
pub fn jitter_delay(window: Duration) -> Duration {
    let max_ms = window.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Formats a UTC instant as local wall-clock time for operator output.
pub fn format_local(instant: DateTime<Utc>, timezone: Tz) -> String {
    instant
        .with_timezone(&timezone)
        .format("%Y-%m-%d %H:%M %Z")
        .to_string()
}
