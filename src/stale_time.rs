//! How long fetched data may be trusted.
//!
//! The backend recomputes every read model in a nightly batch at 02:00, so a
//! value fetched during the day cannot change before the next night. Data is
//! trusted until midnight minus a safety buffer.

use chrono::{DateTime, Local, TimeZone};
use std::time::Duration;

pub const DEFAULT_BUFFER_MINUTES: i64 = 30;

/// Lower bound, also used when the deadline has already passed.
pub const MIN_STALE_TIME: Duration = Duration::from_secs(5 * 60);

pub const MAX_STALE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Stale time evaluated against the local clock. Call it every time a stale
/// time is needed; the result moves with the clock.
pub fn stale_time_until_midnight(buffer_minutes: i64) -> Duration {
  stale_time_at(Local::now(), buffer_minutes)
}

/// Time from `now` until the next midnight minus `buffer_minutes`, clamped to
/// `[MIN_STALE_TIME, MAX_STALE_TIME]`.
pub fn stale_time_at<Tz: TimeZone>(now: DateTime<Tz>, buffer_minutes: i64) -> Duration {
  let local = now.naive_local();
  let next_midnight = match local
    .date()
    .succ_opt()
    .and_then(|day| day.and_hms_opt(0, 0, 0))
  {
    Some(midnight) => midnight,
    None => return MIN_STALE_TIME,
  };

  let deadline = next_midnight - chrono::Duration::minutes(buffer_minutes.max(0));
  // Measure in UTC so a DST change before the deadline counts. A deadline in
  // a DST gap has no instant; fall back to wall-clock distance.
  let millis = match now.timezone().from_local_datetime(&deadline).earliest() {
    Some(deadline) => (deadline.naive_utc() - now.naive_utc()).num_milliseconds(),
    None => (deadline - local).num_milliseconds(),
  };

  if millis <= 0 {
    return MIN_STALE_TIME;
  }

  Duration::from_millis(millis as u64).clamp(MIN_STALE_TIME, MAX_STALE_TIME)
}
