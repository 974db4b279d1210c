//! Wall-clock access for record timestamps.

use chrono::{DateTime, FixedOffset, Local};

/// Source of the current local time, including its UTC offset.
pub trait Clock {
    fn now_local(&self) -> DateTime<FixedOffset>;
}

/// The process clock in the system time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_local(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now_local(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

/// Format a timestamp as the marketplace client does, e.g.
/// `2026-02-24T23:02:31.282-08:00`.
pub fn format_local_timestamp(time: &DateTime<FixedOffset>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_millis_and_offset() {
        let time = DateTime::parse_from_rfc3339("2026-02-24T23:02:31.282-08:00").expect("time");
        assert_eq!(format_local_timestamp(&time), "2026-02-24T23:02:31.282-08:00");

        let utc = DateTime::parse_from_rfc3339("2026-02-25T07:02:31Z").expect("time");
        assert_eq!(format_local_timestamp(&utc), "2026-02-25T07:02:31.000+00:00");

        let half_hour = DateTime::parse_from_rfc3339("2026-02-25T12:32:31.5+05:30").expect("time");
        assert_eq!(format_local_timestamp(&half_hour), "2026-02-25T12:32:31.500+05:30");
    }
}
