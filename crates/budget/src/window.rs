//! The 24-hour 8pm→8pm UTC budget window (4am→4am UTC+8).

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

/// Return `[window_start, window_end)` for the window containing `now`.
pub fn window_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today_20 = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(20, 0, 0).unwrap());
    let window_start = if now.hour() >= 20 { today_20 } else { today_20 - Duration::days(1) };
    let window_end = window_start + Duration::hours(24);
    (window_start, window_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn after_8pm_window_starts_today() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 21, 0, 0).unwrap();
        let (start, end) = window_bounds(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 8, 2, 20, 0, 0).unwrap());
    }

    #[test]
    fn before_8pm_window_starts_yesterday() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();
        let (start, end) = window_bounds(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 31, 20, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap());
    }

    #[test]
    fn boundary_at_exactly_8pm_selects_today() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap();
        let (start, _) = window_bounds(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap());
    }

    #[test]
    fn boundary_one_second_before_8pm_selects_yesterday() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 19, 59, 59).unwrap();
        let (start, _) = window_bounds(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 31, 20, 0, 0).unwrap());
    }
}
