//! Time helpers: Mountain Time conversions, event sort keys, and the
//! time-of-use tariff calendar.
//!
//! Event sort keys are local-time strings (`YYYY-MM-DD HH:MM:SS.mmm`,
//! America/Denver) — fixed-width, so lexicographic order is chronological
//! order and range queries read naturally in fleet dashboards.

use chrono::{DateTime, Datelike, LocalResult, TimeZone, Timelike, Utc};
use chrono_tz::America::Denver;
use chrono_tz::Tz;

use evse_wire::unix_to_sc;

/// DST-aware Mountain Time.
pub const MT: Tz = Denver;

/// Event-log retention: 90 days.
pub const EVENT_TTL_SECS: i64 = 7_776_000;

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_mt() -> DateTime<Tz> {
    Utc::now().with_timezone(&MT)
}

pub fn unix_to_mt(unix: i64) -> DateTime<Tz> {
    match Utc.timestamp_opt(unix, 0) {
        LocalResult::Single(dt) => dt.with_timezone(&MT),
        // only reachable for timestamps outside chrono's representable range
        _ => now_mt(),
    }
}

/// Unix milliseconds → sort-key string, e.g. `2026-02-21 14:30:00.123`.
pub fn unix_ms_to_mt(unix_ms: i64) -> String {
    let dt = unix_to_mt(unix_ms.div_euclid(1000));
    format!(
        "{} {:02}:{:02}:{:02}.{:03}",
        dt.format("%Y-%m-%d"),
        dt.hour(),
        dt.minute(),
        dt.second(),
        unix_ms.rem_euclid(1000)
    )
}

/// Current time as a sort-key string.
pub fn now_mt_string() -> String {
    unix_ms_to_mt(now_unix_ms())
}

/// ISO-8601 UTC string for registry timestamps.
pub fn now_iso_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── TOU calendar ──────────────────────────────────────────────────────────────

/// Xcel Colorado on-peak: weekdays 17:00 ≤ hour < 21:00 Mountain Time.
pub fn is_tou_peak(now_mt: &DateTime<Tz>) -> bool {
    now_mt.weekday().num_days_from_monday() < 5 && (17..21).contains(&now_mt.hour())
}

/// Unix seconds of today's 21:00 MT (the end of the on-peak window).
pub fn tou_peak_end_unix(now_mt: &DateTime<Tz>) -> i64 {
    let nine_pm = now_mt
        .date_naive()
        .and_hms_opt(21, 0, 0)
        .expect("21:00:00 is a valid time of day");
    match MT.from_local_datetime(&nine_pm) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(dt, _) => dt.timestamp(),
        // DST gaps happen at 02:00, never at 21:00
        LocalResult::None => now_mt.timestamp(),
    }
}

/// Today's 21:00 MT as device epoch seconds.
pub fn tou_peak_end_sc(now_mt: &DateTime<Tz>) -> u32 {
    unix_to_sc(tou_peak_end_unix(now_mt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evse_wire::EPOCH_OFFSET;

    fn mt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        MT.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekday_5pm_is_peak() {
        assert!(is_tou_peak(&mt(2025, 1, 6, 17, 0))); // Monday
    }

    #[test]
    fn weekday_859pm_is_peak() {
        assert!(is_tou_peak(&mt(2025, 1, 8, 20, 59))); // Wednesday
    }

    #[test]
    fn weekday_9pm_is_off_peak() {
        assert!(!is_tou_peak(&mt(2025, 1, 9, 21, 0))); // Thursday
    }

    #[test]
    fn weekday_459pm_is_off_peak() {
        assert!(!is_tou_peak(&mt(2025, 1, 7, 16, 59))); // Tuesday
    }

    #[test]
    fn weekend_5pm_is_off_peak() {
        assert!(!is_tou_peak(&mt(2025, 1, 4, 17, 0))); // Saturday
        assert!(!is_tou_peak(&mt(2025, 1, 5, 19, 0))); // Sunday
    }

    #[test]
    fn weekday_morning_and_noon_off_peak() {
        assert!(!is_tou_peak(&mt(2025, 1, 6, 8, 0)));
        assert!(!is_tou_peak(&mt(2025, 1, 6, 12, 0)));
    }

    #[test]
    fn peak_end_is_9pm_today() {
        let now = mt(2026, 2, 16, 18, 30);
        let expected = mt(2026, 2, 16, 21, 0).timestamp();
        assert_eq!(tou_peak_end_unix(&now), expected);
        assert_eq!(tou_peak_end_sc(&now), (expected - EPOCH_OFFSET) as u32);
    }

    #[test]
    fn peak_end_at_5pm_still_9pm() {
        let now = mt(2026, 2, 16, 17, 0);
        assert_eq!(tou_peak_end_unix(&now), mt(2026, 2, 16, 21, 0).timestamp());
    }

    #[test]
    fn sort_key_format() {
        // 1_700_000_000 = 2023-11-14T22:13:20Z → 15:13:20 MST
        let key = unix_ms_to_mt(1_700_000_000_000);
        assert_eq!(key.len(), 23);
        assert_eq!(key, "2023-11-14 15:13:20.000");
    }

    #[test]
    fn sort_key_millis() {
        let key = unix_ms_to_mt(1_700_000_000_123);
        assert!(key.ends_with(".123"));
    }

    #[test]
    fn sort_keys_order_lexicographically() {
        let a = unix_ms_to_mt(1_700_000_000_000);
        let b = unix_ms_to_mt(1_700_000_000_001);
        let c = unix_ms_to_mt(1_700_003_600_500);
        assert!(a < b && b < c);
    }
}
