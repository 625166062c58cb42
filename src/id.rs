//! ID generation utilities for devloop
//!
//! Run directories are named so that a plain lexical sort is chronological.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a run ID for the given start time
///
/// Format: `{YYYYmmdd-HHMMSSmmm}-{random_hex}`
/// Example: `20261018-142501123-a1b2`
pub fn generate_run_id_at(at: DateTime<Utc>) -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{:04x}", at.format("%Y%m%d-%H%M%S%3f"), random)
}

/// Generate a run ID for the current time
pub fn generate_run_id() -> String {
    generate_run_id_at(Utc::now())
}

/// Directory name for an attempt inside a run directory
///
/// Format: `attempt-{n:02}`
pub fn attempt_dir_name(attempt: u32) -> String {
    format!("attempt-{:02}", attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_run_id_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 14, 25, 1).unwrap();
        let id = generate_run_id_at(at);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "20261018");
        assert_eq!(parts[1], "142501000");
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_ids_sort_chronologically() {
        let earlier = generate_run_id_at(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        let later = generate_run_id_at(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_attempt_dir_name_padding() {
        assert_eq!(attempt_dir_name(1), "attempt-01");
        assert_eq!(attempt_dir_name(12), "attempt-12");
    }
}
