//! Tests for util.rs

use crate::util::{format_duration, hour_of_week};
use std::time::Duration;

#[test]
fn format_duration_milliseconds() {
    assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(999)), "999ms");
}

#[test]
fn format_duration_seconds() {
    assert_eq!(format_duration(Duration::from_millis(1000)), "1.0s");
    assert_eq!(format_duration(Duration::from_millis(2300)), "2.3s");
    assert_eq!(format_duration(Duration::from_millis(45678)), "45.7s");
}

#[test]
fn format_duration_minutes() {
    assert_eq!(format_duration(Duration::from_secs(60)), "1m 0s");
    assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    assert_eq!(format_duration(Duration::from_secs(3661)), "61m 1s");
}

#[test]
fn hour_of_week_epoch_is_thursday_midnight() {
    // Thursday is three days after Monday.
    assert_eq!(hour_of_week(0), 72);
    assert_eq!(hour_of_week(3599), 72);
    assert_eq!(hour_of_week(3600), 73);
}

#[test]
fn hour_of_week_wraps_on_monday() {
    // 1970-01-05 00:00 UTC was a Monday.
    let monday = 4 * 24 * 3600;
    assert_eq!(hour_of_week(monday), 0);
    assert_eq!(hour_of_week(monday - 1), 167);
    assert_eq!(hour_of_week(monday + 7 * 24 * 3600 + 5 * 3600), 5);
}
