use crate::model::{Timestamp, HOURS_PER_WEEK};
use std::time::Duration;

/// Current wall clock time in unix seconds.
pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as Timestamp)
        .unwrap_or_default()
}

/// Hour of the week for a unix timestamp, 0 being Monday 00:00 UTC.
pub fn hour_of_week(ts: Timestamp) -> usize {
    // 1970-01-01 was a Thursday, three days after Monday.
    let hours_since_epoch = ts.div_euclid(3600) + 3 * 24;
    hours_since_epoch.rem_euclid(HOURS_PER_WEEK as i64) as usize
}

/// Human friendly duration for log lines.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        let secs = d.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
