/// Frequency gate module
///
/// Decides whether a feed is due for posting right now, from its last post
/// time, its base frequency and its quiet-hours settings. Pure and
/// deterministic: the caller supplies `now`.

use chrono::{DateTime, Timelike, Utc};

use crate::feed::Feed;

/// Quiet-hours multiplier in effect at `now` for this feed.
///
/// A demultiplier of exactly 1 disables the window entirely. Windows where
/// start > end cross midnight; both boundary hours count as inside.
fn effective_multiplier(feed: &Feed, now: DateTime<Utc>) -> f64 {
    if feed.quiet_hours_demultiplier == 1.0 {
        return 1.0;
    }
    let (start, end) = match (feed.quiet_hours_start, feed.quiet_hours_end) {
        (Some(s), Some(e)) => (s as u32, e as u32),
        _ => return 1.0,
    };
    let hour = now.hour();
    let inside = if start <= end {
        hour >= start && hour <= end
    } else {
        hour >= start || hour <= end
    };
    if inside {
        feed.quiet_hours_demultiplier
    } else {
        1.0
    }
}

/// True when the feed's elapsed time since its last post meets the
/// quiet-hours-adjusted frequency threshold.
pub fn is_due(feed: &Feed, now: DateTime<Utc>) -> bool {
    let multiplier = effective_multiplier(feed, now);
    if multiplier == 0.0 {
        // Posting fully suppressed during quiet hours.
        return false;
    }

    let effective_max_frequency = (feed.max_frequency as f64 * multiplier).floor() as i64;

    match feed.last_post_time {
        None => true,
        Some(last) => (now - last).num_minutes() >= effective_max_frequency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn feed_every(minutes: i64) -> Feed {
        let mut feed = Feed::new("testsub", 1);
        feed.max_frequency = minutes;
        feed
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, hour, 30, 0).unwrap()
    }

    #[test]
    fn due_once_frequency_elapsed() {
        let now = at_hour(12);
        let mut feed = feed_every(60);

        feed.last_post_time = Some(now - Duration::minutes(61));
        assert!(is_due(&feed, now));

        feed.last_post_time = Some(now - Duration::minutes(59));
        assert!(!is_due(&feed, now));
    }

    #[test]
    fn never_posted_is_always_due() {
        let feed = feed_every(720);
        assert!(is_due(&feed, at_hour(3)));
    }

    #[test]
    fn quiet_window_crossing_midnight_suppresses() {
        let mut feed = feed_every(60);
        feed.quiet_hours_start = Some(22);
        feed.quiet_hours_end = Some(6);
        feed.quiet_hours_demultiplier = 0.0;
        feed.last_post_time = Some(at_hour(23) - Duration::minutes(300));

        // 23:30 falls inside 22..=6, posting suppressed outright.
        assert!(!is_due(&feed, at_hour(23)));
        // Midday is outside the window, normal frequency check applies.
        assert!(is_due(&feed, at_hour(12)));
    }

    #[test]
    fn quiet_window_stretches_frequency() {
        let mut feed = feed_every(60);
        feed.quiet_hours_start = Some(0);
        feed.quiet_hours_end = Some(8);
        feed.quiet_hours_demultiplier = 2.0;

        let now = at_hour(4);
        feed.last_post_time = Some(now - Duration::minutes(90));
        // Inside the window the threshold doubles to 120 minutes.
        assert!(!is_due(&feed, now));
        feed.last_post_time = Some(now - Duration::minutes(121));
        assert!(is_due(&feed, now));
    }

    #[test]
    fn unit_demultiplier_ignores_window() {
        let mut feed = feed_every(60);
        feed.quiet_hours_start = Some(0);
        feed.quiet_hours_end = Some(23);
        feed.quiet_hours_demultiplier = 1.0;

        let now = at_hour(12);
        feed.last_post_time = Some(now - Duration::minutes(61));
        assert!(is_due(&feed, now));
    }

    #[test]
    fn fractional_multiplier_floors_threshold() {
        let mut feed = feed_every(45);
        feed.quiet_hours_start = Some(10);
        feed.quiet_hours_end = Some(14);
        feed.quiet_hours_demultiplier = 0.5;

        // floor(45 * 0.5) = 22 minutes inside the window.
        let now = at_hour(12);
        feed.last_post_time = Some(now - Duration::minutes(22));
        assert!(is_due(&feed, now));
        feed.last_post_time = Some(now - Duration::minutes(21));
        assert!(!is_due(&feed, now));
    }
}
