//! Release pattern analysis
//!
//! Pure statistical functions over publish timestamp histories. Nothing in
//! here performs I/O; every function tolerates empty or short input by
//! returning an explicit "no signal" value instead of erroring, so callers
//! can always fall back to the default check interval.
//!
//! The scheduling engine consumes three signals from this module:
//! - the average inter-release interval (days),
//! - a preferred release weekday, when one dominates,
//! - a confidence score in `[0, 1]` for the detected pattern.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use statrs::statistics::Statistics;

/// Minimum history length before a weekly pattern is considered
const MIN_POINTS_WEEKLY: usize = 5;

/// Share of releases a single weekday must hold to count as a pattern
const WEEKLY_SHARE_THRESHOLD: f64 = 0.60;

/// Deltas longer than this are treated as hiatus outliers, not cadence
const MAX_INTERVAL_DAYS: f64 = 365.0;

/// Average inter-release interval in days
///
/// Requires at least two timestamps. Sorts descending, takes consecutive
/// deltas, and discards any delta below zero or above a year as an outlier.
/// Returns `None` when no usable delta remains.
pub fn average_interval(dates: &[DateTime<Utc>]) -> Option<f64> {
    let deltas = surviving_deltas(dates);
    if deltas.is_empty() {
        return None;
    }
    Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
}

/// Consecutive release deltas in fractional days, outliers removed
fn surviving_deltas(dates: &[DateTime<Utc>]) -> Vec<f64> {
    if dates.len() < 2 {
        return Vec::new();
    }

    let mut sorted = dates.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    sorted
        .windows(2)
        .map(|w| (w[0] - w[1]).num_seconds() as f64 / 86_400.0)
        .filter(|d| *d >= 0.0 && *d <= MAX_INTERVAL_DAYS)
        .collect()
}

/// Count of releases per weekday, indexed by `Weekday::num_days_from_monday`
pub fn day_of_week_distribution(dates: &[DateTime<Utc>]) -> [usize; 7] {
    let mut counts = [0usize; 7];
    for date in dates {
        counts[date.weekday().num_days_from_monday() as usize] += 1;
    }
    counts
}

/// Detect a dominant release weekday
///
/// Requires at least five timestamps; returns the weekday holding at least
/// 60% of the distribution, or `None` when no single day dominates.
pub fn detect_weekly_pattern(dates: &[DateTime<Utc>]) -> Option<Weekday> {
    if dates.len() < MIN_POINTS_WEEKLY {
        return None;
    }

    let counts = day_of_week_distribution(dates);
    let total = dates.len() as f64;
    let (best_day, best_count) = counts
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)?;

    if *best_count as f64 / total >= WEEKLY_SHARE_THRESHOLD {
        weekday_from_index(best_day as u8)
    } else {
        None
    }
}

/// Map a 0..6 index (Monday-based) back to a `Weekday`
pub fn weekday_from_index(index: u8) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

/// Confidence in the detected release pattern, in `[0, 1]`
///
/// Zero below three data points. Otherwise the mean of up to three
/// sub-scores: data volume (`min(n/10, 1)`), weekly-pattern strength (the
/// largest weekday share), and interval consistency
/// (`max(0, 1 - cv)` over the surviving deltas). A sub-score that cannot be
/// computed is excluded from the mean rather than counted as zero.
pub fn confidence_score(dates: &[DateTime<Utc>]) -> f64 {
    if dates.len() < 3 {
        return 0.0;
    }

    let mut scores: Vec<f64> = Vec::with_capacity(3);

    scores.push((dates.len() as f64 / 10.0).min(1.0));

    let counts = day_of_week_distribution(dates);
    if let Some(max_count) = counts.iter().max() {
        scores.push(*max_count as f64 / dates.len() as f64);
    }

    let deltas = surviving_deltas(dates);
    if deltas.len() >= 2 {
        let mean = deltas.iter().mean();
        if mean > 0.0 {
            let cv = deltas.iter().std_dev() / mean;
            scores.push((1.0 - cv).max(0.0));
        }
    }

    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Predict the next release time
///
/// Prefers the weekly-pattern projection: the next occurrence of the
/// preferred weekday strictly after the latest known release, stepped
/// forward in one-week increments until it lies past `reference`. Falls back
/// to `latest + average_interval`, also stepped past `reference`.
pub fn predict_next_release(
    dates: &[DateTime<Utc>],
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let latest = dates.iter().max().copied()?;

    if let Some(weekday) = detect_weekly_pattern(dates) {
        let target = weekday.num_days_from_monday() as i64;
        let current = latest.weekday().num_days_from_monday() as i64;
        // Strictly after the latest release: same weekday means a full week out
        let mut ahead = (target - current).rem_euclid(7);
        if ahead == 0 {
            ahead = 7;
        }
        let mut candidate = latest + Duration::days(ahead);
        while candidate <= reference {
            candidate += Duration::days(7);
        }
        return Some(candidate);
    }

    let avg_days = average_interval(dates)?;
    let step = Duration::seconds((avg_days * 86_400.0) as i64);
    if step <= Duration::zero() {
        return None;
    }
    let mut candidate = latest + step;
    while candidate <= reference {
        candidate += step;
    }
    Some(candidate)
}

/// Whether the release pattern shifted enough to warrant a reschedule
///
/// Only evaluated once the new history carries at least ten more points than
/// the old one. True when the dominant weekday changed, or when the average
/// interval moved by more than 20%.
pub fn pattern_changed_significantly(
    old_dates: &[DateTime<Utc>],
    new_dates: &[DateTime<Utc>],
) -> bool {
    if new_dates.len() < old_dates.len() + 10 {
        return false;
    }

    if detect_weekly_pattern(old_dates) != detect_weekly_pattern(new_dates) {
        return true;
    }

    match (average_interval(old_dates), average_interval(new_dates)) {
        (Some(old_avg), Some(new_avg)) if old_avg > 0.0 => {
            ((new_avg - old_avg) / old_avg).abs() > 0.20
        }
        _ => false,
    }
}
