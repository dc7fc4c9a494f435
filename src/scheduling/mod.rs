//! Adaptive check scheduling
//!
//! Computes when each tracked item should next be checked, combining the
//! pattern analyzer's signals with the item's lifecycle status and the
//! schedule's own no-update history. The decision ladder, in order:
//!
//! 1. Terminal status (completed/dropped) always wins: 30 days out, no
//!    penalty, no clamp.
//! 2. Fewer than three known publish timestamps: the 24h bootstrap interval.
//! 3. A dominant weekly pattern: one week.
//! 4. An average release interval: 80% of it, so checks land slightly ahead
//!    of the expected release.
//! 5. Otherwise the 24h default.
//!
//! Steps 2-5 then take the consecutive-no-update penalty and are clamped to
//! `[6h, 14d]`.

use chrono::{DateTime, Duration, Utc};

use crate::models::{ItemStatus, Schedule};
use crate::pattern;

/// Bootstrap/default interval in hours
pub const DEFAULT_INTERVAL_HOURS: f64 = 24.0;

/// Interval used when a weekly release pattern is detected
pub const WEEKLY_INTERVAL_HOURS: f64 = 168.0;

/// Re-check interval for completed or dropped items
pub const TERMINAL_INTERVAL_HOURS: f64 = 30.0 * 24.0;

/// Fraction of the average release interval to wait between checks.
/// Product constant; do not retune.
pub const INTERVAL_FRACTION: f64 = 0.80;

/// Lower clamp bound in hours
pub const MIN_INTERVAL_HOURS: f64 = 6.0;

/// Upper clamp bound in hours (14 days)
pub const MAX_INTERVAL_HOURS: f64 = 14.0 * 24.0;

/// Growth factor applied per consecutive no-update check
pub const NO_UPDATE_PENALTY: f64 = 1.5;

/// No-update checks beyond this count stop growing the penalty
pub const NO_UPDATE_PENALTY_CAP: i32 = 3;

/// Ceiling for the stored consecutive-no-update counter
pub const NO_UPDATE_COUNTER_CAP: i32 = 10;

/// Result of a scheduling decision
#[derive(Debug, Clone, PartialEq)]
pub struct NextCheck {
    /// Chosen interval in hours
    pub interval_hours: f64,

    /// When the item is next due
    pub next_check_at: DateTime<Utc>,
}

/// Compute the next check time for an item
///
/// `publish_dates` is the item's known publish timestamp history;
/// `consecutive_no_update` is the schedule's current counter.
pub fn calculate_next_check(
    status: ItemStatus,
    publish_dates: &[DateTime<Utc>],
    consecutive_no_update: i32,
    now: DateTime<Utc>,
) -> NextCheck {
    if status.is_terminal() {
        return NextCheck {
            interval_hours: TERMINAL_INTERVAL_HOURS,
            next_check_at: now + hours(TERMINAL_INTERVAL_HOURS),
        };
    }

    let base = if publish_dates.len() < 3 {
        DEFAULT_INTERVAL_HOURS
    } else if pattern::detect_weekly_pattern(publish_dates).is_some() {
        WEEKLY_INTERVAL_HOURS
    } else {
        match pattern::average_interval(publish_dates) {
            Some(avg_days) => avg_days * INTERVAL_FRACTION * 24.0,
            None => DEFAULT_INTERVAL_HOURS,
        }
    };

    let interval_hours = clamp_interval(apply_no_update_penalty(base, consecutive_no_update));

    NextCheck {
        interval_hours,
        next_check_at: now + hours(interval_hours),
    }
}

/// Stretch the interval after repeated empty checks
pub fn apply_no_update_penalty(interval_hours: f64, consecutive_no_update: i32) -> f64 {
    if consecutive_no_update <= 0 {
        return interval_hours;
    }
    let exponent = consecutive_no_update.min(NO_UPDATE_PENALTY_CAP);
    interval_hours * NO_UPDATE_PENALTY.powi(exponent)
}

/// Clamp an interval into the allowed band
pub fn clamp_interval(interval_hours: f64) -> f64 {
    interval_hours.clamp(MIN_INTERVAL_HOURS, MAX_INTERVAL_HOURS)
}

fn hours(h: f64) -> Duration {
    Duration::seconds((h * 3600.0) as i64)
}

/// Fold a finished job back into the schedule
///
/// New units reset the no-update counter, bump the total, and recompute the
/// pattern fields from the updated history. Empty checks only advance the
/// capped counter; a failed job never reaches this function, so the previous
/// schedule state stays untouched for the retry.
pub fn apply_job_result(
    schedule: &mut Schedule,
    new_units: usize,
    publish_dates: &[DateTime<Utc>],
    now: DateTime<Utc>,
) {
    schedule.last_checked_at = Some(now);

    if new_units > 0 {
        schedule.consecutive_no_update = 0;
        schedule.total_units += new_units as i64;
        schedule.avg_release_interval_days = pattern::average_interval(publish_dates);
        schedule.preferred_weekday = pattern::detect_weekly_pattern(publish_dates)
            .map(|w| w.num_days_from_monday() as u8);
        schedule.pattern_confidence = pattern::confidence_score(publish_dates);
        schedule.last_published_at = publish_dates.iter().max().copied();
    } else {
        schedule.consecutive_no_update =
            (schedule.consecutive_no_update + 1).min(NO_UPDATE_COUNTER_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::days(offset)
    }

    fn assert_hours(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}h, got {actual}h"
        );
    }

    #[test]
    fn test_completed_item_always_thirty_days() {
        let now = day(100);
        // Rich weekly history must be ignored for terminal items
        let dates: Vec<_> = (0..12).map(|i| day(i * 7)).collect();

        for status in [ItemStatus::Completed, ItemStatus::Dropped] {
            let next = calculate_next_check(status, &dates, 5, now);
            assert_hours(next.interval_hours, 720.0);
            assert_eq!(next.next_check_at, now + Duration::days(30));
        }
    }

    #[test]
    fn test_bootstrap_interval_below_three_points() {
        let next = calculate_next_check(ItemStatus::Ongoing, &[day(0), day(7)], 0, day(7));
        assert_hours(next.interval_hours, 24.0);
    }

    #[test]
    fn test_weekly_pattern_yields_one_week() {
        let dates: Vec<_> = (0..6).map(|i| day(i * 7)).collect();
        let next = calculate_next_check(ItemStatus::Ongoing, &dates, 0, day(35));
        assert_hours(next.interval_hours, 168.0);
    }

    #[test]
    fn test_average_interval_fraction() {
        // Every 10 days, no weekday dominance: 10 * 0.8 * 24 = 192h
        let dates = vec![day(0), day(10), day(20), day(30)];
        let next = calculate_next_check(ItemStatus::Ongoing, &dates, 0, day(30));
        assert_hours(next.interval_hours, 192.0);
    }

    #[test]
    fn test_clamp_lower_bound() {
        assert_hours(clamp_interval(3.0), 6.0);
    }

    #[test]
    fn test_clamp_upper_bound() {
        assert_hours(clamp_interval(480.0), 336.0);
    }

    #[test]
    fn test_no_update_penalty_progression() {
        assert_hours(apply_no_update_penalty(24.0, 0), 24.0);
        assert_hours(apply_no_update_penalty(24.0, 1), 36.0);
        assert_hours(apply_no_update_penalty(24.0, 2), 54.0);
        assert_hours(apply_no_update_penalty(24.0, 3), 81.0);
    }

    #[test]
    fn test_no_update_penalty_capped() {
        let at_cap = apply_no_update_penalty(24.0, 3);
        assert_hours(apply_no_update_penalty(24.0, 4), at_cap);
        assert_hours(apply_no_update_penalty(24.0, 100), at_cap);
    }

    #[test]
    fn test_penalty_then_clamp() {
        // Weekly interval with penalty would exceed two weeks: clamped
        let dates: Vec<_> = (0..6).map(|i| day(i * 7)).collect();
        let next = calculate_next_check(ItemStatus::Ongoing, &dates, 3, day(35));
        assert_hours(next.interval_hours, 336.0);
    }

    #[test]
    fn test_apply_job_result_with_new_units() {
        let now = day(70);
        let mut schedule = Schedule::bootstrap(1, day(0));
        schedule.consecutive_no_update = 4;

        let dates: Vec<_> = (0..10).map(|i| day(i * 7)).collect();
        apply_job_result(&mut schedule, 2, &dates, now);

        assert_eq!(schedule.consecutive_no_update, 0);
        assert_eq!(schedule.total_units, 2);
        assert_eq!(schedule.avg_release_interval_days, Some(7.0));
        assert_eq!(schedule.preferred_weekday, Some(0)); // Mondays
        assert!(schedule.pattern_confidence > 0.9);
        assert_eq!(schedule.last_published_at, Some(day(63)));
        assert_eq!(schedule.last_checked_at, Some(now));
    }

    #[test]
    fn test_apply_job_result_empty_check() {
        let mut schedule = Schedule::bootstrap(1, day(0));
        schedule.avg_release_interval_days = Some(7.0);
        schedule.pattern_confidence = 0.8;
        schedule.total_units = 40;

        apply_job_result(&mut schedule, 0, &[], day(1));

        // Counter advances; pattern fields are left alone
        assert_eq!(schedule.consecutive_no_update, 1);
        assert_eq!(schedule.total_units, 40);
        assert_eq!(schedule.avg_release_interval_days, Some(7.0));
        assert_eq!(schedule.pattern_confidence, 0.8);
    }

    #[test]
    fn test_no_update_counter_cap() {
        let mut schedule = Schedule::bootstrap(1, day(0));
        for i in 0..20 {
            apply_job_result(&mut schedule, 0, &[], day(i));
        }
        assert_eq!(schedule.consecutive_no_update, NO_UPDATE_COUNTER_CAP);
    }
}
