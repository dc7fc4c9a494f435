// Core data structures for the tsugi release tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked item, as reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ongoing,
    Completed,
    Dropped,
    Unknown,
}

impl ItemStatus {
    /// Get string representation (matches the DB column values)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Dropped => "dropped",
            Self::Unknown => "unknown",
        }
    }

    /// True when the source will publish no further units
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dropped)
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "ongoing" => Self::Ongoing,
            "completed" => Self::Completed,
            "dropped" => Self::Dropped,
            _ => Self::Unknown,
        })
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A serialized work being monitored for new releases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    /// Internal database id
    pub id: i64,

    /// Stable identifier assigned by the source site
    pub external_id: String,

    /// Human-readable name
    pub name: String,

    /// Lifecycle status reported by the source
    pub status: ItemStatus,

    /// Inactive items are excluded from scheduling
    pub is_active: bool,
}

/// One discrete published installment of a tracked item
///
/// `(item_id, source_id)` and `(item_id, number)` are unique; the schema
/// enforces both and inserts rely on conflict-tolerant upserts for
/// idempotence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub item_id: i64,

    /// Source-assigned unique id, the dedup key. Immutable once created.
    pub source_id: String,

    /// Sequence/position number within the item
    pub number: f64,

    /// Display label (e.g. "Chapter 101")
    pub label: String,

    pub title: Option<String>,

    pub url: String,

    /// Publish timestamp; the source may omit it
    pub published_at: Option<DateTime<Utc>>,

    /// Engagement counter reported by the source
    pub views: i64,
}

/// Raw unit shape as returned by the source fetcher
///
/// Scraped data is loosely shaped; every field the diff depends on is
/// optional here and checked by [`crate::diff::validate`] before the unit
/// crosses into the rest of the system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedUnit {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub number: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub views: Option<i64>,
}

/// Item metadata as returned by the source fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub status: ItemStatus,
    pub display_name: String,
}

/// Per-item scheduling state, one-to-one with [`TrackedItem`]
///
/// Created at first scrape with the default interval and mutated after every
/// job execution. Pattern fields (average interval, preferred weekday,
/// confidence) are recomputed only when a job found new units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub item_id: i64,

    /// Current check interval in hours
    pub check_interval_hours: f64,

    pub last_checked_at: Option<DateTime<Utc>>,

    pub next_check_at: DateTime<Utc>,

    /// Rolling average inter-release interval in days
    pub avg_release_interval_days: Option<f64>,

    /// Preferred release weekday, 0 = Monday .. 6 = Sunday
    pub preferred_weekday: Option<u8>,

    /// Confidence in the detected pattern, in [0, 1]
    pub pattern_confidence: f64,

    /// Total units ever tracked for this item
    pub total_units: i64,

    /// Publish timestamp of the most recent known unit
    pub last_published_at: Option<DateTime<Utc>>,

    /// Consecutive checks that found nothing new (capped)
    pub consecutive_no_update: i32,

    /// Higher-priority items are checked first when due
    pub priority: i32,
}

impl Schedule {
    /// Default interval applied at first scrape, in hours
    pub const DEFAULT_INTERVAL_HOURS: f64 = 24.0;

    /// Create the bootstrap schedule for a newly tracked item
    pub fn bootstrap(item_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            item_id,
            check_interval_hours: Self::DEFAULT_INTERVAL_HOURS,
            last_checked_at: None,
            next_check_at: now,
            avg_release_interval_days: None,
            preferred_weekday: None,
            pattern_confidence: 0.0,
            total_units: 0,
            last_published_at: None,
            consecutive_no_update: 0,
            priority: 0,
        }
    }

    /// Check whether the item is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_at <= now
    }
}

/// Kind of orchestration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scheduled,
    Manual,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// Outcome of one orchestration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Append-only record of one orchestration attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub item_id: i64,
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub units_found: i64,
    pub new_units: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobLogEntry {
    /// Build a success entry
    pub fn success(
        item_id: i64,
        kind: JobKind,
        units_found: i64,
        new_units: i64,
        duration_ms: i64,
    ) -> Self {
        Self {
            item_id,
            kind,
            outcome: JobOutcome::Success,
            units_found,
            new_units,
            duration_ms,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Build a failure entry with error context
    pub fn failed(item_id: i64, kind: JobKind, duration_ms: i64, error: impl Into<String>) -> Self {
        Self {
            item_id,
            kind,
            outcome: JobOutcome::Failed,
            units_found: 0,
            new_units: 0,
            duration_ms,
            error: Some(error.into()),
            created_at: Utc::now(),
        }
    }
}
