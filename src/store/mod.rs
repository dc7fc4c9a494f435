//! Persistent storage for items, units, schedules, and the job log
//!
//! [`ContentStore`] is the core-facing contract; [`PostgresStore`] implements
//! it on a deadpool-managed PostgreSQL pool. All writes the orchestrator
//! performs go through here, and the unique constraints on
//! `(item_id, source_id)` and `(item_id, number)` are what make concurrent
//! job execution safe: inserts are conflict-tolerant, so a unit can never be
//! double-counted.

pub mod supervisor;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{ContentUnit, ItemStatus, JobLogEntry, Schedule, TrackedItem};

pub use supervisor::ConnectionSupervisor;

/// DDL applied by `tsugi init-db`; every statement is idempotent
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS items (
        id BIGSERIAL PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'unknown',
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS units (
        id BIGSERIAL PRIMARY KEY,
        item_id BIGINT NOT NULL REFERENCES items(id),
        source_id TEXT NOT NULL,
        number DOUBLE PRECISION NOT NULL,
        label TEXT NOT NULL,
        title TEXT,
        url TEXT NOT NULL,
        published_at TIMESTAMPTZ,
        views BIGINT NOT NULL DEFAULT 0,
        UNIQUE (item_id, source_id),
        UNIQUE (item_id, number)
    )",
    "CREATE TABLE IF NOT EXISTS schedules (
        item_id BIGINT PRIMARY KEY REFERENCES items(id),
        check_interval_hours DOUBLE PRECISION NOT NULL,
        last_checked_at TIMESTAMPTZ,
        next_check_at TIMESTAMPTZ NOT NULL,
        avg_release_interval_days DOUBLE PRECISION,
        preferred_weekday SMALLINT,
        pattern_confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
        total_units BIGINT NOT NULL DEFAULT 0,
        last_published_at TIMESTAMPTZ,
        consecutive_no_update INT NOT NULL DEFAULT 0,
        priority INT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS job_log (
        id BIGSERIAL PRIMARY KEY,
        item_id BIGINT NOT NULL REFERENCES items(id),
        kind TEXT NOT NULL,
        outcome TEXT NOT NULL,
        units_found BIGINT NOT NULL DEFAULT 0,
        new_units BIGINT NOT NULL DEFAULT 0,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedules_next_check
        ON schedules (next_check_at)",
    "CREATE INDEX IF NOT EXISTS idx_units_item_published
        ON units (item_id, published_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_job_log_item ON job_log (item_id, created_at DESC)",
];

/// Core-facing persistent store contract
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Active items whose `next_check_at` has passed, ordered by priority
    /// descending then due time ascending
    async fn get_due_items(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<(TrackedItem, Schedule)>, StoreError>;

    /// Source ids of every unit already stored for the item
    async fn get_existing_unit_ids(&self, item_id: i64) -> Result<HashSet<String>, StoreError>;

    /// Insert units, skipping duplicates; returns the units whose insert
    /// actually landed, so callers announce only what they wrote
    async fn bulk_insert_units(&self, units: &[ContentUnit])
        -> Result<Vec<ContentUnit>, StoreError>;

    /// Insert or update a schedule row
    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    /// Insert or update item metadata, keyed by external id
    async fn upsert_item(&self, item: &TrackedItem) -> Result<(), StoreError>;

    /// Register an item for tracking, returning its internal id
    async fn register_item(&self, external_id: &str, name: &str) -> Result<i64, StoreError>;

    /// Append one operation-log entry
    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError>;

    /// Known publish timestamps for the item, newest first
    async fn get_publish_timestamps(
        &self,
        item_id: i64,
        limit: i64,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    /// Liveness probe
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store
pub struct PostgresStore {
    supervisor: Arc<ConnectionSupervisor>,
}

impl PostgresStore {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Apply the schema; safe to run repeatedly
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.supervisor.client().await?;
        for statement in SCHEMA {
            client.batch_execute(statement).await?;
        }
        debug!("schema applied");
        Ok(())
    }
}

fn item_from_row(row: &Row) -> TrackedItem {
    let status: String = row.get("status");
    TrackedItem {
        id: row.get("id"),
        external_id: row.get("external_id"),
        name: row.get("name"),
        status: ItemStatus::from_str(&status).unwrap_or(ItemStatus::Unknown),
        is_active: row.get("is_active"),
    }
}

fn schedule_from_row(row: &Row) -> Schedule {
    let weekday: Option<i16> = row.get("preferred_weekday");
    Schedule {
        item_id: row.get("item_id"),
        check_interval_hours: row.get("check_interval_hours"),
        last_checked_at: row.get("last_checked_at"),
        next_check_at: row.get("next_check_at"),
        avg_release_interval_days: row.get("avg_release_interval_days"),
        preferred_weekday: weekday.map(|w| w as u8),
        pattern_confidence: row.get("pattern_confidence"),
        total_units: row.get("total_units"),
        last_published_at: row.get("last_published_at"),
        consecutive_no_update: row.get("consecutive_no_update"),
        priority: row.get("priority"),
    }
}

#[async_trait]
impl ContentStore for PostgresStore {
    async fn get_due_items(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<(TrackedItem, Schedule)>, StoreError> {
        self.supervisor
            .execute(|client| async move {
                let rows = client
                    .query(
                        "SELECT i.id, i.external_id, i.name, i.status, i.is_active,
                                s.item_id, s.check_interval_hours, s.last_checked_at,
                                s.next_check_at, s.avg_release_interval_days,
                                s.preferred_weekday, s.pattern_confidence, s.total_units,
                                s.last_published_at, s.consecutive_no_update, s.priority
                         FROM items i
                         JOIN schedules s ON s.item_id = i.id
                         WHERE s.next_check_at <= $1 AND i.is_active
                         ORDER BY s.priority DESC, s.next_check_at ASC
                         LIMIT $2",
                        &[&now, &limit],
                    )
                    .await?;

                Ok(rows
                    .iter()
                    .map(|row| (item_from_row(row), schedule_from_row(row)))
                    .collect())
            })
            .await
    }

    async fn get_existing_unit_ids(&self, item_id: i64) -> Result<HashSet<String>, StoreError> {
        self.supervisor
            .execute(|client| async move {
                let rows = client
                    .query("SELECT source_id FROM units WHERE item_id = $1", &[&item_id])
                    .await?;
                Ok(rows.iter().map(|row| row.get("source_id")).collect())
            })
            .await
    }

    async fn bulk_insert_units(
        &self,
        units: &[ContentUnit],
    ) -> Result<Vec<ContentUnit>, StoreError> {
        self.supervisor
            .execute(|client| async move {
                let stmt = client
                    .prepare_cached(
                        "INSERT INTO units
                            (item_id, source_id, number, label, title, url, published_at, views)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                         ON CONFLICT DO NOTHING
                         RETURNING source_id",
                    )
                    .await?;

                let mut landed = Vec::with_capacity(units.len());
                for unit in units {
                    let rows = client
                        .query(
                            &stmt,
                            &[
                                &unit.item_id,
                                &unit.source_id,
                                &unit.number,
                                &unit.label,
                                &unit.title,
                                &unit.url,
                                &unit.published_at,
                                &unit.views,
                            ],
                        )
                        .await?;
                    // No row back means a concurrent writer got there first
                    if !rows.is_empty() {
                        landed.push(unit.clone());
                    }
                }
                Ok(landed)
            })
            .await
    }

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.supervisor
            .execute(|client| async move {
                let weekday = schedule.preferred_weekday.map(|w| w as i16);
                client
                    .execute(
                        "INSERT INTO schedules
                            (item_id, check_interval_hours, last_checked_at, next_check_at,
                             avg_release_interval_days, preferred_weekday, pattern_confidence,
                             total_units, last_published_at, consecutive_no_update, priority)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                         ON CONFLICT (item_id) DO UPDATE SET
                            check_interval_hours = EXCLUDED.check_interval_hours,
                            last_checked_at = EXCLUDED.last_checked_at,
                            next_check_at = EXCLUDED.next_check_at,
                            avg_release_interval_days = EXCLUDED.avg_release_interval_days,
                            preferred_weekday = EXCLUDED.preferred_weekday,
                            pattern_confidence = EXCLUDED.pattern_confidence,
                            total_units = EXCLUDED.total_units,
                            last_published_at = EXCLUDED.last_published_at,
                            consecutive_no_update = EXCLUDED.consecutive_no_update,
                            priority = EXCLUDED.priority",
                        &[
                            &schedule.item_id,
                            &schedule.check_interval_hours,
                            &schedule.last_checked_at,
                            &schedule.next_check_at,
                            &schedule.avg_release_interval_days,
                            &weekday,
                            &schedule.pattern_confidence,
                            &schedule.total_units,
                            &schedule.last_published_at,
                            &schedule.consecutive_no_update,
                            &schedule.priority,
                        ],
                    )
                    .await?;
                Ok(())
            })
            .await
    }

    async fn upsert_item(&self, item: &TrackedItem) -> Result<(), StoreError> {
        self.supervisor
            .execute(|client| async move {
                client
                    .execute(
                        "INSERT INTO items (external_id, name, status, is_active)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (external_id) DO UPDATE SET
                            name = EXCLUDED.name,
                            status = EXCLUDED.status,
                            is_active = EXCLUDED.is_active",
                        &[
                            &item.external_id,
                            &item.name,
                            &item.status.as_str(),
                            &item.is_active,
                        ],
                    )
                    .await?;
                Ok(())
            })
            .await
    }

    async fn register_item(&self, external_id: &str, name: &str) -> Result<i64, StoreError> {
        self.supervisor
            .execute(|client| async move {
                let row = client
                    .query_one(
                        "INSERT INTO items (external_id, name)
                         VALUES ($1, $2)
                         ON CONFLICT (external_id) DO UPDATE SET name = EXCLUDED.name
                         RETURNING id",
                        &[&external_id, &name],
                    )
                    .await?;
                Ok(row.get("id"))
            })
            .await
    }

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError> {
        self.supervisor
            .execute(|client| async move {
                client
                    .execute(
                        "INSERT INTO job_log
                            (item_id, kind, outcome, units_found, new_units,
                             duration_ms, error, created_at)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                        &[
                            &entry.item_id,
                            &entry.kind.as_str(),
                            &entry.outcome.as_str(),
                            &entry.units_found,
                            &entry.new_units,
                            &entry.duration_ms,
                            &entry.error,
                            &entry.created_at,
                        ],
                    )
                    .await?;
                Ok(())
            })
            .await
    }

    async fn get_publish_timestamps(
        &self,
        item_id: i64,
        limit: i64,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        self.supervisor
            .execute(|client| async move {
                let rows = client
                    .query(
                        "SELECT published_at FROM units
                         WHERE item_id = $1 AND published_at IS NOT NULL
                         ORDER BY published_at DESC
                         LIMIT $2",
                        &[&item_id, &limit],
                    )
                    .await?;
                Ok(rows.iter().map(|row| row.get("published_at")).collect())
            })
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.supervisor
            .execute(|client| async move {
                client.simple_query("SELECT 1").await?;
                Ok(())
            })
            .await
    }
}
