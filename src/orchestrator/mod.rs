//! Job orchestration
//!
//! Drives the whole system: every poll interval, due items are pulled from
//! the store and checked against the source under a bounded worker pool.
//! Each job is isolated; one failing item never affects the others in the
//! cycle. A rate-limit signal from any job pauses the entire process through
//! the shared [`RateLimitGate`], and queued jobs observe the pause before
//! touching the source.
//!
//! Shutdown is cooperative: a watch-channel signal stops new cycles, gives
//! in-flight jobs a grace period to finish, then aborts whatever remains.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::diff;
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::SourceFetcher;
use crate::models::{JobKind, JobLogEntry, Schedule, TrackedItem};
use crate::notify::{self, NotificationEvent, Notifier};
use crate::ratelimit::{RateLimitGate, RateLimitStatus};
use crate::retry::RetryPolicy;
use crate::scheduling;
use crate::store::ContentStore;

/// Publish-history depth used for pattern recomputation
const PATTERN_HISTORY_LIMIT: i64 = 200;

/// Jobs slower than this are logged at warn level
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(2);

/// What one finished job did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub item_id: i64,
    pub units_found: usize,
    pub new_units: usize,
}

/// Terminal state of one spawned job
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStatus {
    Completed(JobReport),
    Skipped,
    Failed,
}

/// Aggregate counters for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub items_checked: usize,
    pub new_units: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleStats {
    fn tally(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Completed(report) => {
                self.items_checked += 1;
                self.new_units += report.new_units;
            }
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Status snapshot for the control surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub active_workers: usize,
    pub rate_limit: RateLimitStatus,
}

/// Everything one job needs; cheap to clone into a spawned task
#[derive(Clone)]
struct JobRunner {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ContentStore>,
    notifier: Arc<dyn Notifier>,
    gate: RateLimitGate,
    retry: RetryPolicy,
}

impl JobRunner {
    /// Run one check job end to end, including its log entry
    async fn execute(&self, item: TrackedItem, mut schedule: Schedule, kind: JobKind) -> JobStatus {
        if self.gate.is_limited().await {
            let remaining_secs = self.gate.remaining_seconds().await;
            debug!(
                item_id = item.id,
                remaining_secs, "rate-limit pause active, job skipped"
            );
            return JobStatus::Skipped;
        }

        let started = Instant::now();
        match self.check_item(&item, &mut schedule).await {
            Ok(report) => {
                let elapsed = started.elapsed();
                if elapsed > SLOW_JOB_THRESHOLD {
                    warn!(
                        item = %item.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow check job"
                    );
                }

                let entry = JobLogEntry::success(
                    item.id,
                    kind,
                    report.units_found as i64,
                    report.new_units as i64,
                    elapsed.as_millis() as i64,
                );
                if let Err(e) = self.store.append_job_log(&entry).await {
                    error!(item_id = item.id, error = %e, "failed to append job log");
                }

                info!(
                    item = %item.name,
                    units_found = report.units_found,
                    new_units = report.new_units,
                    "check complete"
                );
                JobStatus::Completed(report)
            }
            Err(e) => {
                if e.kind() == ErrorKind::RateLimited {
                    self.gate.pause_for(e.retry_after_secs()).await;
                }

                let entry = JobLogEntry::failed(
                    item.id,
                    kind,
                    started.elapsed().as_millis() as i64,
                    e.to_string(),
                );
                if let Err(log_err) = self.store.append_job_log(&entry).await {
                    error!(item_id = item.id, error = %log_err, "failed to append job log");
                }

                error!(item = %item.name, kind = %e.kind(), error = %e, "check failed");
                JobStatus::Failed
            }
        }
    }

    /// Fetch, diff, persist, notify, reschedule. Write order is units first,
    /// then the schedule, then the log entry in [`execute`]: a crash between
    /// writes re-checks the item instead of losing units.
    async fn check_item(&self, item: &TrackedItem, schedule: &mut Schedule) -> Result<JobReport> {
        let metadata = self
            .retry
            .run(|| {
                let fetcher = Arc::clone(&self.fetcher);
                let external_id = item.external_id.clone();
                async move { fetcher.fetch_metadata(&external_id).await.map_err(Error::from) }
            })
            .await?;

        let scraped = self
            .retry
            .run(|| {
                let fetcher = Arc::clone(&self.fetcher);
                let external_id = item.external_id.clone();
                async move { fetcher.fetch_units(&external_id).await.map_err(Error::from) }
            })
            .await?;

        let units = diff::validate_batch(item.id, &scraped);
        let existing = self.store.get_existing_unit_ids(item.id).await?;
        let new_units = diff::find_new(&existing, &units);

        let landed = if new_units.is_empty() {
            Vec::new()
        } else {
            self.store.bulk_insert_units(&new_units).await?
        };
        if landed.len() < new_units.len() {
            // A concurrent writer beat us to the rest; they were (or will
            // be) announced by whoever inserted them.
            debug!(
                item_id = item.id,
                diffed = new_units.len(),
                inserted = landed.len(),
                "some units were already stored"
            );
        }

        let status_changed = metadata.status != item.status;
        if status_changed || metadata.display_name != item.name {
            let updated = TrackedItem {
                name: metadata.display_name.clone(),
                status: metadata.status,
                ..item.clone()
            };
            match self.store.upsert_item(&updated).await {
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    debug!(item_id = item.id, "item upsert conflicted, ignoring");
                }
                other => other?,
            }
        }

        if status_changed {
            let event = NotificationEvent::StatusChange {
                item_id: item.id,
                item_name: metadata.display_name.clone(),
                from: item.status,
                to: metadata.status,
            };
            if let Err(e) = self.notifier.emit(&event).await {
                error!(item_id = item.id, error = %e, "status-change notification failed");
            }
        }

        // Only the units this job wrote are announced; the batch decision
        // is sized on what landed, not on what the diff found
        for event in notify::events_for_new_units(item, &landed) {
            if let Err(e) = self.notifier.emit(&event).await {
                error!(item_id = item.id, error = %e, "release notification failed");
            }
        }

        let now = Utc::now();
        let publish_dates = self
            .store
            .get_publish_timestamps(item.id, PATTERN_HISTORY_LIMIT)
            .await?;

        scheduling::apply_job_result(schedule, landed.len(), &publish_dates, now);
        let next = scheduling::calculate_next_check(
            metadata.status,
            &publish_dates,
            schedule.consecutive_no_update,
            now,
        );
        schedule.check_interval_hours = next.interval_hours;
        schedule.next_check_at = next.next_check_at;

        match self.store.upsert_schedule(schedule).await {
            Err(e) if e.kind() == ErrorKind::Conflict => {
                debug!(item_id = item.id, "schedule upsert conflicted, ignoring");
            }
            other => other?,
        }

        Ok(JobReport {
            item_id: item.id,
            units_found: units.len(),
            new_units: landed.len(),
        })
    }
}

/// Bounded-concurrency scheduler over the due-item queue
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    runner: JobRunner,
    active_workers: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl JobOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn ContentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            runner: JobRunner {
                fetcher,
                store,
                notifier,
                gate: RateLimitGate::new(),
                retry: RetryPolicy::default(),
            },
            active_workers: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the default retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.runner.retry = retry;
        self
    }

    /// The process-wide rate-limit gate
    pub fn gate(&self) -> &RateLimitGate {
        &self.runner.gate
    }

    /// Status snapshot
    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.running.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
            rate_limit: self.runner.gate.status().await,
        }
    }

    /// Run cycles until shutdown is signalled
    ///
    /// A cycle that fails on infrastructure (the due-item query itself) is
    /// retried with doubling backoff; after `max_infra_failures` consecutive
    /// failures the loop gives up and returns the last error, which the
    /// binary turns into a non-zero exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "orchestrator started"
        );

        let mut infra_failures = 0u32;
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            match self.run_cycle(&mut shutdown).await {
                Ok(stats) => {
                    infra_failures = 0;
                    debug!(
                        checked = stats.items_checked,
                        new_units = stats.new_units,
                        failed = stats.failed,
                        skipped = stats.skipped,
                        "cycle complete"
                    );
                }
                Err(e) => {
                    infra_failures += 1;
                    error!(
                        error = %e,
                        consecutive = infra_failures,
                        max = self.config.max_infra_failures,
                        "cycle failed on infrastructure"
                    );
                    if infra_failures >= self.config.max_infra_failures {
                        break Err(e);
                    }

                    // Doubling backoff before trying the next cycle
                    let backoff =
                        Duration::from_secs(5 * 2u64.pow(infra_failures.saturating_sub(1)));
                    warn!(backoff_secs = backoff.as_secs(), "backing off before restart");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            // A dropped sender means no signal can arrive
                            if changed.is_err() {
                                break Ok(());
                            }
                        }
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        info!("orchestrator stopped");
        result
    }

    /// Run exactly one cycle; used by the `once` subcommand and tests
    pub async fn run_once(&self) -> Result<CycleStats> {
        let (_tx, mut rx) = watch::channel(false);
        self.run_cycle(&mut rx).await
    }

    /// One cycle: pull due items and check them under the worker cap
    async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<CycleStats> {
        let now = Utc::now();
        let due = self
            .runner
            .store
            .get_due_items(self.config.due_batch_limit, now)
            .await?;

        let mut stats = CycleStats::default();
        if due.is_empty() {
            debug!("no items due");
            return Ok(stats);
        }

        info!(due = due.len(), "starting check cycle");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut jobs: JoinSet<JobStatus> = JoinSet::new();

        for (item, schedule) in due {
            let runner = self.runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let active = Arc::clone(&self.active_workers);

            jobs.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return JobStatus::Skipped,
                };

                active.fetch_add(1, Ordering::SeqCst);
                let status = runner.execute(item, schedule, JobKind::Scheduled).await;
                active.fetch_sub(1, Ordering::SeqCst);
                status
            });
        }

        loop {
            tokio::select! {
                next = jobs.join_next() => {
                    match next {
                        Some(Ok(status)) => stats.tally(&status),
                        Some(Err(join_err)) => {
                            stats.failed += 1;
                            error!(error = %join_err, "job task panicked");
                        }
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone; no shutdown can arrive, just finish
                        drain(&mut jobs, &mut stats).await;
                        break;
                    }
                    if !*shutdown.borrow() {
                        continue;
                    }
                    let grace = self.config.shutdown_grace();
                    warn!(
                        grace_secs = grace.as_secs(),
                        in_flight = jobs.len(),
                        "shutdown requested, draining in-flight jobs"
                    );
                    if tokio::time::timeout(grace, drain(&mut jobs, &mut stats))
                        .await
                        .is_err()
                    {
                        warn!(aborted = jobs.len(), "grace period expired, aborting remaining jobs");
                        jobs.abort_all();
                    }
                    break;
                }
            }
        }

        Ok(stats)
    }
}

/// Await every remaining job, tallying as they land
async fn drain(jobs: &mut JoinSet<JobStatus>, stats: &mut CycleStats) {
    while let Some(next) = jobs.join_next().await {
        match next {
            Ok(status) => stats.tally(&status),
            Err(join_err) => {
                stats.failed += 1;
                error!(error = %join_err, "job task panicked");
            }
        }
    }
}
