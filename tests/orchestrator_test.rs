//! End-to-end orchestrator tests over in-memory fakes
//!
//! These exercise the whole job path: due-item pickup, bounded concurrency,
//! diffing against stored units, notification decisions, schedule updates,
//! and the process-wide rate-limit pause.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tsugi::config::OrchestratorConfig;
use tsugi::error::{Error, FetchError, StoreError};
use tsugi::fetch::SourceFetcher;
use tsugi::models::{
    ContentUnit, ItemStatus, JobLogEntry, JobOutcome, Schedule, ScrapedUnit, SourceMetadata,
    TrackedItem,
};
use tsugi::notify::{NotificationEvent, Notifier};
use tsugi::orchestrator::JobOrchestrator;
use tsugi::retry::RetryPolicy;
use tsugi::store::ContentStore;

// ==================== fakes ====================

#[derive(Default)]
struct FakeFetcher {
    units: Mutex<HashMap<String, Vec<ScrapedUnit>>>,
    metadata: Mutex<HashMap<String, SourceMetadata>>,
    rate_limited: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn set_units(&self, external_id: &str, units: Vec<ScrapedUnit>) {
        self.units
            .lock()
            .unwrap()
            .insert(external_id.to_string(), units);
    }

    fn set_metadata(&self, external_id: &str, metadata: SourceMetadata) {
        self.metadata
            .lock()
            .unwrap()
            .insert(external_id.to_string(), metadata);
    }

    fn set_rate_limited(&self, external_id: &str) {
        self.rate_limited
            .lock()
            .unwrap()
            .insert(external_id.to_string());
    }

    fn set_broken(&self, external_id: &str) {
        self.broken.lock().unwrap().insert(external_id.to_string());
    }

    async fn enter(&self, external_id: &str) -> Result<(), FetchError> {
        if self.rate_limited.lock().unwrap().contains(external_id) {
            return Err(FetchError::RateLimited {
                retry_after_secs: Some(60),
            });
        }
        if self.broken.lock().unwrap().contains(external_id) {
            return Err(FetchError::Protocol(String::from("scrambled response")));
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch_units(&self, external_id: &str) -> Result<Vec<ScrapedUnit>, FetchError> {
        self.enter(external_id).await?;
        Ok(self
            .units
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_metadata(&self, external_id: &str) -> Result<SourceMetadata, FetchError> {
        self.enter(external_id).await?;
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .unwrap_or(SourceMetadata {
                status: ItemStatus::Ongoing,
                display_name: external_id.to_string(),
            }))
    }
}

#[derive(Default)]
struct FakeStore {
    due: Mutex<Vec<(TrackedItem, Schedule)>>,
    items: Mutex<HashMap<i64, TrackedItem>>,
    units: Mutex<HashMap<i64, Vec<ContentUnit>>>,
    schedules: Mutex<HashMap<i64, Schedule>>,
    log: Mutex<Vec<JobLogEntry>>,
    /// When set, the diff sees an empty store even though units exist,
    /// simulating a concurrent writer landing between diff and insert
    stale_diff: std::sync::atomic::AtomicBool,
}

impl FakeStore {
    fn add_due(&self, item: TrackedItem, schedule: Schedule) {
        self.due.lock().unwrap().push((item, schedule));
    }

    fn seed_units(&self, item_id: i64, units: Vec<ContentUnit>) {
        self.units.lock().unwrap().insert(item_id, units);
    }

    fn schedule_for(&self, item_id: i64) -> Option<Schedule> {
        self.schedules.lock().unwrap().get(&item_id).cloned()
    }

    fn log_entries(&self) -> Vec<JobLogEntry> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentStore for FakeStore {
    async fn get_due_items(
        &self,
        limit: i64,
        _now: DateTime<Utc>,
    ) -> Result<Vec<(TrackedItem, Schedule)>, StoreError> {
        let due = self.due.lock().unwrap();
        Ok(due.iter().take(limit as usize).cloned().collect())
    }

    async fn get_existing_unit_ids(&self, item_id: i64) -> Result<HashSet<String>, StoreError> {
        if self.stale_diff.load(Ordering::SeqCst) {
            return Ok(HashSet::new());
        }
        let units = self.units.lock().unwrap();
        Ok(units
            .get(&item_id)
            .map(|list| list.iter().map(|u| u.source_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn bulk_insert_units(
        &self,
        units: &[ContentUnit],
    ) -> Result<Vec<ContentUnit>, StoreError> {
        let mut stored = self.units.lock().unwrap();
        let mut landed = Vec::new();
        for unit in units {
            let list = stored.entry(unit.item_id).or_default();
            if !list.iter().any(|u| u.source_id == unit.source_id) {
                list.push(unit.clone());
                landed.push(unit.clone());
            }
        }
        Ok(landed)
    }

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.item_id, schedule.clone());
        Ok(())
    }

    async fn upsert_item(&self, item: &TrackedItem) -> Result<(), StoreError> {
        self.items.lock().unwrap().insert(item.id, item.clone());
        Ok(())
    }

    async fn register_item(&self, external_id: &str, name: &str) -> Result<i64, StoreError> {
        let mut items = self.items.lock().unwrap();
        let id = items.len() as i64 + 1;
        items.insert(
            id,
            TrackedItem {
                id,
                external_id: external_id.to_string(),
                name: name.to_string(),
                status: ItemStatus::Unknown,
                is_active: true,
            },
        );
        Ok(id)
    }

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError> {
        self.log.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn get_publish_timestamps(
        &self,
        item_id: i64,
        limit: i64,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let units = self.units.lock().unwrap();
        let mut dates: Vec<_> = units
            .get(&item_id)
            .map(|list| list.iter().filter_map(|u| u.published_at).collect())
            .unwrap_or_default();
        dates.sort_unstable_by(|a: &DateTime<Utc>, b| b.cmp(a));
        dates.truncate(limit as usize);
        Ok(dates)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(&self, event: &NotificationEvent) -> Result<(), Error> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ==================== helpers ====================

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_secs: 1,
        max_concurrent_jobs: 5,
        due_batch_limit: 50,
        shutdown_grace_secs: 1,
        max_infra_failures: 3,
    }
}

fn item(id: i64, external_id: &str) -> TrackedItem {
    TrackedItem {
        id,
        external_id: external_id.to_string(),
        name: external_id.to_string(),
        status: ItemStatus::Ongoing,
        is_active: true,
    }
}

fn scraped(source_id: &str, number: f64) -> ScrapedUnit {
    ScrapedUnit {
        source_id: Some(source_id.to_string()),
        number: Some(number),
        label: Some(format!("Chapter {number}")),
        url: Some(format!("https://source.example/ch/{source_id}")),
        ..Default::default()
    }
}

fn stored(item_id: i64, source_id: &str, number: f64) -> ContentUnit {
    ContentUnit {
        item_id,
        source_id: source_id.to_string(),
        number,
        label: format!("Chapter {number}"),
        title: None,
        url: format!("https://source.example/ch/{source_id}"),
        published_at: None,
        views: 0,
    }
}

struct Harness {
    fetcher: Arc<FakeFetcher>,
    store: Arc<FakeStore>,
    notifier: Arc<RecordingNotifier>,
    orchestrator: JobOrchestrator,
}

fn harness(fetcher: FakeFetcher) -> Harness {
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(FakeStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = JobOrchestrator::new(
        test_config(),
        Arc::clone(&fetcher) as Arc<dyn SourceFetcher>,
        Arc::clone(&store) as Arc<dyn ContentStore>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    )
    .with_retry_policy(RetryPolicy::new(1));

    Harness {
        fetcher,
        store,
        notifier,
        orchestrator,
    }
}

// ==================== tests ====================

#[tokio::test]
async fn test_concurrency_never_exceeds_cap() {
    let h = harness(FakeFetcher::with_delay(Duration::from_millis(50)));

    for i in 1..=20 {
        let external_id = format!("work-{i}");
        h.store
            .add_due(item(i, &external_id), Schedule::bootstrap(i, Utc::now()));
    }

    let stats = h.orchestrator.run_once().await.unwrap();

    assert_eq!(stats.items_checked, 20);
    assert_eq!(stats.failed, 0);
    let max = h.fetcher.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 5, "worker cap exceeded: {max} concurrent fetches");
    assert!(max >= 2, "jobs never overlapped");
}

#[tokio::test]
async fn test_new_units_are_inserted_and_batched() {
    let h = harness(FakeFetcher::default());

    h.store
        .add_due(item(1, "tower"), Schedule::bootstrap(1, Utc::now()));
    h.store
        .seed_units(1, vec![stored(1, "a", 1.0), stored(1, "b", 2.0)]);
    h.fetcher.set_units(
        "tower",
        vec![
            scraped("a", 1.0),
            scraped("b", 2.0),
            scraped("c", 3.0),
            scraped("d", 4.0),
            scraped("e", 5.0),
        ],
    );

    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.items_checked, 1);
    assert_eq!(stats.new_units, 3);

    // Only c, d, e were inserted
    let ids = h.store.get_existing_unit_ids(1).await.unwrap();
    assert_eq!(ids.len(), 5);
    assert!(ids.contains("e"));

    // Three new units collapse into exactly one batch notification
    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        NotificationEvent::NewUnitBatch { units, .. } => {
            let batch_ids: Vec<_> = units.iter().map(|u| u.source_id.as_str()).collect();
            assert_eq!(batch_ids, vec!["c", "d", "e"]);
        }
        other => panic!("expected a batch event, got {other:?}"),
    }

    // Schedule was advanced and the counter reset
    let schedule = h.store.schedule_for(1).unwrap();
    assert_eq!(schedule.consecutive_no_update, 0);
    assert_eq!(schedule.total_units, 3);
    assert!(schedule.next_check_at > Utc::now());

    // Success log entry with the right counts
    let log = h.store.log_entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, JobOutcome::Success);
    assert_eq!(log[0].units_found, 5);
    assert_eq!(log[0].new_units, 3);
}

#[tokio::test]
async fn test_empty_check_stretches_interval() {
    let h = harness(FakeFetcher::default());

    h.store
        .add_due(item(1, "tower"), Schedule::bootstrap(1, Utc::now()));
    h.store.seed_units(1, vec![stored(1, "a", 1.0)]);
    h.fetcher.set_units("tower", vec![scraped("a", 1.0)]);

    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.items_checked, 1);
    assert_eq!(stats.new_units, 0);

    // One empty check: counter at 1, 24h base stretched to 36h
    let schedule = h.store.schedule_for(1).unwrap();
    assert_eq!(schedule.consecutive_no_update, 1);
    assert!((schedule.check_interval_hours - 36.0).abs() < 1e-9);
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_rate_limit_pauses_whole_process() {
    let h = harness(FakeFetcher::default());

    h.store
        .add_due(item(1, "limited"), Schedule::bootstrap(1, Utc::now()));
    h.store
        .add_due(item(2, "fine"), Schedule::bootstrap(2, Utc::now()));
    h.fetcher.set_rate_limited("limited");
    h.fetcher.set_rate_limited("fine"); // both would trip it; order-independent

    let stats = h.orchestrator.run_once().await.unwrap();
    // At least the first job hit the limit; any job queued behind the pause
    // is skipped rather than failed
    assert!(stats.failed >= 1);
    assert_eq!(stats.failed + stats.skipped, 2);
    assert!(h.orchestrator.gate().is_limited().await);
    let remaining = h.orchestrator.gate().remaining_seconds().await;
    assert!((55..=60).contains(&remaining), "unexpected pause: {remaining}s");

    // The next full cycle starts everything as skipped
    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.items_checked, 0);

    // Once cleared, jobs run again
    h.orchestrator.gate().clear().await;
    h.fetcher.rate_limited.lock().unwrap().clear();
    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.items_checked, 2);
}

#[tokio::test]
async fn test_lost_insert_race_announces_only_landed_units() {
    let h = harness(FakeFetcher::default());

    h.store
        .add_due(item(1, "tower"), Schedule::bootstrap(1, Utc::now()));
    // Units a and b are already stored, but the diff works from a stale
    // snapshot that predates them
    h.store
        .seed_units(1, vec![stored(1, "a", 1.0), stored(1, "b", 2.0)]);
    h.store.stale_diff.store(true, Ordering::SeqCst);
    h.fetcher.set_units(
        "tower",
        vec![scraped("a", 1.0), scraped("b", 2.0), scraped("c", 3.0)],
    );

    let stats = h.orchestrator.run_once().await.unwrap();

    // The diff saw three new units but only c's insert landed
    assert_eq!(stats.new_units, 1);

    // One single event for c; no batch sized on the stale diff
    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        NotificationEvent::NewUnit { unit, .. } => assert_eq!(unit.source_id, "c"),
        other => panic!("expected a single new-unit event, got {other:?}"),
    }

    // The schedule counts only the landed unit
    let schedule = h.store.schedule_for(1).unwrap();
    assert_eq!(schedule.total_units, 1);

    let log = h.store.log_entries();
    assert_eq!(log[0].new_units, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cycle_runs_on_a_multithreaded_runtime() {
    // Job futures cross threads here; this fails to build if they stop
    // being Send
    let h = harness(FakeFetcher::with_delay(Duration::from_millis(5)));

    for i in 1..=4 {
        let external_id = format!("work-{i}");
        h.store
            .add_due(item(i, &external_id), Schedule::bootstrap(i, Utc::now()));
    }
    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.items_checked, 4);
}

#[tokio::test]
async fn test_failing_item_does_not_affect_others() {
    let h = harness(FakeFetcher::default());

    for (id, external_id) in [(1, "alpha"), (2, "broken"), (3, "gamma")] {
        h.store
            .add_due(item(id, external_id), Schedule::bootstrap(id, Utc::now()));
    }
    h.fetcher.set_broken("broken");

    let stats = h.orchestrator.run_once().await.unwrap();
    assert_eq!(stats.items_checked, 2);
    assert_eq!(stats.failed, 1);

    // The failing item got a failure log entry; its schedule is untouched
    let log = h.store.log_entries();
    let failed: Vec<_> = log
        .iter()
        .filter(|e| e.outcome == JobOutcome::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item_id, 2);
    assert!(failed[0].error.is_some());
    assert!(h.store.schedule_for(2).is_none());

    // The healthy items were rescheduled
    assert!(h.store.schedule_for(1).is_some());
    assert!(h.store.schedule_for(3).is_some());
}

#[tokio::test]
async fn test_status_change_notifies_and_reschedules() {
    let h = harness(FakeFetcher::default());

    h.store
        .add_due(item(1, "finale"), Schedule::bootstrap(1, Utc::now()));
    h.fetcher.set_metadata(
        "finale",
        SourceMetadata {
            status: ItemStatus::Completed,
            display_name: String::from("finale"),
        },
    );

    h.orchestrator.run_once().await.unwrap();

    // Critical status-change event
    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        NotificationEvent::StatusChange { from, to, .. } => {
            assert_eq!(*from, ItemStatus::Ongoing);
            assert_eq!(*to, ItemStatus::Completed);
        }
        other => panic!("expected a status-change event, got {other:?}"),
    }
    assert_eq!(events[0].importance(), 3);

    // The stored item reflects the new status
    let updated = h.store.items.lock().unwrap().get(&1).cloned().unwrap();
    assert_eq!(updated.status, ItemStatus::Completed);

    // Completed items drop to the 30-day interval
    let schedule = h.store.schedule_for(1).unwrap();
    assert!((schedule.check_interval_hours - 720.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_status_snapshot() {
    let h = harness(FakeFetcher::default());

    let status = h.orchestrator.status().await;
    assert!(!status.running);
    assert_eq!(status.active_workers, 0);
    assert!(!status.rate_limit.is_limited);

    h.orchestrator.gate().pause_for(Some(30)).await;
    let status = h.orchestrator.status().await;
    assert!(status.rate_limit.is_limited);
    assert!(status.rate_limit.remaining_seconds > 0);
}
