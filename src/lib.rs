//! tsugi - Adaptive release tracker for serialized works
//!
//! Monitors serialized works (manga, webtoons, web novels) on a source site
//! and learns each work's release rhythm, so checks happen just ahead of the
//! expected release instead of on a fixed timer.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`pattern`] - Release-pattern analysis (intervals, weekday, confidence)
//! - [`diff`] - Scraped-vs-stored content diffing and validation
//! - [`scheduling`] - Adaptive next-check computation
//! - [`fetch`] - Source-site access with request pacing
//! - [`store`] - PostgreSQL persistence with connection supervision
//! - [`notify`] - Release and status-change notifications
//! - [`ratelimit`] - Process-wide rate-limit backpressure
//! - [`retry`] - Exponential-backoff retry policy
//! - [`orchestrator`] - Bounded-concurrency job execution
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tsugi::config::Config;
//! use tsugi::fetch::HttpSourceFetcher;
//! use tsugi::notify::NullNotifier;
//! use tsugi::orchestrator::JobOrchestrator;
//! use tsugi::store::{ConnectionSupervisor, PostgresStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let fetcher = Arc::new(HttpSourceFetcher::new(&config.source)?);
//!     let supervisor = Arc::new(ConnectionSupervisor::new(config.database.clone())?);
//!     let store = Arc::new(PostgresStore::new(supervisor));
//!     let orchestrator = JobOrchestrator::new(
//!         config.orchestrator.clone(),
//!         fetcher,
//!         store,
//!         Arc::new(NullNotifier),
//!     );
//!     // orchestrator.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod pattern;
pub mod ratelimit;
pub mod retry;
pub mod scheduling;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::models::{ContentUnit, ItemStatus, Schedule, TrackedItem};
    pub use crate::orchestrator::{JobOrchestrator, OrchestratorStatus};
    pub use crate::store::{ContentStore, PostgresStore};
}

// Direct re-exports for convenience
pub use models::{ContentUnit, ItemStatus, Schedule, TrackedItem};
