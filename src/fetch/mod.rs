//! Source site access
//!
//! [`SourceFetcher`] is the seam between the orchestrator and the source
//! site: given an item's external id it returns the current metadata and the
//! full unit list. [`HttpSourceFetcher`] is the production implementation, a
//! governor-paced reqwest client against the source's JSON API; tests
//! substitute their own implementations.
//!
//! Status mapping: HTTP 429 becomes [`FetchError::RateLimited`] carrying the
//! Retry-After hint, 5xx becomes a retryable network error, other non-2xx
//! and undecodable bodies become protocol errors.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::{ScrapedUnit, SourceMetadata};

/// Access to the tracked items' source site
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the full list of content units for an item
    async fn fetch_units(&self, external_id: &str) -> Result<Vec<ScrapedUnit>, FetchError>;

    /// Fetch the item's current metadata
    async fn fetch_metadata(&self, external_id: &str) -> Result<SourceMetadata, FetchError>;
}

#[derive(Debug, Deserialize)]
struct UnitsResponse {
    units: Vec<ScrapedUnit>,
}

/// HTTP implementation of [`SourceFetcher`]
pub struct HttpSourceFetcher {
    client: Client,

    /// Paces outgoing requests below the configured per-second quota
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    base_url: String,
}

impl HttpSourceFetcher {
    /// Create a fetcher from the source configuration
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(config.rate_limit).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Response, FetchError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "fetching from source");

        let response = self.client.get(&url).send().await.map_err(map_send_error)?;
        check_status(response)
    }
}

/// Map a transport-level reqwest error onto the taxonomy
fn map_send_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::Connection(e.to_string())
    } else {
        FetchError::Http(e)
    }
}

/// Turn a non-success status into the matching error
fn check_status(response: Response) -> Result<Response, FetchError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(FetchError::RateLimited { retry_after_secs });
    }

    if status.is_server_error() {
        return Err(FetchError::ServerError(status.as_u16()));
    }

    Err(FetchError::Protocol(format!(
        "unexpected status {status} from source"
    )))
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_units(&self, external_id: &str) -> Result<Vec<ScrapedUnit>, FetchError> {
        let response = self.get(&format!("/items/{external_id}/units")).await?;

        let body: UnitsResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Protocol(format!("undecodable units response: {e}")))?;

        Ok(body.units)
    }

    async fn fetch_metadata(&self, external_id: &str) -> Result<SourceMetadata, FetchError> {
        let response = self.get(&format!("/items/{external_id}")).await?;

        response
            .json()
            .await
            .map_err(|e| FetchError::Protocol(format!("undecodable metadata response: {e}")))
    }
}
