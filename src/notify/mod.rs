//! Subscriber notification
//!
//! The core decides *whether* and *what* to notify; delivery belongs to the
//! [`Notifier`] implementation. Delivery failures are logged and never fail
//! the job that produced the event. Duplicate-delivery protection falls out
//! of insert idempotence: a unit is only ever reported as new by the one job
//! that inserted it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::config::NotifierConfig;
use crate::diff;
use crate::error::Error;
use crate::models::{ContentUnit, ItemStatus, TrackedItem};

/// A structured event handed to the notifier
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// One new unit appeared
    NewUnit {
        item_id: i64,
        item_name: String,
        unit: ContentUnit,
    },

    /// Several units appeared at once and are announced together
    NewUnitBatch {
        item_id: i64,
        item_name: String,
        units: Vec<ContentUnit>,
    },

    /// The item's lifecycle status changed
    StatusChange {
        item_id: i64,
        item_name: String,
        from: ItemStatus,
        to: ItemStatus,
    },
}

impl NotificationEvent {
    /// Importance level: 1 = normal, 2 = batch, 3 = critical
    pub fn importance(&self) -> u8 {
        match self {
            Self::NewUnit { .. } => 1,
            Self::NewUnitBatch { .. } => 2,
            Self::StatusChange { .. } => 3,
        }
    }

    /// Short description for logging
    pub fn describe(&self) -> String {
        match self {
            Self::NewUnit { item_name, unit, .. } => {
                format!("{item_name}: {}", unit.label)
            }
            Self::NewUnitBatch { item_name, units, .. } => {
                format!("{item_name}: {} new units", units.len())
            }
            Self::StatusChange {
                item_name, from, to, ..
            } => format!("{item_name}: status {from} -> {to}"),
        }
    }
}

/// Build the new-unit events for one job
///
/// At most one *batch decision* is made per job: a single new unit gets one
/// event, three or more get exactly one combined batch event, and exactly
/// two get one event per unit. No units, no events.
pub fn events_for_new_units(item: &TrackedItem, new_units: &[ContentUnit]) -> Vec<NotificationEvent> {
    match new_units.len() {
        0 => Vec::new(),
        1 => vec![NotificationEvent::NewUnit {
            item_id: item.id,
            item_name: item.name.clone(),
            unit: new_units[0].clone(),
        }],
        _ if diff::should_batch(new_units) => vec![NotificationEvent::NewUnitBatch {
            item_id: item.id,
            item_name: item.name.clone(),
            units: new_units.to_vec(),
        }],
        _ => new_units
            .iter()
            .map(|unit| NotificationEvent::NewUnit {
                item_id: item.id,
                item_name: item.name.clone(),
                unit: unit.clone(),
            })
            .collect(),
    }
}

/// Delivery contract; fire-and-forget from the core's perspective
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, event: &NotificationEvent) -> Result<(), Error>;
}

/// Notifier used when no delivery channel is configured
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn emit(&self, event: &NotificationEvent) -> Result<(), Error> {
        info!(importance = event.importance(), event = %event.describe(), "notification (no channel configured)");
        Ok(())
    }
}

/// Webhook delivery: events are POSTed as JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Option<Self>, Error> {
        let Some(url) = config.webhook_url.clone() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()
            .map_err(|e| Error::other(format!("failed to create webhook client: {e}")))?;

        Ok(Some(Self { client, url }))
    }

    fn build_payload(&self, event: &NotificationEvent) -> serde_json::Value {
        serde_json::json!({
            "importance": event.importance(),
            "summary": event.describe(),
            "event": event,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn emit(&self, event: &NotificationEvent) -> Result<(), Error> {
        let payload = self.build_payload(event);

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    importance = event.importance(),
                    event = %event.describe(),
                    "notification delivered"
                );
                Ok(())
            }
            Ok(response) => {
                error!(
                    status = %response.status(),
                    event = %event.describe(),
                    "webhook rejected notification"
                );
                Ok(())
            }
            Err(e) => {
                // Delivery failure must never fail the job
                error!(error = %e, event = %event.describe(), "webhook delivery failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item() -> TrackedItem {
        TrackedItem {
            id: 1,
            external_id: String::from("solo-farming"),
            name: String::from("Solo Farming in the Tower"),
            status: ItemStatus::Ongoing,
            is_active: true,
        }
    }

    fn unit(source_id: &str, number: f64) -> ContentUnit {
        ContentUnit {
            item_id: 1,
            source_id: source_id.to_string(),
            number,
            label: format!("Chapter {number}"),
            title: None,
            url: format!("https://source.example/ch/{source_id}"),
            published_at: None,
            views: 0,
        }
    }

    #[test]
    fn test_no_units_no_events() {
        assert!(events_for_new_units(&item(), &[]).is_empty());
    }

    #[test]
    fn test_single_unit_single_event() {
        let events = events_for_new_units(&item(), &[unit("a", 1.0)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NotificationEvent::NewUnit { .. }));
        assert_eq!(events[0].importance(), 1);
    }

    #[test]
    fn test_two_units_two_single_events() {
        let events = events_for_new_units(&item(), &[unit("a", 1.0), unit("b", 2.0)]);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, NotificationEvent::NewUnit { .. })));
    }

    #[test]
    fn test_three_units_one_batch() {
        let units = vec![unit("a", 1.0), unit("b", 2.0), unit("c", 3.0)];
        let events = events_for_new_units(&item(), &units);

        assert_eq!(events.len(), 1);
        match &events[0] {
            NotificationEvent::NewUnitBatch { units, .. } => assert_eq!(units.len(), 3),
            other => panic!("expected batch, got {other:?}"),
        }
        assert_eq!(events[0].importance(), 2);
    }

    #[test]
    fn test_status_change_is_critical() {
        let event = NotificationEvent::StatusChange {
            item_id: 1,
            item_name: String::from("x"),
            from: ItemStatus::Ongoing,
            to: ItemStatus::Completed,
        };
        assert_eq!(event.importance(), 3);
        assert!(event.describe().contains("ongoing -> completed"));
    }

    #[tokio::test]
    async fn test_webhook_delivers_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = NotifierConfig {
            webhook_url: Some(format!("{}/notify", server.uri())),
            webhook_timeout_secs: 5,
        };
        let notifier = WebhookNotifier::new(&config).unwrap().unwrap();

        let event = events_for_new_units(&item(), &[unit("a", 1.0)]).remove(0);
        notifier.emit(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = NotifierConfig {
            webhook_url: Some(format!("{}/notify", server.uri())),
            webhook_timeout_secs: 5,
        };
        let notifier = WebhookNotifier::new(&config).unwrap().unwrap();

        let event = events_for_new_units(&item(), &[unit("a", 1.0)]).remove(0);
        assert!(notifier.emit(&event).await.is_ok());
    }

    #[test]
    fn test_unconfigured_webhook_is_none() {
        let config = NotifierConfig {
            webhook_url: None,
            webhook_timeout_secs: 5,
        };
        assert!(WebhookNotifier::new(&config).unwrap().is_none());
    }
}
