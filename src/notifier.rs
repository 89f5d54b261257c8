//! Control-Plane Notifier
//!
//! Emits metadata-only status events to the external bookkeeping system.
//! Publishing never blocks the caller: events go onto a bounded queue and a
//! background task delivers them with exponential backoff.

use crate::config::NotifierConfig;
use crate::error::{CollabError, CollabResult};
use crate::types::current_timestamp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kind of entity an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A dataset
    Dataset,
    /// A query
    Query,
}

/// Status change reported to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity identifier
    pub entity_id: String,
    /// New status name
    pub status: String,
    /// Extra metadata; never payload data
    pub metadata: BTreeMap<String, String>,
    /// Event time (Unix seconds)
    pub timestamp: u64,
}

impl StatusEvent {
    /// Event about a dataset
    pub fn dataset(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(EntityType::Dataset, id, status)
    }

    /// Event about a query
    pub fn query(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(EntityType::Query, id, status)
    }

    fn new(entity_type: EntityType, id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: id.into(),
            status: status.into(),
            metadata: BTreeMap::new(),
            timestamp: current_timestamp(),
        }
    }

    /// Attach a metadata entry
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_owned(), value.to_string());
        self
    }
}

/// Where core components publish status events
pub trait StatusSink: Send + Sync {
    /// Publish an event; must not block
    fn publish(&self, event: StatusEvent);

    /// Events confirmed delivered
    fn delivered_count(&self) -> u64 {
        0
    }

    /// Events given up on
    fn dropped_count(&self) -> u64 {
        0
    }
}

/// Delivery of one event to the control plane (HTTP callback, queue, ...)
#[async_trait]
pub trait ControlPlaneTransport: Send + Sync {
    /// Deliver an event; an error is treated as transient and retried
    async fn deliver(&self, event: &StatusEvent) -> CollabResult<()>;
}

#[derive(Default)]
struct NotifierStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

/// Retry delay before attempt `attempt + 1`
fn backoff_delay(config: &NotifierConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    let delay_ms = config.initial_backoff_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(config.max_backoff_ms))
}

/// Fire-and-forget notifier backed by a tokio task
pub struct ControlPlaneNotifier {
    sender: mpsc::Sender<StatusEvent>,
    stats: Arc<NotifierStats>,
    worker: JoinHandle<()>,
}

impl ControlPlaneNotifier {
    /// Start the delivery task on the current tokio runtime
    pub fn spawn(
        transport: Arc<dyn ControlPlaneTransport>,
        config: &NotifierConfig,
    ) -> CollabResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CollabError::ConfigurationError("notifier requires a tokio runtime".into())
        })?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(NotifierStats::default());
        let worker = runtime.spawn(run_delivery(
            receiver,
            transport,
            config.clone(),
            Arc::clone(&stats),
        ));

        Ok(Self {
            sender,
            stats,
            worker,
        })
    }

    /// Retries performed so far
    pub fn retries(&self) -> u64 {
        self.stats.retries.load(Ordering::Relaxed)
    }

    /// Stop accepting events and wait for the queue to drain
    pub async fn shutdown(self) {
        let Self { sender, worker, .. } = self;
        drop(sender);
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "notifier task ended abnormally");
        }
    }
}

impl StatusSink for ControlPlaneNotifier {
    fn publish(&self, event: StatusEvent) {
        if let Err(e) = self.sender.try_send(event) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            let event = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            tracing::warn!(
                entity_id = %event.entity_id,
                status = %event.status,
                "notification queue unavailable, event dropped"
            );
        }
    }

    fn delivered_count(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    fn dropped_count(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

async fn run_delivery(
    mut receiver: mpsc::Receiver<StatusEvent>,
    transport: Arc<dyn ControlPlaneTransport>,
    config: NotifierConfig,
    stats: Arc<NotifierStats>,
) {
    while let Some(event) = receiver.recv().await {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match transport.deliver(&event).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        entity_id = %event.entity_id,
                        status = %event.status,
                        attempt,
                        "status event delivered"
                    );
                    break;
                }
                Err(e) if attempt < config.max_attempts => {
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff_delay(&config, attempt);
                    tracing::debug!(
                        entity_id = %event.entity_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "status event delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        entity_id = %event.entity_id,
                        status = %event.status,
                        attempts = attempt,
                        error = %e,
                        "status event dropped after retries"
                    );
                    break;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlakyTransport {
        failures_left: AtomicU64,
        delivered: Mutex<Vec<StatusEvent>>,
    }

    impl FlakyTransport {
        fn new(failures: u64) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU64::new(failures),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ControlPlaneTransport for FlakyTransport {
        async fn deliver(&self, event: &StatusEvent) -> CollabResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CollabError::InternalError("503".into()));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = NotifierConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_event_builder() {
        let event = StatusEvent::dataset("d1", "available")
            .with("checksum", "abcd")
            .with("size", 42);
        assert_eq!(event.entity_type, EntityType::Dataset);
        assert_eq!(event.metadata["size"], "42");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["entity_type"], "dataset");
    }

    #[test]
    fn test_spawn_outside_runtime() {
        let transport = FlakyTransport::new(0);
        assert!(ControlPlaneNotifier::spawn(transport, &NotifierConfig::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_delivered() {
        let transport = FlakyTransport::new(2);
        let notifier =
            ControlPlaneNotifier::spawn(transport.clone(), &NotifierConfig::default()).unwrap();

        notifier.publish(StatusEvent::query("q1", "completed"));
        notifier.shutdown().await;

        let delivered = transport.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status, "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = FlakyTransport::new(u64::MAX);
        let config = NotifierConfig {
            max_attempts: 3,
            ..NotifierConfig::default()
        };
        let notifier = ControlPlaneNotifier::spawn(transport.clone(), &config).unwrap();

        notifier.publish(StatusEvent::dataset("d1", "failed"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(notifier.retries(), 2);
        assert_eq!(notifier.dropped_count(), 1);
        assert_eq!(notifier.delivered_count(), 0);
        assert!(transport.delivered.lock().unwrap().is_empty());
    }
}
