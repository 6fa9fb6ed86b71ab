//! Event bus trait and the in-memory implementation.
//!
//! Semantics shared by every implementation: publish returns once the
//! envelope is durable in the backing log, delivery is at-least-once per
//! consumer group, offsets commit only after a handler succeeds, and ordering
//! holds per aggregate id within one topic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::EventEnvelope;
use crate::saga::SagaError;

/// Acknowledgement of a durable publish
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    pub topic: String,
    pub offset: u64,
    pub published_at: DateTime<Utc>,
}

/// Event subscription configuration
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub name: String,
    pub topics: Vec<String>,
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            topics: super::topics::ALL.iter().map(|t| t.to_string()).collect(),
            consumer_group: "saga-service".to_string(),
            consumer_name: "saga-service-0".to_string(),
            batch_size: 16,
            poll_interval_ms: 20,
        }
    }
}

/// Handler invoked for each delivered envelope. Returning an error leaves the
/// offset uncommitted; the envelope is redelivered.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

/// Event bus statistics
#[derive(Debug, Default, Clone)]
pub struct EventBusStats {
    pub events_published: u64,
    pub events_consumed: u64,
    pub events_failed: u64,
    pub subscriptions: u64,
}

/// Event bus abstraction shared by the engine, the choreography observer and
/// the admin surface.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishReceipt, SagaError>;

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SagaError>;

    async fn stats(&self) -> EventBusStats;
}

#[derive(Default)]
struct TopicLog {
    entries: Vec<Arc<EventEnvelope>>,
    /// Committed offsets per consumer group (index of the next entry to read)
    offsets: HashMap<String, usize>,
}

/// In-memory event bus with append-only per-topic logs and consumer-group
/// offsets. Backs tests and single-process deployments.
#[derive(Clone)]
pub struct InMemoryEventBus {
    topics: Arc<RwLock<HashMap<String, Arc<RwLock<TopicLog>>>>>,
    stats: Arc<RwLock<EventBusStats>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    async fn topic_log(&self, topic: &str) -> Arc<RwLock<TopicLog>> {
        {
            let topics = self.topics.read().await;
            if let Some(log) = topics.get(topic) {
                return log.clone();
            }
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TopicLog::default())))
            .clone()
    }

    /// Snapshot of everything published to a topic, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<Arc<EventEnvelope>> {
        let log = self.topic_log(topic).await;
        let guard = log.read().await;
        guard.entries.clone()
    }

    /// Envelopes of a given type on one topic, in publish order.
    pub async fn published_of_type(
        &self,
        topic: &str,
        event_type: &str,
    ) -> Vec<Arc<EventEnvelope>> {
        self.published(topic)
            .await
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    async fn drain_topic(
        &self,
        topic: &str,
        config: &SubscriptionConfig,
        handler: &Arc<dyn EventHandler>,
    ) {
        let log = self.topic_log(topic).await;
        loop {
            let batch: Vec<Arc<EventEnvelope>> = {
                let guard = log.read().await;
                let committed = guard
                    .offsets
                    .get(&config.consumer_group)
                    .copied()
                    .unwrap_or(0);
                guard
                    .entries
                    .iter()
                    .skip(committed)
                    .take(config.batch_size)
                    .cloned()
                    .collect()
            };
            if batch.is_empty() {
                return;
            }

            for envelope in batch {
                match handler.handle(&envelope).await {
                    Ok(()) => {
                        let mut guard = log.write().await;
                        let offset = guard
                            .offsets
                            .entry(config.consumer_group.clone())
                            .or_insert(0);
                        *offset += 1;
                        drop(guard);
                        let mut stats = self.stats.write().await;
                        stats.events_consumed += 1;
                    }
                    Err(e) => {
                        // Offset stays uncommitted; the envelope is
                        // redelivered on the next poll.
                        error!(
                            handler = handler.name(),
                            event_id = %envelope.event_id,
                            topic,
                            "event handler failed, redelivering: {e}"
                        );
                        let mut stats = self.stats.write().await;
                        stats.events_failed += 1;
                        return;
                    }
                }
            }
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishReceipt, SagaError> {
        let topic = envelope.topic().to_string();
        let log = self.topic_log(&topic).await;
        let offset = {
            let mut guard = log.write().await;
            guard.entries.push(Arc::new(envelope.clone()));
            (guard.entries.len() - 1) as u64
        };

        {
            let mut stats = self.stats.write().await;
            stats.events_published += 1;
        }
        debug!(event_type = %envelope.event_type, %topic, offset, "event published");

        Ok(PublishReceipt {
            event_id: envelope.event_id,
            topic,
            offset,
            published_at: Utc::now(),
        })
    }

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SagaError> {
        {
            let mut stats = self.stats.write().await;
            stats.subscriptions += 1;
        }
        info!(
            subscription = %config.name,
            group = %config.consumer_group,
            topics = ?config.topics,
            "registered in-memory subscription"
        );

        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(config.poll_interval_ms));
            loop {
                ticker.tick().await;
                for topic in &config.topics {
                    bus.drain_topic(topic, &config, &handler).await;
                }
            }
        });

        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }
}
