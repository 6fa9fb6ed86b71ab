//! Event bus backed by Redis Streams with consumer groups.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{streams::StreamReadOptions, AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::bus::{EventBus, EventBusStats, EventHandler, PublishReceipt, SubscriptionConfig};
use super::EventEnvelope;
use crate::saga::SagaError;

/// Redis Streams event bus. One stream per topic; delivery is at-least-once
/// per consumer group with explicit acknowledgement after handling.
#[derive(Clone)]
pub struct RedisEventBus {
    pool: Pool,
    stats: Arc<RwLock<EventBusStats>>,
}

impl RedisEventBus {
    pub async fn new(redis_url: &str) -> Result<Self, SagaError> {
        let config = Config::from_url(redis_url);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SagaError::EventPublish {
                topic: String::new(),
                reason: format!("failed to create Redis pool: {e}"),
            })?;

        // Fail fast when Redis is unreachable
        let mut conn = pool.get().await.map_err(|e| SagaError::EventPublish {
            topic: String::new(),
            reason: format!("failed to get Redis connection: {e}"),
        })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SagaError::EventPublish {
                topic: String::new(),
                reason: format!("failed to ping Redis: {e}"),
            })?;

        info!("connected to Redis event bus at {redis_url}");

        Ok(Self {
            pool,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        })
    }

    async fn create_consumer_group(&self, topic: &str, group: &str) -> Result<(), SagaError> {
        let mut conn = self.connection(topic).await?;
        // BUSYGROUP means the group already exists; that is fine.
        let _: RedisResult<String> = conn.xgroup_create_mkstream(topic, group, "0").await;
        Ok(())
    }

    async fn connection(&self, topic: &str) -> Result<deadpool_redis::Connection, SagaError> {
        self.pool.get().await.map_err(|e| SagaError::EventPublish {
            topic: topic.to_string(),
            reason: format!("failed to get Redis connection: {e}"),
        })
    }

    async fn consume_loop(
        self,
        config: SubscriptionConfig,
        handler: Arc<dyn EventHandler>,
    ) {
        loop {
            let mut conn = match self.connection("").await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("event consumer lost Redis connection: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let opts = StreamReadOptions::default()
                .group(&config.consumer_group, &config.consumer_name)
                .count(config.batch_size)
                .block(config.poll_interval_ms as usize);
            let ids: Vec<&str> = config.topics.iter().map(|_| ">").collect();

            let streams: RedisResult<
                HashMap<String, Vec<HashMap<String, HashMap<String, String>>>>,
            > = conn.xread_options(&config.topics, &ids, &opts).await;

            match streams {
                Ok(streams) => {
                    for (topic, messages) in streams {
                        for message in messages {
                            for (message_id, fields) in message {
                                let Some(raw) = fields.get("event") else {
                                    continue;
                                };
                                match self
                                    .process_message(&topic, raw, handler.as_ref())
                                    .await
                                {
                                    Ok(()) => {
                                        let _: RedisResult<u64> = conn
                                            .xack(
                                                &topic,
                                                &config.consumer_group,
                                                &[&message_id],
                                            )
                                            .await;
                                        let mut stats = self.stats.write().await;
                                        stats.events_consumed += 1;
                                    }
                                    Err(e) => {
                                        // Unacked; Redis redelivers to the group.
                                        error!(
                                            %topic,
                                            %message_id,
                                            handler = handler.name(),
                                            "failed to process event: {e}"
                                        );
                                        let mut stats = self.stats.write().await;
                                        stats.events_failed += 1;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to read from streams: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_message(
        &self,
        topic: &str,
        raw: &str,
        handler: &dyn EventHandler,
    ) -> anyhow::Result<()> {
        let envelope: EventEnvelope = serde_json::from_str(raw)?;
        debug!(
            %topic,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "delivering event"
        );
        handler.handle(&envelope).await
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishReceipt, SagaError> {
        let topic = envelope.topic().to_string();
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.connection(&topic).await?;

        // XADD returns only after the entry is durable in the stream.
        let stream_id: String = conn
            .xadd(&topic, "*", &[("event", payload.as_str())])
            .await
            .map_err(|e| SagaError::EventPublish {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        {
            let mut stats = self.stats.write().await;
            stats.events_published += 1;
        }
        debug!(event_id = %envelope.event_id, %topic, %stream_id, "event published");

        let offset = stream_id
            .split('-')
            .next()
            .and_then(|ms| ms.parse::<u64>().ok())
            .unwrap_or(0);

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
        for topic in &config.topics {
            self.create_consumer_group(topic, &config.consumer_group)
                .await?;
        }

        {
            let mut stats = self.stats.write().await;
            stats.subscriptions += 1;
        }
        info!(
            subscription = %config.name,
            group = %config.consumer_group,
            topics = ?config.topics,
            "registered Redis subscription"
        );

        let bus = self.clone();
        tokio::spawn(bus.consume_loop(config, handler));

        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }
}
