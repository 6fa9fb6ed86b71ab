//! Business event envelopes, topic routing and bus implementations.

pub mod bus;
pub mod redis_bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{EventBus, EventBusStats, EventHandler, InMemoryEventBus, PublishReceipt, SubscriptionConfig};
pub use redis_bus::RedisEventBus;

/// Event type identifiers published and consumed by the engine
pub mod event_types {
    pub const SAGA_STARTED: &str = "SagaStarted";
    pub const STEP_COMPLETED: &str = "StepCompleted";
    pub const STEP_FAILED: &str = "StepFailed";
    pub const SAGA_COMPLETED: &str = "SagaCompleted";
    pub const SAGA_COMPENSATED: &str = "SagaCompensated";
    pub const SAGA_FAILED: &str = "SagaFailed";
    pub const COMPENSATION_EXECUTED: &str = "CompensationExecuted";
    pub const SAGA_COMPENSATION_STARTED: &str = "SagaCompensationStarted";
    pub const SAGA_COMPENSATION_COMPLETED: &str = "SagaCompensationCompleted";

    // Choreographed order flow, emitted by participants
    pub const ORDER_CREATED: &str = "OrderCreated";
    pub const STOCK_RESERVED: &str = "StockReserved";
    pub const PAYMENT_PROCESSED: &str = "PaymentProcessed";
    pub const ORDER_CONFIRMED: &str = "OrderConfirmed";
    pub const NOTIFICATION_SENT: &str = "NotificationSent";
    pub const ORDER_CANCELLED: &str = "OrderCancelled";
    pub const STOCK_RELEASED: &str = "StockReleased";
    pub const PAYMENT_REFUNDED: &str = "PaymentRefunded";
}

/// Logical topic names
pub mod topics {
    pub const SAGAS: &str = "sagas.events";
    pub const ORDERS: &str = "orders.events";
    pub const PAYMENTS: &str = "payments.events";
    pub const INVENTORY: &str = "inventory.events";
    pub const CARTS: &str = "carts.events";
    pub const BUSINESS: &str = "business.events";

    pub const ALL: [&str; 6] = [SAGAS, ORDERS, PAYMENTS, INVENTORY, CARTS, BUSINESS];
}

/// Deterministic event-type to topic routing.
pub fn topic_for(event_type: &str) -> &'static str {
    let lowered = event_type.to_ascii_lowercase();
    if lowered.starts_with("saga") {
        topics::SAGAS
    } else if lowered.starts_with("order") {
        topics::ORDERS
    } else if lowered.starts_with("payment") {
        topics::PAYMENTS
    } else if lowered.starts_with("stock") || lowered.starts_with("inventory") {
        topics::INVENTORY
    } else if lowered.starts_with("cart") {
        topics::CARTS
    } else {
        topics::BUSINESS
    }
}

/// Envelope metadata tying an event back to its business operation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// Wire envelope wrapping every business event. camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub data: serde_json::Value,
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            timestamp: Utc::now(),
            version: 1,
            data,
            metadata: EventMetadata {
                correlation_id: Uuid::new_v4(),
                saga_id: None,
                step: None,
                total_steps: None,
            },
        }
    }

    /// Envelope for a saga lifecycle event, partitioned by saga id.
    pub fn for_saga(
        event_type: impl Into<String>,
        saga_id: Uuid,
        correlation_id: Uuid,
        data: serde_json::Value,
    ) -> Self {
        let mut envelope = Self::new(event_type, saga_id.to_string(), "Saga", data);
        envelope.metadata.correlation_id = correlation_id;
        envelope.metadata.saga_id = Some(saga_id);
        envelope
    }

    pub fn with_step(mut self, step: impl Into<String>, total_steps: u32) -> Self {
        self.metadata.step = Some(step.into());
        self.metadata.total_steps = Some(total_steps);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Topic this envelope routes to.
    pub fn topic(&self) -> &'static str {
        topic_for(&self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_routing() {
        assert_eq!(topic_for("SagaStarted"), topics::SAGAS);
        assert_eq!(topic_for("SagaCompensationStarted"), topics::SAGAS);
        assert_eq!(topic_for("OrderCreated"), topics::ORDERS);
        assert_eq!(topic_for("OrderCancelled"), topics::ORDERS);
        assert_eq!(topic_for("PaymentProcessed"), topics::PAYMENTS);
        assert_eq!(topic_for("StockReserved"), topics::INVENTORY);
        assert_eq!(topic_for("InventoryAdjusted"), topics::INVENTORY);
        assert_eq!(topic_for("StepCompleted"), topics::BUSINESS);
        assert_eq!(topic_for("NotificationSent"), topics::BUSINESS);
    }

    #[test]
    fn test_envelope_wire_format_is_camel_case() {
        let saga_id = Uuid::new_v4();
        let envelope = EventEnvelope::for_saga(
            event_types::SAGA_STARTED,
            saga_id,
            Uuid::new_v4(),
            serde_json::json!({"sagaType": "SaleSaga"}),
        )
        .with_step("ValidateStore", 5);

        let wire = serde_json::to_value(&envelope).unwrap();
        assert!(wire.get("eventId").is_some());
        assert!(wire.get("aggregateId").is_some());
        assert_eq!(wire["aggregateType"], "Saga");
        assert_eq!(wire["metadata"]["sagaId"], saga_id.to_string());
        assert_eq!(wire["metadata"]["step"], "ValidateStore");
        assert_eq!(wire["metadata"]["totalSteps"], 5);
    }

    #[test]
    fn test_envelope_topic() {
        let envelope = EventEnvelope::new(
            event_types::PAYMENT_REFUNDED,
            "pay-1",
            "Payment",
            serde_json::json!({}),
        );
        assert_eq!(envelope.topic(), topics::PAYMENTS);
    }
}
