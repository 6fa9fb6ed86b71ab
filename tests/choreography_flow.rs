//! Choreographed order flow: the observer follows participant events on the
//! bus and persists saga state without invoking anyone.

use std::sync::Arc;
use std::time::Duration;

use saga_service::choreography::ChoreographyCoordinator;
use saga_service::events::{
    event_types, topics, EventBus, EventEnvelope, InMemoryEventBus,
};
use saga_service::saga::{SagaState, StepStatus};
use saga_service::store::{InMemorySagaStore, SagaStore};
use uuid::Uuid;

struct Flow {
    store: Arc<InMemorySagaStore>,
    bus: Arc<InMemoryEventBus>,
    observer: Arc<ChoreographyCoordinator>,
    saga_id: Uuid,
    correlation_id: Uuid,
}

async fn flow() -> Flow {
    let store = Arc::new(InMemorySagaStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let observer = Arc::new(ChoreographyCoordinator::new(store.clone(), bus.clone()));
    observer.spawn("choreography-test").await.unwrap();

    Flow {
        store,
        bus,
        observer,
        saga_id: Uuid::new_v4(),
        correlation_id: Uuid::new_v4(),
    }
}

impl Flow {
    async fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.bus
            .publish(EventEnvelope::for_saga(
                event_type,
                self.saga_id,
                self.correlation_id,
                data,
            ))
            .await
            .unwrap();
    }

    /// Poll until the saga reaches the expected state or time runs out.
    async fn wait_for_state(&self, expected: SagaState) {
        for _ in 0..100 {
            if let Ok(Some(record)) = self.store.get(self.saga_id).await {
                if record.current_state == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let actual = self
            .store
            .get(self.saga_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.current_state.to_string())
            .unwrap_or_else(|| "<missing>".to_string());
        panic!("saga never reached {expected}, stuck at {actual}");
    }
}

#[tokio::test]
async fn happy_path_completes_after_the_fifth_event() {
    let f = flow().await;

    f.emit(event_types::ORDER_CREATED, serde_json::json!({ "orderId": "O1" }))
        .await;
    f.wait_for_state(SagaState::InProgress).await;

    f.emit(event_types::STOCK_RESERVED, serde_json::json!({ "items": 1 }))
        .await;
    f.wait_for_state(SagaState::StockReserved).await;

    f.emit(event_types::PAYMENT_PROCESSED, serde_json::json!({ "amount": 9.99 }))
        .await;
    f.wait_for_state(SagaState::PaymentProcessed).await;

    f.emit(event_types::ORDER_CONFIRMED, serde_json::json!({}))
        .await;
    f.wait_for_state(SagaState::OrderConfirming).await;

    f.emit(event_types::NOTIFICATION_SENT, serde_json::json!({}))
        .await;
    f.wait_for_state(SagaState::Completed).await;

    let record = f.store.get(f.saga_id).await.unwrap().unwrap();
    assert_eq!(record.steps.len(), 5);
    assert!(record
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
    assert!(record.completed_at.is_some());

    let completed = f
        .bus
        .published_of_type(topics::SAGAS, event_types::SAGA_COMPLETED)
        .await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].metadata.saga_id, Some(f.saga_id));

    let result = f.observer.result_for(f.saga_id).await.unwrap();
    assert!(result.is_success);
}

#[tokio::test]
async fn duplicate_events_do_not_advance_twice() {
    let f = flow().await;

    f.emit(event_types::ORDER_CREATED, serde_json::json!({})).await;
    f.wait_for_state(SagaState::InProgress).await;

    // Same business event redelivered with a fresh envelope id
    f.emit(event_types::STOCK_RESERVED, serde_json::json!({})).await;
    f.emit(event_types::STOCK_RESERVED, serde_json::json!({})).await;
    f.wait_for_state(SagaState::StockReserved).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = f.store.get(f.saga_id).await.unwrap().unwrap();
    assert_eq!(record.current_state, SagaState::StockReserved);
    // One creation-free transition per distinct advance
    assert_eq!(record.transitions.len(), 1);
}

#[tokio::test]
async fn cancellation_after_reservation_compensates_via_events() {
    let f = flow().await;

    f.emit(event_types::ORDER_CREATED, serde_json::json!({})).await;
    f.emit(event_types::STOCK_RESERVED, serde_json::json!({})).await;
    f.emit(event_types::PAYMENT_PROCESSED, serde_json::json!({})).await;
    f.wait_for_state(SagaState::PaymentProcessed).await;

    f.emit(
        event_types::ORDER_CANCELLED,
        serde_json::json!({ "reason": "customer cancelled" }),
    )
    .await;
    f.wait_for_state(SagaState::Compensating).await;

    let started = f
        .bus
        .published_of_type(topics::SAGAS, event_types::SAGA_COMPENSATION_STARTED)
        .await;
    assert_eq!(started.len(), 1);

    // Participants react with their undo events
    f.emit(event_types::STOCK_RELEASED, serde_json::json!({})).await;
    f.emit(event_types::PAYMENT_REFUNDED, serde_json::json!({})).await;
    f.wait_for_state(SagaState::Compensated).await;

    let record = f.store.get(f.saga_id).await.unwrap().unwrap();
    assert!(record
        .steps
        .iter()
        .filter(|s| s.step_name != "OrderConfirmed" && s.step_name != "NotificationSent")
        .all(|s| s.status == StepStatus::Compensated));
    assert_eq!(record.error_message.as_deref(), Some("customer cancelled"));

    let completed = f
        .bus
        .published_of_type(topics::SAGAS, event_types::SAGA_COMPENSATION_COMPLETED)
        .await;
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn cancellation_before_any_compensable_step_aborts() {
    let f = flow().await;

    f.emit(event_types::ORDER_CREATED, serde_json::json!({})).await;
    f.wait_for_state(SagaState::InProgress).await;

    f.emit(
        event_types::ORDER_CANCELLED,
        serde_json::json!({ "reason": "payment never attempted" }),
    )
    .await;
    f.wait_for_state(SagaState::Aborted).await;

    let record = f.store.get(f.saga_id).await.unwrap().unwrap();
    assert!(record.completed_at.is_some());
    assert!(record.compensation_results.is_empty());

    // Nothing was reserved, so no compensation lifecycle events appear
    let started = f
        .bus
        .published_of_type(topics::SAGAS, event_types::SAGA_COMPENSATION_STARTED)
        .await;
    assert!(started.is_empty());
}

#[tokio::test]
async fn events_without_a_saga_id_are_ignored() {
    let f = flow().await;

    f.bus
        .publish(EventEnvelope::new(
            event_types::ORDER_CREATED,
            "order-without-saga",
            "Order",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(f.store.get_all().await.unwrap().is_empty());
}
