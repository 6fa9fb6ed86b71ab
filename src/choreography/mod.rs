//! Choreographed saga coordination: participants react to each other's
//! events; this observer subscribes to the bus, persists saga state for every
//! event it sees, and emits the compensation lifecycle events participants
//! consume. It never invokes a participant.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::events::{event_types, topics, EventBus, EventEnvelope, EventHandler, SubscriptionConfig};
use crate::metrics;
use crate::saga::{
    SagaError, SagaRecord, SagaResult, SagaState, SagaStepRecord, SagaType, StepStatus,
    TransitionEventType,
};
use crate::store::SagaStore;

const OBSERVER_SERVICE: &str = "saga-service";

/// Observed steps of the choreographed order flow, in order.
/// `(step_name, service_name, completing_event, post_state, compensating_event)`
static CHOREOGRAPHED_STEPS: [(&str, &str, &str, SagaState, Option<&str>); 5] = [
    (
        "OrderCreated",
        "order-service",
        event_types::ORDER_CREATED,
        SagaState::InProgress,
        None,
    ),
    (
        "StockReserved",
        "product-service",
        event_types::STOCK_RESERVED,
        SagaState::StockReserved,
        Some(event_types::STOCK_RELEASED),
    ),
    (
        "PaymentProcessed",
        "payment-service",
        event_types::PAYMENT_PROCESSED,
        SagaState::PaymentProcessed,
        Some(event_types::PAYMENT_REFUNDED),
    ),
    (
        "OrderConfirmed",
        "order-service",
        event_types::ORDER_CONFIRMED,
        SagaState::OrderConfirming,
        None,
    ),
    (
        "NotificationSent",
        "notification-service",
        event_types::NOTIFICATION_SENT,
        SagaState::Completed,
        None,
    ),
];

fn step_records() -> Vec<SagaStepRecord> {
    CHOREOGRAPHED_STEPS
        .iter()
        .enumerate()
        .map(|(i, (name, service, ..))| SagaStepRecord::new(i as u32 + 1, *name, *service))
        .collect()
}

fn step_for_event(event_type: &str) -> Option<&'static (&'static str, &'static str, &'static str, SagaState, Option<&'static str>)> {
    CHOREOGRAPHED_STEPS.iter().find(|(_, _, e, _, _)| *e == event_type)
}

fn step_for_compensation_event(
    event_type: &str,
) -> Option<&'static (&'static str, &'static str, &'static str, SagaState, Option<&'static str>)> {
    CHOREOGRAPHED_STEPS
        .iter()
        .find(|(_, _, _, _, comp)| *comp == Some(event_type))
}

/// Event-driven saga coordinator
pub struct ChoreographyCoordinator {
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn EventBus>,
    /// Processed event ids; consumers must tolerate duplicate deliveries
    seen_events: Mutex<HashSet<Uuid>>,
}

impl ChoreographyCoordinator {
    pub fn new(store: Arc<dyn SagaStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            seen_events: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe this observer on the participant topics.
    pub async fn spawn(self: &Arc<Self>, consumer_group: &str) -> Result<(), SagaError> {
        let config = SubscriptionConfig {
            name: "choreography-observer".to_string(),
            topics: vec![
                topics::ORDERS.to_string(),
                topics::INVENTORY.to_string(),
                topics::PAYMENTS.to_string(),
                topics::BUSINESS.to_string(),
            ],
            consumer_group: consumer_group.to_string(),
            consumer_name: format!("{consumer_group}-observer"),
            ..Default::default()
        };
        self.bus.subscribe(config, self.clone()).await
    }

    async fn already_seen(&self, event_id: Uuid) -> bool {
        let mut seen = self.seen_events.lock().await;
        if seen.len() > 100_000 {
            seen.clear();
        }
        seen.contains(&event_id)
    }

    async fn mark_seen(&self, event_id: Uuid) {
        self.seen_events.lock().await.insert(event_id);
    }

    async fn on_order_created(&self, saga_id: Uuid, envelope: &EventEnvelope) -> Result<(), SagaError> {
        let mut record = SagaRecord::new(
            SagaType::ChoreographedOrder,
            envelope.metadata.correlation_id,
            step_records(),
        );
        record.saga_id = saga_id;
        if let Some(step) = record.step_mut("OrderCreated") {
            step.start();
            step.complete(Some(envelope.data.clone()));
        }

        match self.store.create(record).await {
            Ok(_) => {
                metrics::saga_started(SagaType::ChoreographedOrder);
                metrics::log_saga_event(
                    event_types::ORDER_CREATED,
                    saga_id,
                    SagaType::ChoreographedOrder,
                    OBSERVER_SERVICE,
                    envelope.metadata.correlation_id,
                    "choreographed saga opened",
                    &envelope.data,
                );
                Ok(())
            }
            // Duplicate delivery of the opening event
            Err(SagaError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_step_event(&self, saga_id: Uuid, envelope: &EventEnvelope) -> Result<(), SagaError> {
        let Some((step_name, service, _, post_state, _)) = step_for_event(&envelope.event_type)
        else {
            return Ok(());
        };
        let step_name = *step_name;
        let service = *service;
        let post_state = *post_state;
        let data = envelope.data.clone();

        let updated = self
            .store
            .update(
                saga_id,
                Box::new(move |current: &SagaRecord| {
                    if current
                        .step(step_name)
                        .map(|s| s.status == StepStatus::Completed)
                        .unwrap_or(false)
                    {
                        // Duplicate; nothing to advance
                        return Err(SagaError::IllegalState {
                            saga_id: current.saga_id,
                            state: current.current_state,
                            operation: "duplicate-step-event".to_string(),
                        });
                    }

                    let transition = current.transition_to(
                        post_state,
                        service,
                        step_name,
                        TransitionEventType::Success,
                    );
                    let mut next = current.clone();
                    if let Some(step) = next.step_mut(step_name) {
                        step.start();
                        step.complete(Some(data.clone()));
                    }
                    next.current_state = post_state;
                    if post_state == SagaState::Completed {
                        next.completed_at = Some(transition.timestamp);
                    }
                    Ok((next, vec![transition]))
                }),
            )
            .await;

        let updated = match updated {
            Ok(updated) => updated,
            Err(SagaError::IllegalState { .. }) => return Ok(()),
            Err(SagaError::IllegalTransition { from, to, .. }) => {
                // Out-of-order delivery; drop rather than poison the group
                warn!(
                    saga_id = %saga_id,
                    event = %envelope.event_type,
                    %from,
                    %to,
                    "out-of-order choreography event ignored"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(transition) = updated.transitions.last() {
            metrics::state_transition(
                SagaType::ChoreographedOrder,
                transition.from_state,
                transition.to_state,
                service,
            );
        }
        if updated.current_state == SagaState::Completed {
            let duration = (updated.completed_at.unwrap_or(updated.updated_at) - updated.created_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            metrics::saga_completed(SagaType::ChoreographedOrder, duration);
            metrics::log_saga_event(
                event_types::SAGA_COMPLETED,
                saga_id,
                SagaType::ChoreographedOrder,
                OBSERVER_SERVICE,
                envelope.metadata.correlation_id,
                "choreographed saga completed",
                &json!({ "steps": updated.steps.len() }),
            );
            self.bus
                .publish(EventEnvelope::for_saga(
                    event_types::SAGA_COMPLETED,
                    saga_id,
                    envelope.metadata.correlation_id,
                    json!({ "sagaType": SagaType::ChoreographedOrder.as_str() }),
                ))
                .await
                .ok();
        }
        Ok(())
    }

    async fn on_cancelled(&self, saga_id: Uuid, envelope: &EventEnvelope) -> Result<(), SagaError> {
        let reason = envelope
            .data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("order cancelled")
            .to_string();

        let updated = self
            .store
            .update(
                saga_id,
                Box::new(move |current: &SagaRecord| {
                    if current.current_state == SagaState::Compensating {
                        // Duplicate cancellation
                        return Err(SagaError::IllegalState {
                            saga_id: current.saga_id,
                            state: current.current_state,
                            operation: "duplicate-cancellation".to_string(),
                        });
                    }
                    // Steps whose undo arrives as a participant event stay
                    // Completed until that event; the rest are subsumed by
                    // the cancellation itself.
                    let awaiting: Vec<&str> = CHOREOGRAPHED_STEPS
                        .iter()
                        .filter(|(name, _, _, _, comp)| {
                            comp.is_some()
                                && current
                                    .step(name)
                                    .map(|s| s.status == StepStatus::Completed)
                                    .unwrap_or(false)
                        })
                        .map(|(name, ..)| *name)
                        .collect();

                    let target = if awaiting.is_empty() {
                        SagaState::Aborted
                    } else {
                        SagaState::Compensating
                    };
                    let transition = current
                        .transition_to(
                            target,
                            OBSERVER_SERVICE,
                            "OrderCancelled",
                            TransitionEventType::Failure,
                        )
                        .with_message(reason.clone());

                    let mut next = current.clone();
                    next.error_message = Some(reason.clone());
                    next.current_state = target;
                    for step in next.steps.iter_mut() {
                        let subsumed = step.status == StepStatus::Completed
                            && !awaiting.contains(&step.step_name.as_str());
                        if subsumed {
                            step.mark_compensated();
                        }
                    }
                    if target == SagaState::Aborted {
                        next.completed_at = Some(transition.timestamp);
                    }
                    Ok((next, vec![transition]))
                }),
            )
            .await;

        let updated = match updated {
            Ok(updated) => updated,
            Err(SagaError::NotFound { .. }) => {
                warn!(saga_id = %saga_id, "cancellation for unknown saga ignored");
                return Ok(());
            }
            Err(SagaError::IllegalState { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        metrics::saga_failed(
            SagaType::ChoreographedOrder,
            "OrderCancelled",
            updated.current_state,
            0.0,
        );

        if updated.current_state == SagaState::Compensating {
            self.bus
                .publish(EventEnvelope::for_saga(
                    event_types::SAGA_COMPENSATION_STARTED,
                    saga_id,
                    envelope.metadata.correlation_id,
                    json!({ "sagaType": SagaType::ChoreographedOrder.as_str() }),
                ))
                .await
                .ok();
        }
        Ok(())
    }

    async fn on_compensation_event(
        &self,
        saga_id: Uuid,
        envelope: &EventEnvelope,
    ) -> Result<(), SagaError> {
        let Some((step_name, service, ..)) = step_for_compensation_event(&envelope.event_type)
        else {
            return Ok(());
        };
        let step_name = *step_name;
        let service = *service;

        let updated = self
            .store
            .update(
                saga_id,
                Box::new(move |current: &SagaRecord| {
                    // Only a Completed step has anything to undo; anything
                    // else is a duplicate or stray event.
                    if current
                        .step(step_name)
                        .map(|s| s.status != StepStatus::Completed)
                        .unwrap_or(true)
                    {
                        return Err(SagaError::IllegalState {
                            saga_id: current.saga_id,
                            state: current.current_state,
                            operation: "duplicate-compensation-event".to_string(),
                        });
                    }

                    let mut next = current.clone();
                    if let Some(step) = next.step_mut(step_name) {
                        step.mark_compensated();
                    }
                    next.compensation_results.push(crate::saga::CompensationOutcome {
                        step_name: step_name.to_string(),
                        service_name: service.to_string(),
                        is_successful: true,
                        error_message: None,
                        duration_ms: 0,
                        executed_at: chrono::Utc::now(),
                    });

                    let all_compensated = next
                        .steps
                        .iter()
                        .all(|s| s.status != StepStatus::Completed);
                    let target = if all_compensated {
                        SagaState::Compensated
                    } else {
                        SagaState::Compensating
                    };
                    let transition = current.transition_to(
                        target,
                        service,
                        format!("Compensate:{step_name}"),
                        TransitionEventType::Compensation,
                    );
                    next.current_state = target;
                    if target == SagaState::Compensated {
                        next.completed_at = Some(transition.timestamp);
                    }
                    Ok((next, vec![transition]))
                }),
            )
            .await;

        let updated = match updated {
            Ok(updated) => updated,
            Err(SagaError::NotFound { .. }) | Err(SagaError::IllegalState { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if updated.current_state == SagaState::Compensated {
            metrics::log_saga_event(
                event_types::SAGA_COMPENSATION_COMPLETED,
                saga_id,
                SagaType::ChoreographedOrder,
                OBSERVER_SERVICE,
                envelope.metadata.correlation_id,
                "choreographed compensation completed",
                &json!({}),
            );
            self.bus
                .publish(EventEnvelope::for_saga(
                    event_types::SAGA_COMPENSATION_COMPLETED,
                    saga_id,
                    envelope.metadata.correlation_id,
                    json!({ "sagaType": SagaType::ChoreographedOrder.as_str() }),
                ))
                .await
                .ok();
        }
        Ok(())
    }

    /// Current view of a choreographed saga as a caller-facing result
    pub async fn result_for(&self, saga_id: Uuid) -> Result<SagaResult, SagaError> {
        let record = self
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound { saga_id })?;
        Ok(SagaResult::from_record(&record))
    }
}

#[async_trait]
impl EventHandler for ChoreographyCoordinator {
    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let Some(saga_id) = envelope.metadata.saga_id else {
            return Ok(());
        };
        if self.already_seen(envelope.event_id).await {
            return Ok(());
        }

        let result = match envelope.event_type.as_str() {
            event_types::ORDER_CREATED => self.on_order_created(saga_id, envelope).await,
            event_types::STOCK_RESERVED
            | event_types::PAYMENT_PROCESSED
            | event_types::ORDER_CONFIRMED
            | event_types::NOTIFICATION_SENT => self.on_step_event(saga_id, envelope).await,
            event_types::ORDER_CANCELLED => self.on_cancelled(saga_id, envelope).await,
            event_types::STOCK_RELEASED | event_types::PAYMENT_REFUNDED => {
                self.on_compensation_event(saga_id, envelope).await
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => {
                self.mark_seen(envelope.event_id).await;
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                // Non-retryable: record and move on, redelivery cannot help
                warn!(
                    saga_id = %saga_id,
                    event = %envelope.event_type,
                    "choreography event dropped: {e}"
                );
                self.mark_seen(envelope.event_id).await;
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "choreography-observer"
    }
}
