//! Orchestrated saga engine: drives templates step by step, persists every
//! transition before and after participant calls, and runs LIFO compensation
//! on failure.

use serde_json::json;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_retry::RetryIf;
use tracing::{error, warn};
use uuid::Uuid;

use crate::events::{event_types, EventBus, EventEnvelope};
use crate::metrics;
use crate::models::{validate_request, CreateOrderRequest, CreateSaleRequest, StockUpdateRequest};
use crate::participants::ParticipantSet;
use crate::saga::{
    CompensationOutcome, CompensationRecord, FailureKind, SagaError, SagaRecord, SagaResult,
    SagaState, SagaType, TransitionEventType,
};
use crate::store::{SagaMutation, SagaStore};
use crate::workflows::{SagaRequest, SagaTemplate, StepContext, TemplateRegistry};

const ENGINE_SERVICE: &str = "saga-service";

/// Configuration for the saga coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of concurrently executing sagas
    pub max_concurrent_sagas: usize,

    /// Deadline for each participant call (forward and compensation)
    pub step_timeout: Duration,

    /// Backoff schedule for transient store failures
    pub store_retry_delays: Vec<Duration>,

    /// Shard count for the per-saga keyed mutex
    pub lock_shards: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sagas: 100,
            step_timeout: Duration::from_secs(30),
            store_retry_delays: vec![
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_millis(800),
            ],
            lock_shards: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn test_config() -> Self {
        Self {
            max_concurrent_sagas: 50,
            step_timeout: Duration::from_secs(5),
            store_retry_delays: vec![Duration::from_millis(5), Duration::from_millis(10)],
            lock_shards: 8,
        }
    }
}

/// Sharded keyed mutex: at most one forward or compensation step in flight
/// per saga, with no single global bottleneck.
struct SagaLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl SagaLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    async fn lock(&self, saga_id: Uuid) -> OwnedMutexGuard<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        saga_id.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % self.shards.len();
        self.shards[shard].clone().lock_owned().await
    }
}

/// The orchestrated saga engine
pub struct SagaCoordinator {
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn EventBus>,
    participants: ParticipantSet,
    registry: Arc<TemplateRegistry>,
    config: CoordinatorConfig,
    locks: SagaLocks,
    /// Cancellation flags for in-flight sagas
    active: Arc<RwLock<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        bus: Arc<dyn EventBus>,
        participants: ParticipantSet,
        registry: Arc<TemplateRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let locks = SagaLocks::new(config.lock_shards);
        Self {
            store,
            bus,
            participants,
            registry,
            config,
            locks,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> Arc<dyn SagaStore> {
        self.store.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn execute_sale_saga(
        &self,
        request: CreateSaleRequest,
    ) -> Result<SagaResult, SagaError> {
        validate_request(&request)?;
        self.run(SagaType::Sale, SagaRequest::Sale(request)).await
    }

    pub async fn execute_order_saga(
        &self,
        request: CreateOrderRequest,
    ) -> Result<SagaResult, SagaError> {
        validate_request(&request)?;
        self.run(SagaType::Order, SagaRequest::Order(request)).await
    }

    pub async fn execute_stock_update_saga(
        &self,
        request: StockUpdateRequest,
    ) -> Result<SagaResult, SagaError> {
        validate_request(&request)?;
        self.run(SagaType::StockUpdate, SagaRequest::Stock(request))
            .await
    }

    /// Flag an in-flight saga for cancellation. A cancelled compensation run
    /// stops between steps and leaves the saga in `Compensating` for operator
    /// re-drive.
    pub async fn cancel_saga(&self, saga_id: Uuid) -> Result<(), SagaError> {
        let active = self.active.read().await;
        match active.get(&saga_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(SagaError::NotFound { saga_id }),
        }
    }

    /// Refresh the sagas-in-state gauges from the store.
    pub async fn refresh_state_gauges(&self) {
        if let Ok(counts) = self.store.count_by_state().await {
            for entry in counts {
                metrics::sagas_in_state(entry.saga_type, entry.state, entry.count as f64);
            }
        }
    }

    async fn run(&self, saga_type: SagaType, request: SagaRequest) -> Result<SagaResult, SagaError> {
        let template = self.registry.get(saga_type).ok_or_else(|| SagaError::Validation {
            field: "sagaType".to_string(),
            message: format!("no template registered for {saga_type}"),
        })?;

        {
            let active = self.active.read().await;
            if active.len() >= self.config.max_concurrent_sagas {
                return Err(SagaError::CapacityExceeded {
                    limit: self.config.max_concurrent_sagas,
                });
            }
        }

        let correlation_id = Uuid::new_v4();
        let record = SagaRecord::new(saga_type, correlation_id, template.step_records());
        let record = self.create_with_retry(record).await?;
        let saga_id = record.saga_id;
        let started = Instant::now();
        let total_steps = template.steps.len() as u32;

        metrics::saga_started(saga_type);
        metrics::log_saga_event(
            event_types::SAGA_STARTED,
            saga_id,
            saga_type,
            ENGINE_SERVICE,
            correlation_id,
            "saga started",
            &json!({ "totalSteps": total_steps }),
        );
        self.publish(EventEnvelope::for_saga(
            event_types::SAGA_STARTED,
            saga_id,
            correlation_id,
            json!({ "sagaType": saga_type.as_str(), "totalSteps": total_steps }),
        ))
        .await;

        let cancel = Arc::new(AtomicBool::new(false));
        self.active.write().await.insert(saga_id, cancel.clone());
        let guard = self.locks.lock(saga_id).await;

        let mut ctx = StepContext::new(
            saga_id,
            correlation_id,
            self.participants.clone(),
            Some(request),
        );
        let outcome = self
            .drive_forward(template, &mut ctx, saga_id, total_steps, &cancel, started)
            .await;
        drop(guard);
        self.active.write().await.remove(&saga_id);

        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                // Engine-level failure (store fatal, illegal transition).
                // Surface to observability with full context and mark the
                // saga Failed on a best-effort basis.
                error!(
                    saga_id = %saga_id,
                    saga_type = saga_type.as_str(),
                    category = err.category(),
                    "saga aborted by engine failure: {err}"
                );
                metrics::saga_failed(
                    saga_type,
                    err.category(),
                    SagaState::Failed,
                    started.elapsed().as_secs_f64(),
                );
                self.mark_failed_best_effort(saga_id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive_forward(
        &self,
        template: &SagaTemplate,
        ctx: &mut StepContext,
        saga_id: Uuid,
        total_steps: u32,
        cancel: &AtomicBool,
        started: Instant,
    ) -> Result<SagaResult, SagaError> {
        let saga_type = template.saga_type;
        let correlation_id = ctx.correlation_id;

        for step in &template.steps {
            let step_name = step.name;
            let service = step.service_name;

            // Persist the step going in-flight before invoking the participant
            self.update_with_retry(saga_id, move || {
                Box::new(move |current: &SagaRecord| {
                    let mut next = current.clone();
                    if let Some(record) = next.step_mut(step_name) {
                        record.start();
                    }
                    Ok((next, vec![]))
                })
            })
            .await?;
            metrics::step_started(saga_type, step_name, service);

            let step_started = Instant::now();
            let result = match tokio::time::timeout(self.config.step_timeout, (step.forward)(ctx))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SagaError::StepFailure {
                    kind: FailureKind::NetworkTimeout,
                    service: service.to_string(),
                    message: format!("step {step_name} exceeded its deadline"),
                }),
            };
            let step_secs = step_started.elapsed().as_secs_f64();

            match result {
                Ok(data) => {
                    let post_state = step.expected_post_state;
                    let has_compensation = step.compensate.is_some();
                    let payload = data.clone();
                    let updated = self
                        .update_with_retry(saga_id, move || {
                            let payload = payload.clone();
                            Box::new(move |current: &SagaRecord| {
                                let transition = current.transition_to(
                                    post_state,
                                    service,
                                    step_name,
                                    TransitionEventType::Success,
                                );
                                let mut next = current.clone();
                                if let Some(record) = next.step_mut(step_name) {
                                    record.complete(Some(payload.clone()));
                                    if has_compensation {
                                        record.compensation_data = Some(payload.clone());
                                    }
                                }
                                if has_compensation {
                                    next.compensation_stack.push(CompensationRecord {
                                        step_name: step_name.to_string(),
                                        service_name: service.to_string(),
                                        data: payload.clone(),
                                    });
                                }
                                next.current_state = post_state;
                                Ok((next, vec![transition]))
                            })
                        })
                        .await?;

                    metrics::step_succeeded(saga_type, step_name, service, step_secs);
                    metrics::state_transition(
                        saga_type,
                        updated
                            .transitions
                            .last()
                            .map(|t| t.from_state)
                            .unwrap_or(SagaState::Started),
                        post_state,
                        service,
                    );
                    metrics::log_saga_event(
                        event_types::STEP_COMPLETED,
                        saga_id,
                        saga_type,
                        service,
                        correlation_id,
                        "step completed",
                        &json!({ "stepName": step_name }),
                    );
                    self.publish(
                        EventEnvelope::for_saga(
                            event_types::STEP_COMPLETED,
                            saga_id,
                            correlation_id,
                            json!({ "stepName": step_name, "serviceName": service }),
                        )
                        .with_step(step_name, total_steps)
                        .with_version(updated.transitions.len() as u64),
                    )
                    .await;

                    ctx.outputs.insert(step_name.to_string(), data);
                }
                Err(step_error) => {
                    let message = step_error.to_string();
                    let error_type = step_error.category();
                    let failure_message = message.clone();
                    let updated = self
                        .update_with_retry(saga_id, move || {
                            let failure_message = failure_message.clone();
                            Box::new(move |current: &SagaRecord| {
                                let transition = current
                                    .transition_to(
                                        SagaState::Compensating,
                                        service,
                                        step_name,
                                        TransitionEventType::Failure,
                                    )
                                    .with_message(failure_message.clone());
                                let mut next = current.clone();
                                if let Some(record) = next.step_mut(step_name) {
                                    record.fail(failure_message.clone());
                                }
                                next.error_message = Some(failure_message.clone());
                                next.current_state = SagaState::Compensating;
                                Ok((next, vec![transition]))
                            })
                        })
                        .await?;

                    metrics::step_failed(saga_type, step_name, service, error_type, step_secs);
                    metrics::state_transition(
                        saga_type,
                        updated
                            .transitions
                            .last()
                            .map(|t| t.from_state)
                            .unwrap_or(SagaState::Started),
                        SagaState::Compensating,
                        service,
                    );
                    metrics::log_saga_event(
                        event_types::STEP_FAILED,
                        saga_id,
                        saga_type,
                        service,
                        correlation_id,
                        "step failed, compensating",
                        &json!({ "stepName": step_name, "error": message }),
                    );
                    self.publish(
                        EventEnvelope::for_saga(
                            event_types::STEP_FAILED,
                            saga_id,
                            correlation_id,
                            json!({ "stepName": step_name, "serviceName": service, "error": message }),
                        )
                        .with_step(step_name, total_steps),
                    )
                    .await;

                    let (record, cancelled) =
                        self.run_compensations(template, ctx, saga_id, cancel).await?;
                    let final_record = if cancelled {
                        record
                    } else {
                        self.finalize_compensation(saga_id).await?
                    };

                    metrics::saga_failed(
                        saga_type,
                        error_type,
                        final_record.current_state,
                        started.elapsed().as_secs_f64(),
                    );
                    let terminal_event = match final_record.current_state {
                        SagaState::Compensated => event_types::SAGA_COMPENSATED,
                        _ => event_types::SAGA_FAILED,
                    };
                    self.publish(EventEnvelope::for_saga(
                        terminal_event,
                        saga_id,
                        correlation_id,
                        json!({
                            "sagaType": saga_type.as_str(),
                            "failedStep": step_name,
                            "error": message,
                            "hasCompensationFailures": final_record.has_compensation_failures,
                        }),
                    ))
                    .await;

                    return Ok(SagaResult::from_record(&final_record));
                }
            }
        }

        // Every step succeeded; close the saga out
        let updated = self
            .update_with_retry(saga_id, move || {
                Box::new(move |current: &SagaRecord| {
                    let transition = current.transition_to(
                        SagaState::Completed,
                        ENGINE_SERVICE,
                        "Complete",
                        TransitionEventType::Success,
                    );
                    let mut next = current.clone();
                    next.current_state = SagaState::Completed;
                    next.completed_at = Some(transition.timestamp);
                    Ok((next, vec![transition]))
                })
            })
            .await?;

        let duration = started.elapsed().as_secs_f64();
        metrics::saga_completed(saga_type, duration);
        metrics::state_transition(
            saga_type,
            updated
                .transitions
                .last()
                .map(|t| t.from_state)
                .unwrap_or(SagaState::Started),
            SagaState::Completed,
            ENGINE_SERVICE,
        );
        metrics::log_saga_event(
            event_types::SAGA_COMPLETED,
            saga_id,
            saga_type,
            ENGINE_SERVICE,
            correlation_id,
            "saga completed",
            &json!({ "durationSeconds": duration }),
        );
        self.publish(
            EventEnvelope::for_saga(
                event_types::SAGA_COMPLETED,
                saga_id,
                correlation_id,
                json!({ "sagaType": saga_type.as_str() }),
            )
            .with_version(updated.transitions.len() as u64),
        )
        .await;

        Ok(SagaResult::from_record(&updated))
    }

    /// Drive compensation for a saga: operator entry point.
    ///
    /// Valid on `Completed` sagas (deliberate recovery: same LIFO order and
    /// idempotency as failure-triggered compensation), re-drivable on
    /// `Failed` sagas, and a no-op returning the stored result on
    /// `Compensated` ones.
    pub async fn compensate_saga(&self, saga_id: Uuid) -> Result<SagaResult, SagaError> {
        let guard = self.locks.lock(saga_id).await;

        let record = self
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound { saga_id })?;

        match record.current_state {
            SagaState::Compensated => {
                // Already compensated: return the stored result untouched
                return Ok(SagaResult::from_record(&record));
            }
            SagaState::Aborted => {
                return Err(SagaError::IllegalState {
                    saga_id,
                    state: record.current_state,
                    operation: "compensate".to_string(),
                });
            }
            _ => {}
        }

        let template = self
            .registry
            .get(record.saga_type)
            .ok_or_else(|| SagaError::Validation {
                field: "sagaType".to_string(),
                message: format!("no template registered for {}", record.saga_type),
            })?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.active.write().await.insert(saga_id, cancel.clone());

        if record.current_state != SagaState::Compensating {
            self.update_with_retry(saga_id, move || {
                Box::new(move |current: &SagaRecord| {
                    let transition = current
                        .transition_to(
                            SagaState::Compensating,
                            ENGINE_SERVICE,
                            "CompensateSaga",
                            TransitionEventType::Compensation,
                        )
                        .with_message("operator-driven compensation");
                    let mut next = current.clone();
                    next.current_state = SagaState::Compensating;
                    Ok((next, vec![transition]))
                })
            })
            .await?;
            self.publish(EventEnvelope::for_saga(
                event_types::SAGA_COMPENSATION_STARTED,
                saga_id,
                record.correlation_id,
                json!({ "sagaType": record.saga_type.as_str() }),
            ))
            .await;
        }

        let ctx = StepContext::new(
            saga_id,
            record.correlation_id,
            self.participants.clone(),
            None,
        );
        let outcome = self.run_compensations(template, &ctx, saga_id, &cancel).await;

        drop(guard);
        self.active.write().await.remove(&saga_id);

        let (latest, cancelled) = outcome?;
        if cancelled {
            // Parked in Compensating for operator re-drive
            return Ok(SagaResult::from_record(&latest));
        }

        let final_record = self.finalize_compensation(saga_id).await?;
        self.publish(EventEnvelope::for_saga(
            event_types::SAGA_COMPENSATION_COMPLETED,
            saga_id,
            record.correlation_id,
            json!({
                "sagaType": record.saga_type.as_str(),
                "hasCompensationFailures": final_record.has_compensation_failures,
            }),
        ))
        .await;

        Ok(SagaResult::from_record(&final_record))
    }

    /// Pop pending compensations in LIFO order with a best-effort policy: a
    /// failing compensation is recorded and the remaining ones still run.
    async fn run_compensations(
        &self,
        template: &SagaTemplate,
        ctx: &StepContext,
        saga_id: Uuid,
        cancel: &AtomicBool,
    ) -> Result<(SagaRecord, bool), SagaError> {
        let mut latest = self
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound { saga_id })?;
        let saga_type = latest.saga_type;

        let pending: Vec<CompensationRecord> = latest
            .compensation_stack
            .iter()
            .rev()
            .filter(|c| !latest.compensation_succeeded(&c.step_name))
            .cloned()
            .collect();

        for entry in pending {
            if cancel.load(Ordering::SeqCst) {
                warn!(saga_id = %saga_id, "compensation cancelled, saga left in Compensating");
                return Ok((latest, true));
            }

            let compensate = template.step(&entry.step_name).and_then(|s| s.compensate);
            let comp_started = Instant::now();
            let result = match compensate {
                Some(compensate) => {
                    match tokio::time::timeout(
                        self.config.step_timeout,
                        compensate(ctx, &entry.data),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(SagaError::StepFailure {
                            kind: FailureKind::NetworkTimeout,
                            service: entry.service_name.clone(),
                            message: format!(
                                "compensation for {} exceeded its deadline",
                                entry.step_name
                            ),
                        }),
                    }
                }
                None => Err(SagaError::Serialization {
                    reason: format!("no compensation defined for step {}", entry.step_name),
                }),
            };

            let outcome = CompensationOutcome {
                step_name: entry.step_name.clone(),
                service_name: entry.service_name.clone(),
                is_successful: result.is_ok(),
                error_message: result.as_ref().err().map(|e| e.to_string()),
                duration_ms: comp_started.elapsed().as_millis() as u64,
                executed_at: chrono::Utc::now(),
            };

            metrics::compensation_executed(
                saga_type,
                &outcome.step_name,
                &outcome.service_name,
                outcome.is_successful,
            );
            metrics::log_saga_event(
                event_types::COMPENSATION_EXECUTED,
                saga_id,
                saga_type,
                &outcome.service_name,
                ctx.correlation_id,
                if outcome.is_successful {
                    "compensation executed"
                } else {
                    "compensation failed"
                },
                &json!({
                    "stepName": outcome.step_name,
                    "isSuccessful": outcome.is_successful,
                    "error": outcome.error_message,
                }),
            );
            self.publish(EventEnvelope::for_saga(
                event_types::COMPENSATION_EXECUTED,
                saga_id,
                ctx.correlation_id,
                json!({
                    "stepName": outcome.step_name,
                    "isSuccessful": outcome.is_successful,
                    "durationMs": outcome.duration_ms,
                }),
            ))
            .await;

            let persisted_outcome = outcome.clone();
            latest = self
                .update_with_retry(saga_id, move || {
                    let outcome = persisted_outcome.clone();
                    Box::new(move |current: &SagaRecord| {
                        let action = format!("Compensate:{}", outcome.step_name);
                        let mut transition = current.transition_to(
                            SagaState::Compensating,
                            outcome.service_name.clone(),
                            action,
                            TransitionEventType::Compensation,
                        );
                        if let Some(error) = &outcome.error_message {
                            transition = transition.with_message(error.clone());
                        }
                        let mut next = current.clone();
                        if let Some(step) = next.step_mut(&outcome.step_name) {
                            // Attempted once, even on failure; a re-run takes
                            // an explicit CompensateSaga call.
                            step.mark_compensated();
                        }
                        if !outcome.is_successful {
                            next.has_compensation_failures = true;
                        }
                        next.compensation_results.push(outcome.clone());
                        Ok((next, vec![transition]))
                    })
                })
                .await?;
        }

        Ok((latest, false))
    }

    async fn finalize_compensation(&self, saga_id: Uuid) -> Result<SagaRecord, SagaError> {
        let updated = self
            .update_with_retry(saga_id, move || {
                Box::new(move |current: &SagaRecord| {
                    // Recomputed from the outcome set so an operator re-drive
                    // that fixes earlier failures can still land Compensated.
                    let all_compensated = current
                        .compensation_stack
                        .iter()
                        .all(|c| current.compensation_succeeded(&c.step_name));
                    let target = if all_compensated {
                        SagaState::Compensated
                    } else {
                        SagaState::Failed
                    };
                    let transition = current.transition_to(
                        target,
                        ENGINE_SERVICE,
                        "FinalizeCompensation",
                        TransitionEventType::Compensation,
                    );
                    let mut next = current.clone();
                    next.current_state = target;
                    next.has_compensation_failures = !all_compensated;
                    if target == SagaState::Compensated {
                        next.completed_at = Some(transition.timestamp);
                    }
                    Ok((next, vec![transition]))
                })
            })
            .await?;

        metrics::state_transition(
            updated.saga_type,
            SagaState::Compensating,
            updated.current_state,
            ENGINE_SERVICE,
        );
        Ok(updated)
    }

    async fn mark_failed_best_effort(&self, saga_id: Uuid, cause: &SagaError) {
        let message = cause.to_string();
        let result = self
            .store
            .update(
                saga_id,
                Box::new(move |current: &SagaRecord| {
                    if current.current_state == SagaState::Failed || current.is_terminal() {
                        return Ok((current.clone(), vec![]));
                    }
                    let transition = current
                        .transition_to(
                            SagaState::Failed,
                            ENGINE_SERVICE,
                            "EngineFault",
                            TransitionEventType::Failure,
                        )
                        .with_message(message.clone());
                    let mut next = current.clone();
                    next.error_message = Some(message.clone());
                    next.current_state = SagaState::Failed;
                    Ok((next, vec![transition]))
                }),
            )
            .await;
        if let Err(e) = result {
            error!(saga_id = %saga_id, "failed to mark saga Failed: {e}");
        }
    }

    async fn create_with_retry(&self, record: SagaRecord) -> Result<SagaRecord, SagaError> {
        let delays = self.config.store_retry_delays.clone();
        let result = RetryIf::spawn(
            delays.into_iter(),
            || self.store.create(record.clone()),
            |e: &SagaError| e.is_retryable(),
        )
        .await;
        Self::escalate_exhausted(result)
    }

    async fn update_with_retry<F>(
        &self,
        saga_id: Uuid,
        make_mutation: F,
    ) -> Result<SagaRecord, SagaError>
    where
        F: Fn() -> SagaMutation,
    {
        let delays = self.config.store_retry_delays.clone();
        let result = RetryIf::spawn(
            delays.into_iter(),
            || self.store.update(saga_id, make_mutation()),
            |e: &SagaError| e.is_retryable(),
        )
        .await;
        Self::escalate_exhausted(result)
    }

    /// A transient error that survives the whole backoff schedule becomes
    /// fatal.
    fn escalate_exhausted(result: Result<SagaRecord, SagaError>) -> Result<SagaRecord, SagaError> {
        match result {
            Err(SagaError::StoreTransient { reason }) => Err(SagaError::StoreFatal {
                reason: format!("retries exhausted: {reason}"),
            }),
            other => other,
        }
    }

    /// Publish with one retry; event loss is logged, never fails the saga.
    async fn publish(&self, envelope: EventEnvelope) {
        if let Err(first) = self.bus.publish(envelope.clone()).await {
            warn!(event_type = %envelope.event_type, "publish failed, retrying once: {first}");
            if let Err(second) = self.bus.publish(envelope.clone()).await {
                error!(
                    event_type = %envelope.event_type,
                    event_id = %envelope.event_id,
                    "dropping event after retry: {second}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventBus;
    use crate::failure::FailureInjector;
    use crate::participants::{
        InMemoryOrders, InMemoryPayments, InMemoryProducts, InMemorySales, InMemoryStores,
    };
    use crate::store::InMemorySagaStore;

    async fn coordinator() -> (SagaCoordinator, Arc<InMemoryProducts>) {
        let injector = Arc::new(FailureInjector::disabled());
        let products = Arc::new(InMemoryProducts::new(injector.clone()));
        let stores = Arc::new(InMemoryStores::new(injector.clone()));
        stores.add_store("S1", "Downtown").await;
        products.set_stock("S1", "Milk", 10).await;

        let participants = ParticipantSet {
            product: products.clone(),
            store: stores,
            sale: Arc::new(InMemorySales::new(injector.clone())),
            order: Arc::new(InMemoryOrders::new(injector.clone())),
            payment: Arc::new(InMemoryPayments::new(injector)),
        };
        let coordinator = SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InMemoryEventBus::new()),
            participants,
            Arc::new(TemplateRegistry::builtin()),
            CoordinatorConfig::test_config(),
        );
        (coordinator, products)
    }

    fn sale_request(quantity: u32) -> CreateSaleRequest {
        CreateSaleRequest {
            store_id: "S1".to_string(),
            items: vec![crate::models::SaleItemRequest {
                product_name: "Milk".to_string(),
                quantity,
                unit_price: 3.99,
            }],
        }
    }

    #[tokio::test]
    async fn test_validation_failure_creates_no_saga() {
        let (coordinator, _) = coordinator().await;
        let err = coordinator
            .execute_sale_saga(CreateSaleRequest {
                store_id: String::new(),
                items: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Validation { .. }));
        assert!(coordinator.store().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_reaches_completed() {
        let (coordinator, products) = coordinator().await;
        let result = coordinator.execute_sale_saga(sale_request(2)).await.unwrap();

        assert!(result.is_success);
        assert_eq!(result.final_state, SagaState::Completed);
        assert!(result.compensation_results.is_empty());
        assert_eq!(products.stock_level("S1", "Milk").await, 8);
        assert_eq!(coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_insufficient_stock_compensates_cleanly() {
        let (coordinator, products) = coordinator().await;
        products.set_stock("S1", "Milk", 1).await;

        let result = coordinator.execute_sale_saga(sale_request(2)).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.final_state, SagaState::Compensated);
        // Nothing was reserved, so nothing compensates
        assert!(result.compensation_results.is_empty());
        assert_eq!(products.stock_level("S1", "Milk").await, 1);
    }

    #[tokio::test]
    async fn test_compensate_completed_saga_restores_stock() {
        let (coordinator, products) = coordinator().await;
        let result = coordinator.execute_sale_saga(sale_request(2)).await.unwrap();
        assert_eq!(products.stock_level("S1", "Milk").await, 8);

        let compensated = coordinator.compensate_saga(result.saga_id).await.unwrap();
        assert_eq!(compensated.final_state, SagaState::Compensated);
        assert_eq!(products.stock_level("S1", "Milk").await, 10);

        // Calling again is a no-op returning the stored result
        let again = coordinator.compensate_saga(result.saga_id).await.unwrap();
        assert_eq!(again.final_state, SagaState::Compensated);
        assert_eq!(
            again.compensation_results.len(),
            compensated.compensation_results.len()
        );
        assert_eq!(products.stock_level("S1", "Milk").await, 10);
    }

    #[tokio::test]
    async fn test_compensate_unknown_saga_is_not_found() {
        let (coordinator, _) = coordinator().await;
        let err = coordinator.compensate_saga(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SagaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_zero_step_template_completes_immediately() {
        let injector = Arc::new(FailureInjector::disabled());
        let participants = ParticipantSet {
            product: Arc::new(InMemoryProducts::new(injector.clone())),
            store: Arc::new(InMemoryStores::new(injector.clone())),
            sale: Arc::new(InMemorySales::new(injector.clone())),
            order: Arc::new(InMemoryOrders::new(injector.clone())),
            payment: Arc::new(InMemoryPayments::new(injector)),
        };
        let mut registry = TemplateRegistry::new();
        registry.register(SagaTemplate::new(SagaType::Sale, vec![]));

        let coordinator = SagaCoordinator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(InMemoryEventBus::new()),
            participants,
            Arc::new(registry),
            CoordinatorConfig::test_config(),
        );

        let result = coordinator
            .execute_sale_saga(sale_request(1))
            .await
            .unwrap();
        assert!(result.is_success);
        assert_eq!(result.final_state, SagaState::Completed);
        assert!(result.steps.is_empty());
        assert!(result.compensation_results.is_empty());
    }
}
