//! Saga metrics and structured business-event logging.
//!
//! Counter/histogram/gauge names and label sets are the contract consumed by
//! dashboards; changing them is a breaking change.

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;
use uuid::Uuid;

use crate::saga::{FailureKind, SagaState, SagaType};

pub const SAGA_DURATION_BUCKETS: [f64; 8] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];
pub const STEP_DURATION_BUCKETS: [f64; 7] = [0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0];

/// Install the Prometheus recorder with the saga histogram buckets and return
/// the handle backing `GET /metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("saga_duration_seconds".to_string()),
            &SAGA_DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("saga_step_duration_seconds".to_string()),
            &STEP_DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}

pub fn saga_started(saga_type: SagaType) {
    counter!("saga_started_total", "saga_type" => saga_type.as_str()).increment(1);
    gauge!("active_sagas", "saga_type" => saga_type.as_str()).increment(1.0);
}

pub fn saga_completed(saga_type: SagaType, duration_secs: f64) {
    counter!("saga_completed_total", "saga_type" => saga_type.as_str()).increment(1);
    histogram!(
        "saga_duration_seconds",
        "saga_type" => saga_type.as_str(),
        "status" => "Completed"
    )
    .record(duration_secs);
    gauge!("active_sagas", "saga_type" => saga_type.as_str()).decrement(1.0);
}

pub fn saga_failed(saga_type: SagaType, failure_reason: &str, final_state: SagaState, duration_secs: f64) {
    counter!(
        "saga_failure_total",
        "saga_type" => saga_type.as_str(),
        "failure_reason" => failure_reason.to_string()
    )
    .increment(1);
    histogram!(
        "saga_duration_seconds",
        "saga_type" => saga_type.as_str(),
        "status" => final_state.as_str()
    )
    .record(duration_secs);
    gauge!("active_sagas", "saga_type" => saga_type.as_str()).decrement(1.0);
}

pub fn step_started(saga_type: SagaType, step_name: &str, service_name: &str) {
    counter!(
        "saga_step_total",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
}

pub fn step_succeeded(saga_type: SagaType, step_name: &str, service_name: &str, duration_secs: f64) {
    counter!(
        "saga_step_success_total",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
    histogram!(
        "saga_step_duration_seconds",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string(),
        "status" => "Completed"
    )
    .record(duration_secs);
}

pub fn step_failed(
    saga_type: SagaType,
    step_name: &str,
    service_name: &str,
    error_type: &str,
    duration_secs: f64,
) {
    counter!(
        "saga_step_failure_total",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
    histogram!(
        "saga_step_duration_seconds",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string(),
        "status" => "Failed"
    )
    .record(duration_secs);
}

pub fn compensation_executed(
    saga_type: SagaType,
    step_name: &str,
    service_name: &str,
    successful: bool,
) {
    counter!(
        "saga_compensation_total",
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
    let outcome = if successful {
        "saga_compensation_success_total"
    } else {
        "saga_compensation_failure_total"
    };
    counter!(
        outcome,
        "saga_type" => saga_type.as_str(),
        "step_name" => step_name.to_string(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
}

pub fn state_transition(saga_type: SagaType, from: SagaState, to: SagaState, service_name: &str) {
    counter!(
        "saga_state_transitions_total",
        "saga_type" => saga_type.as_str(),
        "from_state" => from.as_str(),
        "to_state" => to.as_str(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
}

pub fn controlled_failure(kind: FailureKind, service_name: &str) {
    counter!(
        "controlled_failure_total",
        "failure_type" => kind.as_str(),
        "service_name" => service_name.to_string()
    )
    .increment(1);
}

pub fn sagas_in_state(saga_type: SagaType, state: SagaState, count: f64) {
    gauge!(
        "sagas_in_state",
        "saga_type" => saga_type.as_str(),
        "state" => state.as_str()
    )
    .set(count);
}

/// Structured business-event record. One schema for every saga event keeps
/// the log stream machine-consumable.
pub fn log_saga_event(
    event_type: &str,
    saga_id: Uuid,
    saga_type: SagaType,
    service_name: &str,
    correlation_id: Uuid,
    message: &str,
    data: &serde_json::Value,
) {
    info!(
        event_type,
        saga_id = %saga_id,
        saga_type = saga_type.as_str(),
        service_name,
        correlation_id = %correlation_id,
        data = %data,
        "{message}"
    );
}
