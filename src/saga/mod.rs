//! Saga state model: records, transitions, steps and results.

pub mod error;
pub mod state;
pub mod step;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{FailureKind, SagaError};
pub use state::{
    forward_path, initial_state, is_legal_edge, SagaState, SagaTransition, SagaType,
    TransitionEventType,
};
pub use step::{CompensationOutcome, CompensationRecord, SagaStepRecord, StepStatus};

/// Durable record of one saga: the single source of truth for its state,
/// steps, transition log and compensation bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaRecord {
    pub saga_id: Uuid,
    pub saga_type: SagaType,
    pub current_state: SagaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub correlation_id: Uuid,
    pub steps: Vec<SagaStepRecord>,
    pub transitions: Vec<SagaTransition>,
    /// Completed steps with compensations, in forward (push) order
    pub compensation_stack: Vec<CompensationRecord>,
    pub compensation_results: Vec<CompensationOutcome>,
    pub has_compensation_failures: bool,
}

impl SagaRecord {
    pub fn new(saga_type: SagaType, correlation_id: Uuid, steps: Vec<SagaStepRecord>) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            saga_type,
            current_state: initial_state(saga_type),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            correlation_id,
            steps,
            transitions: Vec::new(),
            compensation_stack: Vec::new(),
            compensation_results: Vec::new(),
            has_compensation_failures: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn step(&self, step_name: &str) -> Option<&SagaStepRecord> {
        self.steps.iter().find(|s| s.step_name == step_name)
    }

    pub fn step_mut(&mut self, step_name: &str) -> Option<&mut SagaStepRecord> {
        self.steps.iter_mut().find(|s| s.step_name == step_name)
    }

    /// Timestamp of the most recent transition, the floor for the next one.
    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        self.transitions.last().map(|t| t.timestamp)
    }

    /// Build a transition from the current state, clamped to stay monotonic.
    pub fn transition_to(
        &self,
        to: SagaState,
        service_name: impl Into<String>,
        action: impl Into<String>,
        event_type: TransitionEventType,
    ) -> SagaTransition {
        SagaTransition::new(
            self.saga_id,
            self.current_state,
            to,
            service_name,
            action,
            event_type,
        )
        .after(self.last_transition_at())
    }

    /// Whether a successful compensation was already recorded for a step.
    pub fn compensation_succeeded(&self, step_name: &str) -> bool {
        self.compensation_results
            .iter()
            .any(|r| r.step_name == step_name && r.is_successful)
    }

    pub fn completed_step_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }
}

/// Result returned to callers of every saga operation. Failed sagas carry the
/// per-step report and per-compensation outcomes rather than an opaque error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaResult {
    pub saga_id: Uuid,
    pub saga_type: SagaType,
    pub is_success: bool,
    pub final_state: SagaState,
    pub steps: Vec<SagaStepRecord>,
    pub compensation_results: Vec<CompensationOutcome>,
    pub has_compensation_failures: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl SagaResult {
    pub fn from_record(record: &SagaRecord) -> Self {
        let end = record.completed_at.unwrap_or(record.updated_at);
        let duration_ms = (end - record.created_at).num_milliseconds().max(0) as u64;
        Self {
            saga_id: record.saga_id,
            saga_type: record.saga_type,
            is_success: record.current_state == SagaState::Completed,
            final_state: record.current_state,
            steps: record.steps.clone(),
            compensation_results: record.compensation_results.clone(),
            has_compensation_failures: record.has_compensation_failures,
            error_message: record.error_message.clone(),
            completed_at: record.completed_at,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sale_record() -> SagaRecord {
        SagaRecord::new(
            SagaType::Sale,
            Uuid::new_v4(),
            vec![
                SagaStepRecord::new(1, "ValidateStore", "store-service"),
                SagaStepRecord::new(2, "ReserveStock", "product-service"),
            ],
        )
    }

    #[test]
    fn test_new_record_starts_at_initial_state() {
        let record = sale_record();
        assert_eq!(record.current_state, SagaState::Started);
        assert!(!record.is_terminal());
        assert!(record.transitions.is_empty());
        assert!(record.completed_at.is_none());

        let choreographed = SagaRecord::new(SagaType::ChoreographedOrder, Uuid::new_v4(), vec![]);
        assert_eq!(choreographed.current_state, SagaState::InProgress);
    }

    #[test]
    fn test_transition_builder_uses_current_state() {
        let record = sale_record();
        let transition = record.transition_to(
            SagaState::StoreValidated,
            "store-service",
            "ValidateStore",
            TransitionEventType::Success,
        );

        assert_eq!(transition.from_state, SagaState::Started);
        assert_eq!(transition.to_state, SagaState::StoreValidated);
        assert_eq!(transition.saga_id, record.saga_id);
    }

    #[test]
    fn test_result_reflects_failed_record() {
        let mut record = sale_record();
        record.current_state = SagaState::Compensated;
        record.error_message = Some("insufficient stock".to_string());

        let result = SagaResult::from_record(&record);
        assert!(!result.is_success);
        assert_eq!(result.final_state, SagaState::Compensated);
        assert_eq!(result.error_message.as_deref(), Some("insufficient stock"));
    }

    #[test]
    fn test_compensation_lookup() {
        let mut record = sale_record();
        record.compensation_results.push(CompensationOutcome {
            step_name: "ReserveStock".to_string(),
            service_name: "product-service".to_string(),
            is_successful: true,
            error_message: None,
            duration_ms: 12,
            executed_at: Utc::now(),
        });

        assert!(record.compensation_succeeded("ReserveStock"));
        assert!(!record.compensation_succeeded("CreateSale"));
    }
}
