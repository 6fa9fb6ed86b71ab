//! Per-step execution records and compensation bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Compensated,
}

impl StepStatus {
    /// Legal step status edges: Pending -> InProgress -> {Completed | Failed};
    /// Completed -> Compensated. Nothing else.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
                | (StepStatus::Completed, StepStatus::Compensated)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "Pending",
            StepStatus::InProgress => "InProgress",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensated => "Compensated",
        };
        f.write_str(s)
    }
}

/// Execution record for one saga step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStepRecord {
    /// 1-based position in the template
    pub step_number: u32,
    pub step_name: String,
    pub service_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SagaStepRecord {
    pub fn new(step_number: u32, step_name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            step_number,
            step_name: step_name.into(),
            service_name: service_name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            failed_at: None,
            compensated_at: None,
            step_data: None,
            compensation_data: None,
            error_message: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, data: Option<serde_json::Value>) {
        self.status = StepStatus::Completed;
        let now = Utc::now();
        self.completed_at = Some(match self.started_at {
            Some(started) if started > now => started,
            _ => now,
        });
        self.step_data = data;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error_message = Some(error.into());
    }

    pub fn mark_compensated(&mut self) {
        self.status = StepStatus::Compensated;
        self.compensated_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at.or(self.failed_at)) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Serializable record pairing a completed step with the payload its
/// compensation needs. The compensation action itself is rederived from the
/// saga template, so a restarted process can still roll back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRecord {
    pub step_name: String,
    pub service_name: String,
    pub data: serde_json::Value,
}

/// Outcome of one compensation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationOutcome {
    pub step_name: String,
    pub service_name: String,
    pub is_successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lifecycle() {
        let mut step = SagaStepRecord::new(1, "ReserveStock", "product-service");
        assert_eq!(step.status, StepStatus::Pending);

        step.start();
        assert_eq!(step.status, StepStatus::InProgress);
        assert!(step.started_at.is_some());

        step.complete(Some(serde_json::json!({"reserved": 2})));
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.completed_at.unwrap() >= step.started_at.unwrap());

        step.mark_compensated();
        assert_eq!(step.status, StepStatus::Compensated);
        assert!(step.compensated_at.is_some());
    }

    #[test]
    fn test_step_failure_captures_error() {
        let mut step = SagaStepRecord::new(3, "ProcessPayment", "payment-service");
        step.start();
        step.fail("card declined");

        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error_message.as_deref(), Some("card declined"));
        assert!(step.failed_at.is_some());
        assert!(step.duration().is_some());
    }

    #[test]
    fn test_status_edges() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::InProgress));
        assert!(StepStatus::InProgress.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::InProgress.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Completed.can_transition_to(StepStatus::Compensated));

        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Compensated));
        assert!(!StepStatus::Compensated.can_transition_to(StepStatus::Pending));
    }
}
