//! Durable saga state store: record persistence plus the append-only
//! per-saga transition log.

pub mod memory;
#[cfg(feature = "database-persistence")]
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::saga::{
    is_legal_edge, SagaError, SagaRecord, SagaState, SagaTransition, SagaType,
};

pub use memory::InMemorySagaStore;
#[cfg(feature = "database-persistence")]
pub use postgres::PostgresSagaStore;

/// A mutation receives the current record and returns the next record plus
/// the transitions to append. The store applies it under a per-saga exclusive
/// lock and rejects results that violate state-edge legality.
pub type SagaMutation =
    Box<dyn FnOnce(&SagaRecord) -> Result<(SagaRecord, Vec<SagaTransition>), SagaError> + Send>;

/// Per-`(saga_type, state)` record count, feeding the sagas-in-state gauges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCount {
    pub saga_type: SagaType,
    pub state: SagaState,
    pub count: u64,
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persist a new record; fails with `AlreadyExists` on a duplicate id.
    async fn create(&self, record: SagaRecord) -> Result<SagaRecord, SagaError>;

    async fn get(&self, saga_id: Uuid) -> Result<Option<SagaRecord>, SagaError>;

    /// Apply a mutation atomically: the record snapshot and the appended
    /// transitions either both land or neither does. Readers observe pre- or
    /// post-update state, never partial.
    async fn update(&self, saga_id: Uuid, mutation: SagaMutation)
        -> Result<SagaRecord, SagaError>;

    /// All records, ordered by `created_at` descending.
    async fn get_all(&self) -> Result<Vec<SagaRecord>, SagaError>;

    async fn get_by_state(&self, state: SagaState) -> Result<Vec<SagaRecord>, SagaError>;

    /// Transition log for one saga, ordered by timestamp ascending.
    async fn get_transitions(&self, saga_id: Uuid) -> Result<Vec<SagaTransition>, SagaError>;

    async fn count_by_state(&self) -> Result<Vec<StateCount>, SagaError>;
}

/// Shared guard run by every store implementation before committing a
/// mutation result.
pub(crate) fn validate_mutation(
    current: &SagaRecord,
    next: &SagaRecord,
    appended: &[SagaTransition],
) -> Result<(), SagaError> {
    if matches!(
        current.current_state,
        SagaState::Compensated | SagaState::Aborted
    ) {
        return Err(SagaError::IllegalState {
            saga_id: current.saga_id,
            state: current.current_state,
            operation: "update".to_string(),
        });
    }

    let mut expected_from = current.current_state;
    let mut floor = current.last_transition_at();
    for transition in appended {
        if transition.from_state != expected_from {
            return Err(SagaError::IllegalTransition {
                saga_id: current.saga_id,
                from: transition.from_state,
                to: transition.to_state,
            });
        }
        if !is_legal_edge(current.saga_type, transition.from_state, transition.to_state) {
            return Err(SagaError::IllegalTransition {
                saga_id: current.saga_id,
                from: transition.from_state,
                to: transition.to_state,
            });
        }
        if let Some(floor) = floor {
            if transition.timestamp < floor {
                return Err(SagaError::StoreFatal {
                    reason: format!(
                        "non-monotonic transition timestamp for saga {}",
                        current.saga_id
                    ),
                });
            }
        }
        floor = Some(transition.timestamp);
        expected_from = transition.to_state;
    }

    // The record's state must land where the transition chain ends; a state
    // change without a logged transition is rejected.
    if next.current_state != expected_from {
        return Err(SagaError::IllegalTransition {
            saga_id: current.saga_id,
            from: expected_from,
            to: next.current_state,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{SagaStepRecord, TransitionEventType};

    fn record() -> SagaRecord {
        SagaRecord::new(
            SagaType::Sale,
            Uuid::new_v4(),
            vec![SagaStepRecord::new(1, "ValidateStore", "store-service")],
        )
    }

    #[test]
    fn test_legal_mutation_passes() {
        let current = record();
        let transition = current.transition_to(
            SagaState::StoreValidated,
            "store-service",
            "ValidateStore",
            TransitionEventType::Success,
        );
        let mut next = current.clone();
        next.current_state = SagaState::StoreValidated;
        next.transitions.push(transition.clone());

        assert!(validate_mutation(&current, &next, &[transition]).is_ok());
    }

    #[test]
    fn test_illegal_edge_is_rejected() {
        let current = record();
        let transition = current.transition_to(
            SagaState::SaleCreated,
            "sale-service",
            "CreateSale",
            TransitionEventType::Success,
        );
        let mut next = current.clone();
        next.current_state = SagaState::SaleCreated;

        let err = validate_mutation(&current, &next, &[transition]).unwrap_err();
        assert!(matches!(err, SagaError::IllegalTransition { .. }));
    }

    #[test]
    fn test_state_change_without_transition_is_rejected() {
        let current = record();
        let mut next = current.clone();
        next.current_state = SagaState::StoreValidated;

        let err = validate_mutation(&current, &next, &[]).unwrap_err();
        assert!(matches!(err, SagaError::IllegalTransition { .. }));
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let mut current = record();
        current.current_state = SagaState::Compensated;
        let next = current.clone();

        let err = validate_mutation(&current, &next, &[]).unwrap_err();
        assert!(matches!(err, SagaError::IllegalState { .. }));
    }
}
