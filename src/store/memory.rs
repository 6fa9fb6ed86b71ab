//! In-memory saga store for tests and non-persistent deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{validate_mutation, SagaMutation, SagaStore, StateCount};
use crate::saga::{SagaError, SagaRecord, SagaState, SagaTransition};

/// HashMap-backed store. Distinct sagas update concurrently; one saga's
/// updates serialize on its own mutex.
pub struct InMemorySagaStore {
    sagas: RwLock<HashMap<Uuid, Arc<Mutex<SagaRecord>>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self {
            sagas: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, record: SagaRecord) -> Result<SagaRecord, SagaError> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&record.saga_id) {
            return Err(SagaError::AlreadyExists {
                saga_id: record.saga_id,
            });
        }
        sagas.insert(record.saga_id, Arc::new(Mutex::new(record.clone())));
        Ok(record)
    }

    async fn get(&self, saga_id: Uuid) -> Result<Option<SagaRecord>, SagaError> {
        let entry = {
            let sagas = self.sagas.read().await;
            sagas.get(&saga_id).cloned()
        };
        match entry {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        saga_id: Uuid,
        mutation: SagaMutation,
    ) -> Result<SagaRecord, SagaError> {
        let entry = {
            let sagas = self.sagas.read().await;
            sagas
                .get(&saga_id)
                .cloned()
                .ok_or(SagaError::NotFound { saga_id })?
        };

        let mut guard = entry.lock().await;
        let (mut next, appended) = mutation(&guard)?;
        validate_mutation(&guard, &next, &appended)?;
        next.transitions.extend(appended);
        next.updated_at = chrono::Utc::now();
        *guard = next.clone();
        Ok(next)
    }

    async fn get_all(&self) -> Result<Vec<SagaRecord>, SagaError> {
        let entries: Vec<Arc<Mutex<SagaRecord>>> = {
            let sagas = self.sagas.read().await;
            sagas.values().cloned().collect()
        };
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn get_by_state(&self, state: SagaState) -> Result<Vec<SagaRecord>, SagaError> {
        let mut records = self.get_all().await?;
        records.retain(|r| r.current_state == state);
        Ok(records)
    }

    async fn get_transitions(&self, saga_id: Uuid) -> Result<Vec<SagaTransition>, SagaError> {
        let record = self
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound { saga_id })?;
        let mut transitions = record.transitions;
        transitions.sort_by_key(|t| t.timestamp);
        Ok(transitions)
    }

    async fn count_by_state(&self) -> Result<Vec<StateCount>, SagaError> {
        let records = self.get_all().await?;
        let mut counts: HashMap<(crate::saga::SagaType, SagaState), u64> = HashMap::new();
        for record in &records {
            *counts
                .entry((record.saga_type, record.current_state))
                .or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((saga_type, state), count)| StateCount {
                saga_type,
                state,
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{SagaStepRecord, SagaType, TransitionEventType};

    fn sale_record() -> SagaRecord {
        SagaRecord::new(
            SagaType::Sale,
            Uuid::new_v4(),
            vec![SagaStepRecord::new(1, "ValidateStore", "store-service")],
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = InMemorySagaStore::new();
        let record = sale_record();

        store.create(record.clone()).await.unwrap();
        let err = store.create(record).await.unwrap_err();
        assert!(matches!(err, SagaError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_applies_transitions_atomically() {
        let store = InMemorySagaStore::new();
        let record = store.create(sale_record()).await.unwrap();
        let saga_id = record.saga_id;

        let updated = store
            .update(
                saga_id,
                Box::new(|current| {
                    let transition = current.transition_to(
                        SagaState::StoreValidated,
                        "store-service",
                        "ValidateStore",
                        TransitionEventType::Success,
                    );
                    let mut next = current.clone();
                    next.current_state = SagaState::StoreValidated;
                    Ok((next, vec![transition]))
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.current_state, SagaState::StoreValidated);
        assert_eq!(updated.transitions.len(), 1);

        let transitions = store.get_transitions(saga_id).await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to_state, SagaState::StoreValidated);
    }

    #[tokio::test]
    async fn test_update_rejects_illegal_edge_without_persisting() {
        let store = InMemorySagaStore::new();
        let record = store.create(sale_record()).await.unwrap();
        let saga_id = record.saga_id;

        let err = store
            .update(
                saga_id,
                Box::new(|current| {
                    let transition = current.transition_to(
                        SagaState::SaleCreated,
                        "sale-service",
                        "CreateSale",
                        TransitionEventType::Success,
                    );
                    let mut next = current.clone();
                    next.current_state = SagaState::SaleCreated;
                    Ok((next, vec![transition]))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::IllegalTransition { .. }));

        // Nothing persisted
        let current = store.get(saga_id).await.unwrap().unwrap();
        assert_eq!(current.current_state, SagaState::Started);
        assert!(current.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_get_all_is_newest_first() {
        let store = InMemorySagaStore::new();
        let first = store.create(sale_record()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create(sale_record()).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].saga_id, second.saga_id);
        assert_eq!(all[1].saga_id, first.saga_id);
    }

    #[tokio::test]
    async fn test_get_by_state_and_counts() {
        let store = InMemorySagaStore::new();
        store.create(sale_record()).await.unwrap();
        store.create(sale_record()).await.unwrap();

        let started = store.get_by_state(SagaState::Started).await.unwrap();
        assert_eq!(started.len(), 2);
        assert!(store
            .get_by_state(SagaState::Completed)
            .await
            .unwrap()
            .is_empty());

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].state, SagaState::Started);
    }

    #[tokio::test]
    async fn test_unknown_saga_is_not_found() {
        let store = InMemorySagaStore::new();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());

        let err = store
            .update(Uuid::new_v4(), Box::new(|r| Ok((r.clone(), vec![]))))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::NotFound { .. }));
    }
}
