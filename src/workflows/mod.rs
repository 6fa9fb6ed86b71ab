//! Saga templates: ordered step descriptors with paired compensations.
//!
//! Templates are plain values in a registry rather than trait objects wired
//! through DI; dispatch stays explicit and a template can be inspected,
//! listed and tested without running it. Compensation actions are function
//! references paired with serialized per-step data, so a compensation is
//! rederivable from template + data after a process restart.

pub mod order;
pub mod sale;
pub mod stock;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{CreateOrderRequest, CreateSaleRequest, StockUpdateRequest};
use crate::participants::{ParticipantSet, SaleItem};
use crate::saga::{SagaError, SagaState, SagaStepRecord, SagaType};

/// Typed request a saga was started with
#[derive(Debug, Clone)]
pub enum SagaRequest {
    Sale(CreateSaleRequest),
    Order(CreateOrderRequest),
    Stock(StockUpdateRequest),
}

/// Execution context handed to every forward and compensation function.
/// Compensations must not rely on `request`: after a restart only the
/// persisted compensation data is available.
pub struct StepContext {
    pub saga_id: Uuid,
    pub correlation_id: Uuid,
    pub participants: ParticipantSet,
    pub request: Option<SagaRequest>,
    /// Output data of completed steps, keyed by step name
    pub outputs: HashMap<String, serde_json::Value>,
}

impl StepContext {
    pub fn new(
        saga_id: Uuid,
        correlation_id: Uuid,
        participants: ParticipantSet,
        request: Option<SagaRequest>,
    ) -> Self {
        Self {
            saga_id,
            correlation_id,
            participants,
            request,
            outputs: HashMap::new(),
        }
    }

    pub fn sale(&self) -> Result<&CreateSaleRequest, SagaError> {
        match &self.request {
            Some(SagaRequest::Sale(request)) => Ok(request),
            _ => Err(missing_request("sale")),
        }
    }

    pub fn order(&self) -> Result<&CreateOrderRequest, SagaError> {
        match &self.request {
            Some(SagaRequest::Order(request)) => Ok(request),
            _ => Err(missing_request("order")),
        }
    }

    pub fn stock(&self) -> Result<&StockUpdateRequest, SagaError> {
        match &self.request {
            Some(SagaRequest::Stock(request)) => Ok(request),
            _ => Err(missing_request("stock update")),
        }
    }

    /// A field from an earlier step's output data
    pub fn output(&self, step_name: &str, key: &str) -> Option<&serde_json::Value> {
        self.outputs.get(step_name).and_then(|data| data.get(key))
    }
}

fn missing_request(expected: &str) -> SagaError {
    SagaError::Serialization {
        reason: format!("{expected} request not available in step context"),
    }
}

pub type ForwardFn =
    for<'a> fn(&'a StepContext) -> BoxFuture<'a, Result<serde_json::Value, SagaError>>;
pub type CompensateFn = for<'a> fn(
    &'a StepContext,
    &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>>;

/// One step of a saga template
pub struct StepDefinition {
    pub name: &'static str,
    pub service_name: &'static str,
    pub expected_post_state: SagaState,
    pub forward: ForwardFn,
    pub compensate: Option<CompensateFn>,
}

/// Ordered steps for one saga type
pub struct SagaTemplate {
    pub saga_type: SagaType,
    pub steps: Vec<StepDefinition>,
}

impl SagaTemplate {
    pub fn new(saga_type: SagaType, steps: Vec<StepDefinition>) -> Self {
        Self { saga_type, steps }
    }

    /// Fresh pending step records for a new saga of this template
    pub fn step_records(&self) -> Vec<SagaStepRecord> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| SagaStepRecord::new(i as u32 + 1, step.name, step.service_name))
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Registry mapping saga types to their templates, built once at startup
pub struct TemplateRegistry {
    templates: HashMap<SagaType, SagaTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Registry with the built-in sale, order and stock-update templates
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(sale::template());
        registry.register(order::template());
        registry.register(stock::template());
        registry
    }

    pub fn register(&mut self, template: SagaTemplate) {
        self.templates.insert(template.saga_type, template);
    }

    pub fn get(&self, saga_type: SagaType) -> Option<&SagaTemplate> {
        self.templates.get(&saga_type)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Compensation payload for reserved stock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedStock {
    pub store_id: String,
    pub items: Vec<StockLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLine {
    pub product_name: String,
    pub quantity: u32,
}

/// Validate availability for every line, then apply the reservations. If a
/// reservation fails midway the already-applied lines are released before the
/// error propagates, so a failed step leaves stock untouched.
pub(crate) async fn reserve_items(
    ctx: &StepContext,
    step_name: &str,
    store_id: &str,
    items: &[SaleItem],
) -> Result<serde_json::Value, SagaError> {
    let product = &ctx.participants.product;
    for item in items {
        let available = product
            .validate_stock_availability(&item.product_name, store_id, item.quantity, ctx.saga_id)
            .await?;
        if !available {
            return Err(SagaError::StepFailure {
                kind: crate::saga::FailureKind::InsufficientStock,
                service: "product-service".to_string(),
                message: format!(
                    "insufficient stock for {} at {}",
                    item.product_name, store_id
                ),
            });
        }
    }

    let mut applied: Vec<&SaleItem> = Vec::new();
    for item in items {
        match product
            .update_stock(
                &item.product_name,
                store_id,
                -(item.quantity as i64),
                ctx.saga_id,
                step_name,
            )
            .await
        {
            Ok(_) => applied.push(item),
            Err(err) => {
                for done in applied {
                    let _ = product
                        .update_stock(
                            &done.product_name,
                            store_id,
                            done.quantity as i64,
                            ctx.saga_id,
                            &format!("{step_name}:undo"),
                        )
                        .await;
                }
                return Err(err);
            }
        }
    }

    let reserved = ReservedStock {
        store_id: store_id.to_string(),
        items: items
            .iter()
            .map(|i| StockLine {
                product_name: i.product_name.clone(),
                quantity: i.quantity,
            })
            .collect(),
    };
    Ok(serde_json::to_value(reserved)?)
}

/// Release previously reserved stock; the inverse of `reserve_items`.
pub(crate) async fn release_items(
    ctx: &StepContext,
    step_name: &str,
    data: &serde_json::Value,
) -> Result<(), SagaError> {
    let reserved: ReservedStock = serde_json::from_value(data.clone())?;
    for line in &reserved.items {
        ctx.participants
            .product
            .update_stock(
                &line.product_name,
                &reserved.store_id,
                line.quantity as i64,
                ctx.saga_id,
                step_name,
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_orchestrated_types() {
        let registry = TemplateRegistry::builtin();
        assert!(registry.get(SagaType::Sale).is_some());
        assert!(registry.get(SagaType::Order).is_some());
        assert!(registry.get(SagaType::StockUpdate).is_some());
        assert!(registry.get(SagaType::ChoreographedOrder).is_none());
    }

    #[test]
    fn test_step_records_are_numbered_from_one() {
        let registry = TemplateRegistry::builtin();
        let template = registry.get(SagaType::Sale).unwrap();
        let records = template.step_records();

        assert_eq!(records.len(), 5);
        assert_eq!(records[0].step_number, 1);
        assert_eq!(records[4].step_number, 5);
        assert!(records
            .iter()
            .all(|r| r.status == crate::saga::StepStatus::Pending));
    }

    #[test]
    fn test_template_post_states_follow_forward_path() {
        let registry = TemplateRegistry::builtin();
        for saga_type in [SagaType::Sale, SagaType::Order, SagaType::StockUpdate] {
            let template = registry.get(saga_type).unwrap();
            let path = crate::saga::forward_path(saga_type);
            // Each step advances exactly one edge along the path
            for (i, step) in template.steps.iter().enumerate() {
                assert_eq!(
                    step.expected_post_state,
                    path[i + 1],
                    "{saga_type} step {} lands off-path",
                    step.name
                );
            }
        }
    }
}
