//! Stock update saga template: validate the store, verify the current level,
//! apply the delta. The compensation reverts the applied delta.

use futures::future::BoxFuture;
use serde_json::json;

use super::{SagaTemplate, StepContext, StepDefinition};
use crate::models::StockOperation;
use crate::saga::{FailureKind, SagaError, SagaState, SagaType};

pub fn template() -> SagaTemplate {
    SagaTemplate::new(
        SagaType::StockUpdate,
        vec![
            StepDefinition {
                name: "ValidateStore",
                service_name: "store-service",
                expected_post_state: SagaState::StoreValidated,
                forward: validate_store,
                compensate: None,
            },
            StepDefinition {
                name: "VerifyStockLevel",
                service_name: "product-service",
                expected_post_state: SagaState::StockVerified,
                forward: verify_stock_level,
                compensate: None,
            },
            StepDefinition {
                name: "ApplyStockUpdate",
                service_name: "product-service",
                expected_post_state: SagaState::StockConfirmed,
                forward: apply_stock_update,
                compensate: Some(revert_stock_update),
            },
        ],
    )
}

fn validate_store(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.stock()?;
        let store = ctx
            .participants
            .store
            .get_store_by_id(&request.store_id, ctx.saga_id)
            .await?
            .ok_or_else(|| SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: "store-service".to_string(),
                message: format!("store {} not found", request.store_id),
            })?;
        Ok(json!({ "storeId": store.store_id }))
    })
}

fn verify_stock_level(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.stock()?;
        let current = ctx
            .participants
            .product
            .get_stock(&request.product_name, &request.store_id)
            .await?
            .unwrap_or(0);

        if request.operation == StockOperation::Remove && current < request.quantity as i64 {
            return Err(SagaError::StepFailure {
                kind: FailureKind::InsufficientStock,
                service: "product-service".to_string(),
                message: format!(
                    "cannot remove {} of {} at {}: only {} on hand",
                    request.quantity, request.product_name, request.store_id, current
                ),
            });
        }

        Ok(json!({ "previousLevel": current }))
    })
}

fn apply_stock_update(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.stock()?;
        let previous = ctx
            .output("VerifyStockLevel", "previousLevel")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SagaError::Serialization {
                reason: "VerifyStockLevel output missing".to_string(),
            })?;

        let delta = match request.operation {
            StockOperation::Add => request.quantity as i64,
            StockOperation::Remove => -(request.quantity as i64),
            StockOperation::Set => request.quantity as i64 - previous,
        };

        ctx.participants
            .product
            .update_stock(
                &request.product_name,
                &request.store_id,
                delta,
                ctx.saga_id,
                "ApplyStockUpdate",
            )
            .await?;

        Ok(json!({
            "productName": request.product_name,
            "storeId": request.store_id,
            "delta": delta,
        }))
    })
}

fn revert_stock_update<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move {
        let product_name = data
            .get("productName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SagaError::Serialization {
                reason: "productName missing from compensation data".to_string(),
            })?;
        let store_id = data
            .get("storeId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let delta = data.get("delta").and_then(|v| v.as_i64()).unwrap_or(0);

        ctx.participants
            .product
            .update_stock(
                product_name,
                store_id,
                -delta,
                ctx.saga_id,
                "RevertStockUpdate",
            )
            .await?;
        Ok(())
    })
}
