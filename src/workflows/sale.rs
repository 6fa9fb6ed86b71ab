//! Sale saga template: validate store, reserve stock, calculate the total,
//! create the sale, confirm the reservation.

use futures::future::BoxFuture;
use serde_json::json;

use super::{release_items, reserve_items, SagaTemplate, StepContext, StepDefinition};
use crate::saga::{FailureKind, SagaError, SagaState, SagaType};

pub fn template() -> SagaTemplate {
    SagaTemplate::new(
        SagaType::Sale,
        vec![
            StepDefinition {
                name: "ValidateStore",
                service_name: "store-service",
                expected_post_state: SagaState::StoreValidated,
                forward: validate_store,
                compensate: None,
            },
            StepDefinition {
                name: "ReserveStock",
                service_name: "product-service",
                expected_post_state: SagaState::StockReserved,
                forward: reserve_stock,
                compensate: Some(release_stock),
            },
            StepDefinition {
                name: "CalculateTotal",
                service_name: "sale-service",
                expected_post_state: SagaState::TotalCalculated,
                forward: calculate_total,
                compensate: None,
            },
            StepDefinition {
                name: "CreateSale",
                service_name: "sale-service",
                expected_post_state: SagaState::SaleCreated,
                forward: create_sale,
                compensate: Some(cancel_sale),
            },
            StepDefinition {
                name: "ConfirmStock",
                service_name: "product-service",
                expected_post_state: SagaState::StockConfirmed,
                forward: confirm_stock,
                compensate: None,
            },
        ],
    )
}

fn validate_store(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.sale()?;
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

        let items = request.items();
        let valid = ctx
            .participants
            .sale
            .validate_sale_items(&items, &request.store_id, ctx.saga_id)
            .await?;
        if !valid {
            return Err(SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: "sale-service".to_string(),
                message: "sale items failed validation".to_string(),
            });
        }

        Ok(json!({ "storeId": store.store_id, "storeName": store.name }))
    })
}

fn reserve_stock(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.sale()?;
        reserve_items(ctx, "ReserveStock", &request.store_id, &request.items()).await
    })
}

fn release_stock<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move { release_items(ctx, "ReleaseStock", data).await })
}

fn calculate_total(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.sale()?;
        let total = ctx
            .participants
            .sale
            .calculate_sale_total(&request.items(), &request.store_id, ctx.saga_id)
            .await?;
        Ok(json!({ "total": total }))
    })
}

fn create_sale(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.sale()?;
        let total = ctx
            .output("CalculateTotal", "total")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| SagaError::Serialization {
                reason: "CalculateTotal output missing".to_string(),
            })?;

        let sale_id = ctx
            .participants
            .sale
            .create_sale(&request.store_id, &request.items(), total, ctx.saga_id)
            .await?;

        Ok(json!({ "saleId": sale_id, "storeId": request.store_id, "total": total }))
    })
}

fn cancel_sale<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move {
        let sale_id = data
            .get("saleId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SagaError::Serialization {
                reason: "saleId missing from compensation data".to_string(),
            })?;
        let store_id = data
            .get("storeId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        ctx.participants.sale.cancel_sale(sale_id, store_id).await?;
        Ok(())
    })
}

fn confirm_stock(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.sale()?;
        let confirmed = ctx
            .participants
            .product
            .confirm_stock(&request.store_id, &request.items(), ctx.saga_id)
            .await?;
        Ok(json!({ "confirmed": confirmed }))
    })
}
