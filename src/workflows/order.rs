//! Order saga template: create the order, reserve stock, charge the payment,
//! confirm the order. Compensations cancel the order, release the stock and
//! refund the payment in reverse order of their forward steps.

use futures::future::BoxFuture;
use serde_json::json;
use uuid::Uuid;

use super::{release_items, reserve_items, SagaTemplate, StepContext, StepDefinition};
use crate::saga::{SagaError, SagaState, SagaType};

pub fn template() -> SagaTemplate {
    SagaTemplate::new(
        SagaType::Order,
        vec![
            StepDefinition {
                name: "CreateOrder",
                service_name: "order-service",
                expected_post_state: SagaState::InProgress,
                forward: create_order,
                compensate: Some(cancel_order),
            },
            StepDefinition {
                name: "ReserveStock",
                service_name: "product-service",
                expected_post_state: SagaState::StockReserved,
                forward: reserve_stock,
                compensate: Some(release_stock),
            },
            StepDefinition {
                name: "ProcessPayment",
                service_name: "payment-service",
                expected_post_state: SagaState::PaymentProcessed,
                forward: process_payment,
                compensate: Some(refund_payment),
            },
            StepDefinition {
                name: "ConfirmOrder",
                service_name: "order-service",
                expected_post_state: SagaState::StockConfirmed,
                forward: confirm_order,
                compensate: None,
            },
        ],
    )
}

fn uuid_from(data: &serde_json::Value, key: &str) -> Result<Uuid, SagaError> {
    data.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| SagaError::Serialization {
            reason: format!("{key} missing from compensation data"),
        })
}

fn create_order(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.order()?;
        let order_id = ctx
            .participants
            .order
            .create_order(
                &request.customer_id,
                &request.store_id,
                &request.items(),
                &request.payment_method,
                ctx.saga_id,
            )
            .await?;

        Ok(json!({ "orderId": order_id, "storeId": request.store_id }))
    })
}

fn cancel_order<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move {
        let order_id = uuid_from(data, "orderId")?;
        ctx.participants.order.cancel_order(order_id, ctx.saga_id).await?;
        Ok(())
    })
}

fn reserve_stock(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.order()?;
        reserve_items(ctx, "ReserveStock", &request.store_id, &request.items()).await
    })
}

fn release_stock<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move { release_items(ctx, "ReleaseStock", data).await })
}

fn process_payment(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let request = ctx.order()?;
        let order_id = ctx
            .output("CreateOrder", "orderId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| SagaError::Serialization {
                reason: "CreateOrder output missing".to_string(),
            })?;

        let amount = request.total();
        let payment_id = ctx
            .participants
            .payment
            .process_payment(order_id, amount, &request.payment_method, ctx.saga_id)
            .await?;

        Ok(json!({ "paymentId": payment_id, "orderId": order_id, "amount": amount }))
    })
}

fn refund_payment<'a>(
    ctx: &'a StepContext,
    data: &'a serde_json::Value,
) -> BoxFuture<'a, Result<(), SagaError>> {
    Box::pin(async move {
        let payment_id = uuid_from(data, "paymentId")?;
        ctx.participants
            .payment
            .refund_payment(payment_id, ctx.saga_id)
            .await?;
        Ok(())
    })
}

fn confirm_order(ctx: &StepContext) -> BoxFuture<'_, Result<serde_json::Value, SagaError>> {
    Box::pin(async move {
        let order_id = ctx
            .output("CreateOrder", "orderId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| SagaError::Serialization {
                reason: "CreateOrder output missing".to_string(),
            })?;

        let confirmed = ctx
            .participants
            .order
            .confirm_order(order_id, ctx.saga_id)
            .await?;
        Ok(json!({ "confirmed": confirmed, "orderId": order_id }))
    })
}
