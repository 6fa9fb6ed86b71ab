//! HTTP-backed participant clients for deployments where participants are
//! remote services. Timeouts surface as `NetworkTimeout` step failures so
//! compensation proceeds exactly as for an in-process timeout.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::{
    OrderService, PaymentService, ProductService, SaleItem, SaleService, Store, StoreService,
};
use crate::saga::{FailureKind, SagaError};

const SAGA_ID_HEADER: &str = "X-Saga-ID";

/// Base URLs for the remote participant services
#[derive(Debug, Clone)]
pub struct ParticipantEndpoints {
    pub product_url: String,
    pub store_url: String,
    pub sale_url: String,
    pub order_url: String,
    pub payment_url: String,
    pub timeout: Duration,
}

/// Shared HTTP plumbing for every remote participant call
#[derive(Clone)]
pub struct HttpParticipants {
    client: reqwest::Client,
    endpoints: ParticipantEndpoints,
}

impl HttpParticipants {
    pub fn new(endpoints: ParticipantEndpoints) -> Result<Self, SagaError> {
        let client = reqwest::Client::builder()
            .timeout(endpoints.timeout)
            .build()
            .map_err(|e| SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: "http-client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { client, endpoints })
    }

    fn map_error(service: &str, err: reqwest::Error) -> SagaError {
        let kind = if err.is_timeout() {
            FailureKind::NetworkTimeout
        } else {
            FailureKind::ServiceUnavailable
        };
        SagaError::StepFailure {
            kind,
            service: service.to_string(),
            message: err.to_string(),
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: String,
        saga_id: Uuid,
        body: serde_json::Value,
    ) -> Result<T, SagaError> {
        let response = self
            .client
            .post(&url)
            .header(SAGA_ID_HEADER, saga_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_error(service, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: service.to_string(),
                message: format!("{url} returned {status}: {detail}"),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Self::map_error(service, e))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: String,
        saga_id: Uuid,
    ) -> Result<Option<T>, SagaError> {
        let response = self
            .client
            .get(&url)
            .header(SAGA_ID_HEADER, saga_id.to_string())
            .send()
            .await
            .map_err(|e| Self::map_error(service, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: service.to_string(),
                message: format!("{url} returned {status}"),
            });
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| Self::map_error(service, e))
    }
}

#[async_trait]
impl ProductService for HttpParticipants {
    async fn validate_stock_availability(
        &self,
        product_name: &str,
        store_id: &str,
        quantity: u32,
        saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/stock/validate", self.endpoints.product_url);
        let body = json!({
            "productName": product_name,
            "storeId": store_id,
            "quantity": quantity,
        });
        let result: serde_json::Value = self
            .post_json("product-service", url, saga_id, body)
            .await?;
        Ok(result["available"].as_bool().unwrap_or(false))
    }

    async fn update_stock(
        &self,
        product_name: &str,
        store_id: &str,
        delta: i64,
        saga_id: Uuid,
        step_name: &str,
    ) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/stock/update", self.endpoints.product_url);
        let body = json!({
            "productName": product_name,
            "storeId": store_id,
            "delta": delta,
            "stepName": step_name,
        });
        let result: serde_json::Value = self
            .post_json("product-service", url, saga_id, body)
            .await?;
        Ok(result["applied"].as_bool().unwrap_or(true))
    }

    async fn get_stock(&self, product_name: &str, store_id: &str) -> Result<Option<i64>, SagaError> {
        let url = format!(
            "{}/api/v1/stock/{store_id}/{product_name}",
            self.endpoints.product_url
        );
        let result: Option<serde_json::Value> = self
            .get_json("product-service", url, Uuid::nil())
            .await?;
        Ok(result.and_then(|v| v["quantity"].as_i64()))
    }

    async fn confirm_stock(
        &self,
        store_id: &str,
        items: &[SaleItem],
        saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/stock/confirm", self.endpoints.product_url);
        let body = json!({ "storeId": store_id, "items": items });
        let result: serde_json::Value = self
            .post_json("product-service", url, saga_id, body)
            .await?;
        Ok(result["confirmed"].as_bool().unwrap_or(true))
    }
}

#[async_trait]
impl StoreService for HttpParticipants {
    async fn get_store_by_id(
        &self,
        store_id: &str,
        saga_id: Uuid,
    ) -> Result<Option<Store>, SagaError> {
        let url = format!("{}/api/v1/stores/{store_id}", self.endpoints.store_url);
        self.get_json("store-service", url, saga_id).await
    }
}

#[async_trait]
impl SaleService for HttpParticipants {
    async fn validate_sale_items(
        &self,
        items: &[SaleItem],
        store_id: &str,
        saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/sales/validate", self.endpoints.sale_url);
        let body = json!({ "storeId": store_id, "items": items });
        let result: serde_json::Value = self.post_json("sale-service", url, saga_id, body).await?;
        Ok(result["valid"].as_bool().unwrap_or(false))
    }

    async fn calculate_sale_total(
        &self,
        items: &[SaleItem],
        store_id: &str,
        saga_id: Uuid,
    ) -> Result<f64, SagaError> {
        let url = format!("{}/api/v1/sales/total", self.endpoints.sale_url);
        let body = json!({ "storeId": store_id, "items": items });
        let result: serde_json::Value = self.post_json("sale-service", url, saga_id, body).await?;
        result["total"].as_f64().ok_or_else(|| SagaError::StepFailure {
            kind: FailureKind::ServiceUnavailable,
            service: "sale-service".to_string(),
            message: "total missing from response".to_string(),
        })
    }

    async fn create_sale(
        &self,
        store_id: &str,
        items: &[SaleItem],
        total: f64,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let url = format!("{}/api/v1/sales", self.endpoints.sale_url);
        let body = json!({ "storeId": store_id, "items": items, "total": total });
        let result: serde_json::Value = self.post_json("sale-service", url, saga_id, body).await?;
        result["saleId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: "sale-service".to_string(),
                message: "saleId missing from response".to_string(),
            })
    }

    async fn cancel_sale(&self, sale_id: Uuid, store_id: &str) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/sales/{sale_id}/cancel", self.endpoints.sale_url);
        let body = json!({ "storeId": store_id });
        let result: serde_json::Value = self
            .post_json("sale-service", url, Uuid::nil(), body)
            .await?;
        Ok(result["cancelled"].as_bool().unwrap_or(true))
    }
}

#[async_trait]
impl OrderService for HttpParticipants {
    async fn create_order(
        &self,
        customer_id: &str,
        store_id: &str,
        items: &[SaleItem],
        payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let url = format!("{}/api/v1/orders", self.endpoints.order_url);
        let body = json!({
            "customerId": customer_id,
            "storeId": store_id,
            "items": items,
            "paymentMethod": payment_method,
        });
        let result: serde_json::Value = self.post_json("order-service", url, saga_id, body).await?;
        result["orderId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: "order-service".to_string(),
                message: "orderId missing from response".to_string(),
            })
    }

    async fn confirm_order(&self, order_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/orders/{order_id}/confirm", self.endpoints.order_url);
        let result: serde_json::Value = self
            .post_json("order-service", url, saga_id, json!({}))
            .await?;
        Ok(result["confirmed"].as_bool().unwrap_or(true))
    }

    async fn cancel_order(&self, order_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError> {
        let url = format!("{}/api/v1/orders/{order_id}/cancel", self.endpoints.order_url);
        let result: serde_json::Value = self
            .post_json("order-service", url, saga_id, json!({}))
            .await?;
        Ok(result["cancelled"].as_bool().unwrap_or(true))
    }
}

#[async_trait]
impl PaymentService for HttpParticipants {
    async fn process_payment(
        &self,
        order_id: Uuid,
        amount: f64,
        payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let url = format!("{}/api/v1/payments", self.endpoints.payment_url);
        let body = json!({
            "orderId": order_id,
            "amount": amount,
            "paymentMethod": payment_method,
        });
        let result: serde_json::Value = self
            .post_json("payment-service", url, saga_id, body)
            .await?;
        result["paymentId"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| SagaError::StepFailure {
                kind: FailureKind::PaymentFailure,
                service: "payment-service".to_string(),
                message: "paymentId missing from response".to_string(),
            })
    }

    async fn refund_payment(&self, payment_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError> {
        let url = format!(
            "{}/api/v1/payments/{payment_id}/refund",
            self.endpoints.payment_url
        );
        let result: serde_json::Value = self
            .post_json("payment-service", url, saga_id, json!({}))
            .await?;
        Ok(result["refunded"].as_bool().unwrap_or(true))
    }
}
