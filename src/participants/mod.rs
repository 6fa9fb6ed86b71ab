//! Participant contracts invoked by the orchestrated saga engine.
//!
//! Participants are external collaborators; the engine only depends on these
//! traits. Every call carries the saga id so participants can implement the
//! idempotency the contracts require, and consults the failure injector at
//! its decision points.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::saga::SagaError;

pub use memory::{
    InMemoryOrders, InMemoryPayments, InMemoryProducts, InMemorySales, InMemoryStores,
};

/// Store entity as seen by the saga engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub store_id: String,
    pub name: String,
}

/// One line of a sale or order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl SaleItem {
    pub fn line_total(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub sale_id: Uuid,
    pub store_id: String,
    pub items: Vec<SaleItem>,
    pub total: f64,
    pub status: SaleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: Uuid,
    pub customer_id: String,
    pub store_id: String,
    pub items: Vec<SaleItem>,
    pub payment_method: String,
    pub status: OrderStatus,
}

/// Product/stock participant
#[async_trait]
pub trait ProductService: Send + Sync {
    /// Whether the store can satisfy the requested quantity
    async fn validate_stock_availability(
        &self,
        product_name: &str,
        store_id: &str,
        quantity: u32,
        saga_id: Uuid,
    ) -> Result<bool, SagaError>;

    /// Apply a stock delta (negative reserves, positive releases). Must be
    /// idempotent per `(saga_id, step_name)`.
    async fn update_stock(
        &self,
        product_name: &str,
        store_id: &str,
        delta: i64,
        saga_id: Uuid,
        step_name: &str,
    ) -> Result<bool, SagaError>;

    async fn get_stock(&self, product_name: &str, store_id: &str) -> Result<Option<i64>, SagaError>;

    /// Finalize a reservation once the business transaction is committed
    async fn confirm_stock(
        &self,
        store_id: &str,
        items: &[SaleItem],
        saga_id: Uuid,
    ) -> Result<bool, SagaError>;
}

/// Store lookup participant
#[async_trait]
pub trait StoreService: Send + Sync {
    async fn get_store_by_id(&self, store_id: &str, saga_id: Uuid)
        -> Result<Option<Store>, SagaError>;
}

/// Sale participant
#[async_trait]
pub trait SaleService: Send + Sync {
    async fn validate_sale_items(
        &self,
        items: &[SaleItem],
        store_id: &str,
        saga_id: Uuid,
    ) -> Result<bool, SagaError>;

    async fn calculate_sale_total(
        &self,
        items: &[SaleItem],
        store_id: &str,
        saga_id: Uuid,
    ) -> Result<f64, SagaError>;

    /// Create the sale. Must be idempotent per `saga_id` via deduplication.
    async fn create_sale(
        &self,
        store_id: &str,
        items: &[SaleItem],
        total: f64,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError>;

    /// Compensation: cancel a previously created sale
    async fn cancel_sale(&self, sale_id: Uuid, store_id: &str) -> Result<bool, SagaError>;
}

/// Order participant
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Create the order. Idempotent per `saga_id`.
    async fn create_order(
        &self,
        customer_id: &str,
        store_id: &str,
        items: &[SaleItem],
        payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError>;

    async fn confirm_order(&self, order_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError>;

    /// Compensation: cancel a previously created order
    async fn cancel_order(&self, order_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError>;
}

/// Payment participant
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charge for an order. Idempotent per `saga_id`.
    async fn process_payment(
        &self,
        order_id: Uuid,
        amount: f64,
        payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError>;

    /// Compensation: refund a previously processed payment
    async fn refund_payment(&self, payment_id: Uuid, saga_id: Uuid) -> Result<bool, SagaError>;
}

/// The full participant wiring handed to saga steps
#[derive(Clone)]
pub struct ParticipantSet {
    pub product: Arc<dyn ProductService>,
    pub store: Arc<dyn StoreService>,
    pub sale: Arc<dyn SaleService>,
    pub order: Arc<dyn OrderService>,
    pub payment: Arc<dyn PaymentService>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_total() {
        let item = SaleItem {
            product_name: "Milk".to_string(),
            quantity: 2,
            unit_price: 3.99,
        };
        assert!((item.line_total() - 7.98).abs() < 1e-9);
    }
}
