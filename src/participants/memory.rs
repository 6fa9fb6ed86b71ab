//! In-memory reference participants.
//!
//! Back the test suites, the demo deployment and chaos exercises. They honor
//! the same contracts remote participants must: idempotent stock deltas per
//! `(saga_id, step_name)`, sale/order/payment deduplication per `saga_id`,
//! and failure-injector consultation at every decision point.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Order, OrderService, OrderStatus, PaymentService, ProductService, Sale, SaleItem, SaleService,
    SaleStatus, Store, StoreService,
};
use crate::failure::{FailureContext, FailureInjector};
use crate::saga::{FailureKind, SagaError};

const PRODUCT_SERVICE: &str = "product-service";
const STORE_SERVICE: &str = "store-service";
const SALE_SERVICE: &str = "sale-service";
const ORDER_SERVICE: &str = "order-service";
const PAYMENT_SERVICE: &str = "payment-service";

/// In-memory stock ledger keyed by `(store_id, product_name)`
pub struct InMemoryProducts {
    injector: Arc<FailureInjector>,
    stock: RwLock<HashMap<(String, String), i64>>,
    applied_deltas: RwLock<HashSet<(Uuid, String, String)>>,
    confirmed: RwLock<HashSet<Uuid>>,
}

impl InMemoryProducts {
    pub fn new(injector: Arc<FailureInjector>) -> Self {
        Self {
            injector,
            stock: RwLock::new(HashMap::new()),
            applied_deltas: RwLock::new(HashSet::new()),
            confirmed: RwLock::new(HashSet::new()),
        }
    }

    pub async fn set_stock(&self, store_id: &str, product_name: &str, quantity: i64) {
        self.stock
            .write()
            .await
            .insert((store_id.to_string(), product_name.to_string()), quantity);
    }

    pub async fn stock_level(&self, store_id: &str, product_name: &str) -> i64 {
        self.stock
            .read()
            .await
            .get(&(store_id.to_string(), product_name.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProductService for InMemoryProducts {
    async fn validate_stock_availability(
        &self,
        product_name: &str,
        store_id: &str,
        quantity: u32,
        _saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        let context = FailureContext::new(PRODUCT_SERVICE)
            .with_product(product_name)
            .with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::InsufficientStock, &context)
            .await?;

        Ok(self.stock_level(store_id, product_name).await >= quantity as i64)
    }

    async fn update_stock(
        &self,
        product_name: &str,
        store_id: &str,
        delta: i64,
        saga_id: Uuid,
        step_name: &str,
    ) -> Result<bool, SagaError> {
        let context = FailureContext::new(PRODUCT_SERVICE)
            .with_product(product_name)
            .with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::DatabaseFailure, &context)
            .await?;

        let dedup_key = (saga_id, step_name.to_string(), product_name.to_string());
        {
            let applied = self.applied_deltas.read().await;
            if applied.contains(&dedup_key) {
                return Ok(true);
            }
        }

        let mut stock = self.stock.write().await;
        let entry = stock
            .entry((store_id.to_string(), product_name.to_string()))
            .or_insert(0);
        let next = *entry + delta;
        if next < 0 {
            return Err(SagaError::StepFailure {
                kind: FailureKind::InsufficientStock,
                service: PRODUCT_SERVICE.to_string(),
                message: format!(
                    "insufficient stock for {product_name} at {store_id}: have {}, requested {}",
                    *entry, -delta
                ),
            });
        }
        *entry = next;
        drop(stock);

        self.applied_deltas.write().await.insert(dedup_key);
        Ok(true)
    }

    async fn get_stock(&self, product_name: &str, store_id: &str) -> Result<Option<i64>, SagaError> {
        let stock = self.stock.read().await;
        Ok(stock
            .get(&(store_id.to_string(), product_name.to_string()))
            .copied())
    }

    async fn confirm_stock(
        &self,
        store_id: &str,
        items: &[SaleItem],
        saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        let context = FailureContext::new(PRODUCT_SERVICE).with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::NetworkTimeout, &context)
            .await?;

        let _ = items;
        self.confirmed.write().await.insert(saga_id);
        Ok(true)
    }
}

/// In-memory store registry
pub struct InMemoryStores {
    injector: Arc<FailureInjector>,
    stores: RwLock<HashMap<String, Store>>,
}

impl InMemoryStores {
    pub fn new(injector: Arc<FailureInjector>) -> Self {
        Self {
            injector,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_store(&self, store_id: &str, name: &str) {
        self.stores.write().await.insert(
            store_id.to_string(),
            Store {
                store_id: store_id.to_string(),
                name: name.to_string(),
            },
        );
    }
}

#[async_trait]
impl StoreService for InMemoryStores {
    async fn get_store_by_id(
        &self,
        store_id: &str,
        _saga_id: Uuid,
    ) -> Result<Option<Store>, SagaError> {
        let context = FailureContext::new(STORE_SERVICE).with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::ServiceUnavailable, &context)
            .await?;

        Ok(self.stores.read().await.get(store_id).cloned())
    }
}

/// In-memory sale book with per-saga deduplication
pub struct InMemorySales {
    injector: Arc<FailureInjector>,
    sales: RwLock<HashMap<Uuid, Sale>>,
    by_saga: RwLock<HashMap<Uuid, Uuid>>,
    fail_cancellations: AtomicBool,
}

impl InMemorySales {
    pub fn new(injector: Arc<FailureInjector>) -> Self {
        Self {
            injector,
            sales: RwLock::new(HashMap::new()),
            by_saga: RwLock::new(HashMap::new()),
            fail_cancellations: AtomicBool::new(false),
        }
    }

    /// Test lever: make `cancel_sale` fail until cleared.
    pub fn set_fail_cancellations(&self, fail: bool) {
        self.fail_cancellations.store(fail, Ordering::SeqCst);
    }

    pub async fn get_sale(&self, sale_id: Uuid) -> Option<Sale> {
        self.sales.read().await.get(&sale_id).cloned()
    }
}

#[async_trait]
impl SaleService for InMemorySales {
    async fn validate_sale_items(
        &self,
        items: &[SaleItem],
        _store_id: &str,
        _saga_id: Uuid,
    ) -> Result<bool, SagaError> {
        Ok(!items.is_empty()
            && items
                .iter()
                .all(|i| !i.product_name.is_empty() && i.quantity > 0 && i.unit_price >= 0.0))
    }

    async fn calculate_sale_total(
        &self,
        items: &[SaleItem],
        store_id: &str,
        _saga_id: Uuid,
    ) -> Result<f64, SagaError> {
        let context = FailureContext::new(SALE_SERVICE).with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::ServiceUnavailable, &context)
            .await?;

        Ok(items.iter().map(SaleItem::line_total).sum())
    }

    async fn create_sale(
        &self,
        store_id: &str,
        items: &[SaleItem],
        total: f64,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let context = FailureContext::new(SALE_SERVICE).with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::DatabaseFailure, &context)
            .await?;

        {
            let by_saga = self.by_saga.read().await;
            if let Some(existing) = by_saga.get(&saga_id) {
                return Ok(*existing);
            }
        }

        let sale = Sale {
            sale_id: Uuid::new_v4(),
            store_id: store_id.to_string(),
            items: items.to_vec(),
            total,
            status: SaleStatus::Active,
        };
        let sale_id = sale.sale_id;
        self.sales.write().await.insert(sale_id, sale);
        self.by_saga.write().await.insert(saga_id, sale_id);
        Ok(sale_id)
    }

    async fn cancel_sale(&self, sale_id: Uuid, _store_id: &str) -> Result<bool, SagaError> {
        if self.fail_cancellations.load(Ordering::SeqCst) {
            return Err(SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: SALE_SERVICE.to_string(),
                message: format!("cancellation rejected for sale {sale_id}"),
            });
        }

        let mut sales = self.sales.write().await;
        match sales.get_mut(&sale_id) {
            Some(sale) => {
                sale.status = SaleStatus::Cancelled;
                Ok(true)
            }
            // Already gone; cancelling is idempotent
            None => Ok(true),
        }
    }
}

/// In-memory order book with per-saga deduplication
pub struct InMemoryOrders {
    injector: Arc<FailureInjector>,
    orders: RwLock<HashMap<Uuid, Order>>,
    by_saga: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemoryOrders {
    pub fn new(injector: Arc<FailureInjector>) -> Self {
        Self {
            injector,
            orders: RwLock::new(HashMap::new()),
            by_saga: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&order_id).cloned()
    }
}

#[async_trait]
impl OrderService for InMemoryOrders {
    async fn create_order(
        &self,
        customer_id: &str,
        store_id: &str,
        items: &[SaleItem],
        payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let context = FailureContext::new(ORDER_SERVICE).with_store(store_id);
        self.injector
            .maybe_fail(FailureKind::DatabaseFailure, &context)
            .await?;

        {
            let by_saga = self.by_saga.read().await;
            if let Some(existing) = by_saga.get(&saga_id) {
                return Ok(*existing);
            }
        }

        let order = Order {
            order_id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            store_id: store_id.to_string(),
            items: items.to_vec(),
            payment_method: payment_method.to_string(),
            status: OrderStatus::Pending,
        };
        let order_id = order.order_id;
        self.orders.write().await.insert(order_id, order);
        self.by_saga.write().await.insert(saga_id, order_id);
        Ok(order_id)
    }

    async fn confirm_order(&self, order_id: Uuid, _saga_id: Uuid) -> Result<bool, SagaError> {
        let context = FailureContext::new(ORDER_SERVICE);
        self.injector
            .maybe_fail(FailureKind::ServiceUnavailable, &context)
            .await?;

        let mut orders = self.orders.write().await;
        match orders.get_mut(&order_id) {
            Some(order) => {
                order.status = OrderStatus::Confirmed;
                Ok(true)
            }
            None => Err(SagaError::StepFailure {
                kind: FailureKind::ServiceUnavailable,
                service: ORDER_SERVICE.to_string(),
                message: format!("order {order_id} not found"),
            }),
        }
    }

    async fn cancel_order(&self, order_id: Uuid, _saga_id: Uuid) -> Result<bool, SagaError> {
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.get_mut(&order_id) {
            order.status = OrderStatus::Cancelled;
        }
        Ok(true)
    }
}

/// Recorded charge
#[derive(Debug, Clone)]
pub struct PaymentEntry {
    pub order_id: Uuid,
    pub amount: f64,
    pub refunded: bool,
}

/// In-memory payment book with per-saga deduplication
pub struct InMemoryPayments {
    injector: Arc<FailureInjector>,
    payments: RwLock<HashMap<Uuid, PaymentEntry>>,
    by_saga: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemoryPayments {
    pub fn new(injector: Arc<FailureInjector>) -> Self {
        Self {
            injector,
            payments: RwLock::new(HashMap::new()),
            by_saga: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_refunded(&self, payment_id: Uuid) -> bool {
        self.payments
            .read()
            .await
            .get(&payment_id)
            .map(|p| p.refunded)
            .unwrap_or(false)
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> Option<PaymentEntry> {
        self.payments.read().await.get(&payment_id).cloned()
    }
}

#[async_trait]
impl PaymentService for InMemoryPayments {
    async fn process_payment(
        &self,
        order_id: Uuid,
        amount: f64,
        _payment_method: &str,
        saga_id: Uuid,
    ) -> Result<Uuid, SagaError> {
        let context = FailureContext::new(PAYMENT_SERVICE);
        self.injector
            .maybe_fail(FailureKind::PaymentFailure, &context)
            .await?;

        if amount < 0.0 {
            return Err(SagaError::StepFailure {
                kind: FailureKind::PaymentFailure,
                service: PAYMENT_SERVICE.to_string(),
                message: format!("invalid amount {amount} for order {order_id}"),
            });
        }

        {
            let by_saga = self.by_saga.read().await;
            if let Some(existing) = by_saga.get(&saga_id) {
                return Ok(*existing);
            }
        }

        let payment_id = Uuid::new_v4();
        self.payments.write().await.insert(
            payment_id,
            PaymentEntry {
                order_id,
                amount,
                refunded: false,
            },
        );
        self.by_saga.write().await.insert(saga_id, payment_id);
        Ok(payment_id)
    }

    async fn refund_payment(&self, payment_id: Uuid, _saga_id: Uuid) -> Result<bool, SagaError> {
        let mut payments = self.payments.write().await;
        match payments.get_mut(&payment_id) {
            Some(entry) => {
                entry.refunded = true;
                Ok(true)
            }
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> InMemoryProducts {
        InMemoryProducts::new(Arc::new(FailureInjector::disabled()))
    }

    #[tokio::test]
    async fn test_stock_update_is_idempotent_per_saga_step() {
        let svc = products();
        svc.set_stock("S1", "Milk", 10).await;
        let saga_id = Uuid::new_v4();

        svc.update_stock("Milk", "S1", -2, saga_id, "ReserveStock")
            .await
            .unwrap();
        // Redelivery of the same step applies nothing
        svc.update_stock("Milk", "S1", -2, saga_id, "ReserveStock")
            .await
            .unwrap();
        assert_eq!(svc.stock_level("S1", "Milk").await, 8);

        // A different step of the same saga does apply
        svc.update_stock("Milk", "S1", 2, saga_id, "ReleaseStock")
            .await
            .unwrap();
        assert_eq!(svc.stock_level("S1", "Milk").await, 10);
    }

    #[tokio::test]
    async fn test_stock_never_goes_negative() {
        let svc = products();
        svc.set_stock("S1", "Milk", 1).await;

        let err = svc
            .update_stock("Milk", "S1", -2, Uuid::new_v4(), "ReserveStock")
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::InsufficientStock));
        assert_eq!(svc.stock_level("S1", "Milk").await, 1);
    }

    #[tokio::test]
    async fn test_sale_creation_deduplicates_per_saga() {
        let svc = InMemorySales::new(Arc::new(FailureInjector::disabled()));
        let saga_id = Uuid::new_v4();
        let items = vec![SaleItem {
            product_name: "Milk".to_string(),
            quantity: 2,
            unit_price: 3.99,
        }];

        let first = svc.create_sale("S1", &items, 7.98, saga_id).await.unwrap();
        let second = svc.create_sale("S1", &items, 7.98, saga_id).await.unwrap();
        assert_eq!(first, second);

        let other = svc
            .create_sale("S1", &items, 7.98, Uuid::new_v4())
            .await
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_cancel_sale_is_idempotent() {
        let svc = InMemorySales::new(Arc::new(FailureInjector::disabled()));
        let saga_id = Uuid::new_v4();
        let sale_id = svc.create_sale("S1", &[], 0.0, saga_id).await.unwrap();

        assert!(svc.cancel_sale(sale_id, "S1").await.unwrap());
        assert!(svc.cancel_sale(sale_id, "S1").await.unwrap());
        assert_eq!(
            svc.get_sale(sale_id).await.unwrap().status,
            SaleStatus::Cancelled
        );
        // Unknown sales cancel cleanly too
        assert!(svc.cancel_sale(Uuid::new_v4(), "S1").await.unwrap());
    }

    #[tokio::test]
    async fn test_payment_refund_round_trip() {
        let svc = InMemoryPayments::new(Arc::new(FailureInjector::disabled()));
        let saga_id = Uuid::new_v4();

        let payment_id = svc
            .process_payment(Uuid::new_v4(), 25.0, "card", saga_id)
            .await
            .unwrap();
        assert!(!svc.is_refunded(payment_id).await);

        svc.refund_payment(payment_id, saga_id).await.unwrap();
        assert!(svc.is_refunded(payment_id).await);
    }
}
