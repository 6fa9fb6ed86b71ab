//! Request and response models for the saga engine's public surface.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::participants::SaleItem;
use crate::saga::SagaError;

/// One requested line item
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaleItemRequest {
    #[validate(length(min = 1, message = "product name must not be empty"))]
    pub product_name: String,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: u32,
    #[validate(range(min = 0.0, message = "unit price must not be negative"))]
    pub unit_price: f64,
}

impl From<&SaleItemRequest> for SaleItem {
    fn from(req: &SaleItemRequest) -> Self {
        SaleItem {
            product_name: req.product_name.clone(),
            quantity: req.quantity,
            unit_price: req.unit_price,
        }
    }
}

/// Start a sale saga
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSaleRequest {
    #[validate(length(min = 1, message = "store id must not be empty"))]
    pub store_id: String,
    #[validate(length(min = 1, message = "at least one item is required"), nested)]
    pub items: Vec<SaleItemRequest>,
}

impl CreateSaleRequest {
    pub fn items(&self) -> Vec<SaleItem> {
        self.items.iter().map(SaleItem::from).collect()
    }
}

/// Start an order saga
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "customer id must not be empty"))]
    pub customer_id: String,
    #[validate(length(min = 1, message = "store id must not be empty"))]
    pub store_id: String,
    #[validate(length(min = 1, message = "at least one item is required"), nested)]
    pub items: Vec<SaleItemRequest>,
    #[validate(length(min = 1, message = "payment method must not be empty"))]
    pub payment_method: String,
}

impl CreateOrderRequest {
    pub fn items(&self) -> Vec<SaleItem> {
        self.items.iter().map(SaleItem::from).collect()
    }

    pub fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|i| i.quantity as f64 * i.unit_price)
            .sum()
    }
}

/// Requested stock mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockOperation {
    Add,
    Remove,
    Set,
}

impl std::fmt::Display for StockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StockOperation::Add => "add",
            StockOperation::Remove => "remove",
            StockOperation::Set => "set",
        };
        f.write_str(s)
    }
}

/// Start a stock update saga
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StockUpdateRequest {
    #[validate(length(min = 1, message = "product name must not be empty"))]
    pub product_name: String,
    #[validate(length(min = 1, message = "store id must not be empty"))]
    pub store_id: String,
    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: u32,
    pub operation: StockOperation,
}

/// Run request validation, converting the first violation into the engine's
/// validation error so no saga is created for malformed input.
pub fn validate_request<T: Validate>(request: &T) -> Result<(), SagaError> {
    request.validate().map_err(|errors| {
        let detail = errors
            .field_errors()
            .into_iter()
            .next()
            .map(|(field, errs)| {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "invalid value".to_string());
                (field.to_string(), message)
            });
        match detail {
            Some((field, message)) => SagaError::Validation { field, message },
            None => SagaError::Validation {
                field: "request".to_string(),
                message: errors.to_string(),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sale_request() -> CreateSaleRequest {
        CreateSaleRequest {
            store_id: "S1".to_string(),
            items: vec![SaleItemRequest {
                product_name: "Milk".to_string(),
                quantity: 2,
                unit_price: 3.99,
            }],
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_request(&sale_request()).is_ok());
    }

    #[test]
    fn test_empty_items_are_rejected() {
        let request = CreateSaleRequest {
            store_id: "S1".to_string(),
            items: vec![],
        };
        let err = validate_request(&request).unwrap_err();
        assert!(matches!(err, SagaError::Validation { field, .. } if field == "items"));
    }

    #[test]
    fn test_zero_quantity_is_rejected() {
        let mut request = sale_request();
        request.items[0].quantity = 0;
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn test_request_accepts_camel_case_wire_format() {
        let request: CreateOrderRequest = serde_json::from_value(serde_json::json!({
            "customerId": "C1",
            "storeId": "S1",
            "items": [{ "productName": "Milk", "quantity": 1, "unitPrice": 2.5 }],
            "paymentMethod": "card"
        }))
        .unwrap();
        assert_eq!(request.customer_id, "C1");
        assert_eq!(request.items[0].product_name, "Milk");
        assert!((request.total() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_stock_operation_wire_format() {
        let op: StockOperation = serde_json::from_str("\"remove\"").unwrap();
        assert_eq!(op, StockOperation::Remove);
        assert_eq!(serde_json::to_string(&StockOperation::Add).unwrap(), "\"add\"");
    }
}
