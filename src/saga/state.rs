//! Saga state machine: states, per-type forward paths and legal edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Saga categories supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaType {
    Sale,
    Order,
    StockUpdate,
    ChoreographedOrder,
}

impl SagaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaType::Sale => "SaleSaga",
            SagaType::Order => "OrderSaga",
            SagaType::StockUpdate => "StockUpdateSaga",
            SagaType::ChoreographedOrder => "ChoreographedOrderSaga",
        }
    }
}

impl std::fmt::Display for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SaleSaga" | "Sale" => Ok(SagaType::Sale),
            "OrderSaga" | "Order" => Ok(SagaType::Order),
            "StockUpdateSaga" | "StockUpdate" => Ok(SagaType::StockUpdate),
            "ChoreographedOrderSaga" | "ChoreographedOrder" => Ok(SagaType::ChoreographedOrder),
            _ => Err(()),
        }
    }
}

/// Saga execution states. One enum is persisted for every saga type; the
/// per-type ordered forward path defines which of these a given saga visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    Started,
    StoreValidated,
    StockReserved,
    TotalCalculated,
    SaleCreated,
    StockConfirmed,
    Completed,
    Failed,
    Compensating,
    Compensated,
    InProgress,
    StockVerifying,
    StockVerified,
    StockReserving,
    PaymentProcessing,
    PaymentProcessed,
    OrderConfirming,
    Aborted,
}

impl SagaState {
    /// Terminal states: the record becomes immutable once reached.
    /// `Failed` is deliberately not terminal; a failed saga can be re-driven
    /// through `Compensating` by an operator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Aborted
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, SagaState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "Started",
            SagaState::StoreValidated => "StoreValidated",
            SagaState::StockReserved => "StockReserved",
            SagaState::TotalCalculated => "TotalCalculated",
            SagaState::SaleCreated => "SaleCreated",
            SagaState::StockConfirmed => "StockConfirmed",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
            SagaState::Compensating => "Compensating",
            SagaState::Compensated => "Compensated",
            SagaState::InProgress => "InProgress",
            SagaState::StockVerifying => "StockVerifying",
            SagaState::StockVerified => "StockVerified",
            SagaState::StockReserving => "StockReserving",
            SagaState::PaymentProcessing => "PaymentProcessing",
            SagaState::PaymentProcessed => "PaymentProcessed",
            SagaState::OrderConfirming => "OrderConfirming",
            SagaState::Aborted => "Aborted",
        }
    }

    pub const ALL: [SagaState; 18] = [
        SagaState::Started,
        SagaState::StoreValidated,
        SagaState::StockReserved,
        SagaState::TotalCalculated,
        SagaState::SaleCreated,
        SagaState::StockConfirmed,
        SagaState::Completed,
        SagaState::Failed,
        SagaState::Compensating,
        SagaState::Compensated,
        SagaState::InProgress,
        SagaState::StockVerifying,
        SagaState::StockVerified,
        SagaState::StockReserving,
        SagaState::PaymentProcessing,
        SagaState::PaymentProcessed,
        SagaState::OrderConfirming,
        SagaState::Aborted,
    ];
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or(())
    }
}

/// Ordered forward path for a saga type, from initial state to `Completed`.
pub fn forward_path(saga_type: SagaType) -> &'static [SagaState] {
    match saga_type {
        SagaType::Sale => &[
            SagaState::Started,
            SagaState::StoreValidated,
            SagaState::StockReserved,
            SagaState::TotalCalculated,
            SagaState::SaleCreated,
            SagaState::StockConfirmed,
            SagaState::Completed,
        ],
        SagaType::Order => &[
            SagaState::Started,
            SagaState::InProgress,
            SagaState::StockReserved,
            SagaState::PaymentProcessed,
            SagaState::StockConfirmed,
            SagaState::Completed,
        ],
        SagaType::StockUpdate => &[
            SagaState::Started,
            SagaState::StoreValidated,
            SagaState::StockVerified,
            SagaState::StockConfirmed,
            SagaState::Completed,
        ],
        SagaType::ChoreographedOrder => &[
            SagaState::InProgress,
            SagaState::StockReserved,
            SagaState::PaymentProcessed,
            SagaState::OrderConfirming,
            SagaState::Completed,
        ],
    }
}

/// Initial state for a saga of the given type.
pub fn initial_state(saga_type: SagaType) -> SagaState {
    forward_path(saga_type)[0]
}

/// Whether `(from, to)` is a legal edge for the given saga type.
///
/// Legal edges are:
/// - consecutive pairs of the type's forward path;
/// - a direct jump from the initial state to `Completed` (zero-step saga);
/// - any state except `Compensated` and `Aborted` into `Compensating`
///   (failure edges, operator-driven recovery from `Completed`, and re-drive
///   of a `Failed` saga);
/// - `Compensating -> Compensating` (one edge per compensation attempt);
/// - `Compensating -> Compensated` and `Compensating -> Failed`;
/// - any non-terminal state into `Failed` (engine fault edge);
/// - for choreographed sagas, any non-terminal state into `Aborted`.
pub fn is_legal_edge(saga_type: SagaType, from: SagaState, to: SagaState) -> bool {
    let path = forward_path(saga_type);
    if path.windows(2).any(|pair| pair[0] == from && pair[1] == to) {
        return true;
    }
    if from == path[0] && to == SagaState::Completed {
        return true;
    }
    match to {
        SagaState::Compensating => {
            !matches!(from, SagaState::Compensated | SagaState::Aborted)
        }
        SagaState::Compensated => from == SagaState::Compensating,
        SagaState::Failed => !from.is_terminal(),
        SagaState::Aborted => {
            saga_type == SagaType::ChoreographedOrder && !from.is_terminal()
        }
        _ => false,
    }
}

/// Classification of a transition for the persistent log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionEventType {
    Success,
    Failure,
    Compensation,
}

impl std::fmt::Display for TransitionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionEventType::Success => write!(f, "Success"),
            TransitionEventType::Failure => write!(f, "Failure"),
            TransitionEventType::Compensation => write!(f, "Compensation"),
        }
    }
}

/// Append-only record of one state change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaTransition {
    pub transition_id: Uuid,
    pub saga_id: Uuid,
    pub from_state: SagaState,
    pub to_state: SagaState,
    pub service_name: String,
    pub action: String,
    pub event_type: TransitionEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl SagaTransition {
    pub fn new(
        saga_id: Uuid,
        from_state: SagaState,
        to_state: SagaState,
        service_name: impl Into<String>,
        action: impl Into<String>,
        event_type: TransitionEventType,
    ) -> Self {
        Self {
            transition_id: Uuid::new_v4(),
            saga_id,
            from_state,
            to_state,
            service_name: service_name.into(),
            action: action.into(),
            event_type,
            message: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Clamp the timestamp so per-saga transition timestamps never go backwards.
    pub fn after(mut self, floor: Option<DateTime<Utc>>) -> Self {
        if let Some(floor) = floor {
            if self.timestamp < floor {
                self.timestamp = floor;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sale_forward_path_is_legal() {
        let path = forward_path(SagaType::Sale);
        for pair in path.windows(2) {
            assert!(
                is_legal_edge(SagaType::Sale, pair[0], pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_skipping_states_is_illegal() {
        assert!(!is_legal_edge(
            SagaType::Sale,
            SagaState::Started,
            SagaState::StockReserved
        ));
        assert!(!is_legal_edge(
            SagaType::Sale,
            SagaState::StoreValidated,
            SagaState::SaleCreated
        ));
    }

    #[test]
    fn test_failure_edges() {
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::StockReserved,
            SagaState::Compensating
        ));
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Compensating,
            SagaState::Compensated
        ));
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Compensating,
            SagaState::Failed
        ));
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Compensating,
            SagaState::Compensating
        ));
        // Terminal compensation states accept no further compensation
        assert!(!is_legal_edge(
            SagaType::Sale,
            SagaState::Compensated,
            SagaState::Compensating
        ));
    }

    #[test]
    fn test_operator_recovery_edge() {
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Completed,
            SagaState::Compensating
        ));
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Failed,
            SagaState::Compensating
        ));
    }

    #[test]
    fn test_zero_step_completion() {
        assert!(is_legal_edge(
            SagaType::Sale,
            SagaState::Started,
            SagaState::Completed
        ));
    }

    #[test]
    fn test_aborted_only_for_choreographed() {
        assert!(is_legal_edge(
            SagaType::ChoreographedOrder,
            SagaState::InProgress,
            SagaState::Aborted
        ));
        assert!(!is_legal_edge(
            SagaType::Sale,
            SagaState::Started,
            SagaState::Aborted
        ));
    }

    #[test]
    fn test_state_round_trip() {
        for state in SagaState::ALL {
            let parsed: SagaState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        const TYPES: [SagaType; 4] = [
            SagaType::Sale,
            SagaType::Order,
            SagaType::StockUpdate,
            SagaType::ChoreographedOrder,
        ];

        proptest! {
            // Any walk that follows the forward path and optionally fails at
            // some step stays inside the legal edge set.
            #[test]
            fn forward_walks_stay_legal(type_idx in 0usize..4, fail_at in proptest::option::of(0usize..8)) {
                let saga_type = TYPES[type_idx];
                let path = forward_path(saga_type);

                let mut edges = Vec::new();
                let mut prev = path[0];
                for (i, next) in path[1..].iter().enumerate() {
                    if fail_at == Some(i) {
                        edges.push((prev, SagaState::Compensating));
                        edges.push((SagaState::Compensating, SagaState::Compensated));
                        break;
                    }
                    edges.push((prev, *next));
                    prev = *next;
                }

                for (from, to) in edges {
                    prop_assert!(
                        is_legal_edge(saga_type, from, to),
                        "{from} -> {to} must be legal for {saga_type}"
                    );
                }
            }

            // Terminal compensation states accept no outgoing edges at all.
            #[test]
            fn settled_states_have_no_exits(type_idx in 0usize..4, from_idx in 0usize..2, to_idx in 0usize..18) {
                let saga_type = TYPES[type_idx];
                let from = [SagaState::Compensated, SagaState::Aborted][from_idx];
                let to = SagaState::ALL[to_idx];
                prop_assert!(!is_legal_edge(saga_type, from, to));
            }
        }
    }

    #[test]
    fn test_timestamp_clamping() {
        let floor = Utc::now() + chrono::Duration::seconds(30);
        let transition = SagaTransition::new(
            Uuid::new_v4(),
            SagaState::Started,
            SagaState::StoreValidated,
            "store-service",
            "ValidateStore",
            TransitionEventType::Success,
        )
        .after(Some(floor));

        assert!(transition.timestamp >= floor);
    }
}
