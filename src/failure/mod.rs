//! Controlled failure injector: policy-driven typed faults raised inside
//! participant calls, used for resilience tests and chaos exercises.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::metrics;
use crate::saga::{FailureKind, SagaError};

/// Multiplier applied when the call targets a critical product or store
const CRITICAL_BOOST: f64 = 3.0;

/// Live-updatable failure policy. Probabilities are clamped to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureConfig {
    pub enabled: bool,
    pub insufficient_stock_probability: f64,
    pub payment_failure_probability: f64,
    pub network_timeout_probability: f64,
    pub database_failure_probability: f64,
    pub service_unavailable_probability: f64,
    pub failure_delay_ms: u64,
    pub critical_products: HashSet<String>,
    pub critical_stores: HashSet<String>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            insufficient_stock_probability: 0.0,
            payment_failure_probability: 0.0,
            network_timeout_probability: 0.0,
            database_failure_probability: 0.0,
            service_unavailable_probability: 0.0,
            failure_delay_ms: 0,
            critical_products: HashSet::new(),
            critical_stores: HashSet::new(),
        }
    }
}

impl FailureConfig {
    pub fn probability(&self, kind: FailureKind) -> f64 {
        match kind {
            FailureKind::InsufficientStock => self.insufficient_stock_probability,
            FailureKind::PaymentFailure => self.payment_failure_probability,
            FailureKind::NetworkTimeout => self.network_timeout_probability,
            FailureKind::DatabaseFailure => self.database_failure_probability,
            FailureKind::ServiceUnavailable => self.service_unavailable_probability,
        }
    }

    fn clamp(mut self) -> Self {
        for p in [
            &mut self.insufficient_stock_probability,
            &mut self.payment_failure_probability,
            &mut self.network_timeout_probability,
            &mut self.database_failure_probability,
            &mut self.service_unavailable_probability,
        ] {
            *p = p.clamp(0.0, 1.0);
        }
        self
    }
}

/// Partial update applied atomically onto the current configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureConfigUpdate {
    pub enabled: Option<bool>,
    pub insufficient_stock_probability: Option<f64>,
    pub payment_failure_probability: Option<f64>,
    pub network_timeout_probability: Option<f64>,
    pub database_failure_probability: Option<f64>,
    pub service_unavailable_probability: Option<f64>,
    pub failure_delay_ms: Option<u64>,
    pub critical_products: Option<HashSet<String>>,
    pub critical_stores: Option<HashSet<String>>,
}

impl FailureConfigUpdate {
    fn apply(self, base: &FailureConfig) -> FailureConfig {
        FailureConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            insufficient_stock_probability: self
                .insufficient_stock_probability
                .unwrap_or(base.insufficient_stock_probability),
            payment_failure_probability: self
                .payment_failure_probability
                .unwrap_or(base.payment_failure_probability),
            network_timeout_probability: self
                .network_timeout_probability
                .unwrap_or(base.network_timeout_probability),
            database_failure_probability: self
                .database_failure_probability
                .unwrap_or(base.database_failure_probability),
            service_unavailable_probability: self
                .service_unavailable_probability
                .unwrap_or(base.service_unavailable_probability),
            failure_delay_ms: self.failure_delay_ms.unwrap_or(base.failure_delay_ms),
            critical_products: self
                .critical_products
                .unwrap_or_else(|| base.critical_products.clone()),
            critical_stores: self
                .critical_stores
                .unwrap_or_else(|| base.critical_stores.clone()),
        }
        .clamp()
    }
}

/// Call-site context used for probability boosting and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
}

impl FailureContext {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            product_name: None,
            store_id: None,
        }
    }

    pub fn with_product(mut self, product_name: impl Into<String>) -> Self {
        self.product_name = Some(product_name.into());
        self
    }

    pub fn with_store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }
}

/// Typed failure raised by the injector at a participant decision point
#[derive(Debug, Clone)]
pub struct FailureError {
    pub kind: FailureKind,
    pub message: String,
    pub context: FailureContext,
}

impl From<FailureError> for SagaError {
    fn from(err: FailureError) -> Self {
        SagaError::StepFailure {
            kind: err.kind,
            service: err.context.service,
            message: err.message,
        }
    }
}

/// Process-wide fault source. Readers take a lock-free-ish snapshot per call;
/// updates swap the whole configuration under a single writer.
pub struct FailureInjector {
    config: RwLock<Arc<FailureConfig>>,
}

impl FailureInjector {
    pub fn new(config: FailureConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config.clamp())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(FailureConfig::default())
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> Arc<FailureConfig> {
        self.config.read().expect("failure config lock poisoned").clone()
    }

    /// Apply a partial update with a copy-on-write swap; observable by the
    /// next `maybe_fail` call.
    pub fn update(&self, update: FailureConfigUpdate) -> Arc<FailureConfig> {
        let mut guard = self.config.write().expect("failure config lock poisoned");
        let next = Arc::new(update.apply(&guard));
        *guard = next.clone();
        next
    }

    pub fn toggle(&self, enabled: bool) -> Arc<FailureConfig> {
        self.update(FailureConfigUpdate {
            enabled: Some(enabled),
            ..Default::default()
        })
    }

    fn effective_probability(config: &FailureConfig, kind: FailureKind, context: &FailureContext) -> f64 {
        let mut p = config.probability(kind);
        let critical_product = context
            .product_name
            .as_ref()
            .is_some_and(|p| config.critical_products.contains(p));
        let critical_store = context
            .store_id
            .as_ref()
            .is_some_and(|s| config.critical_stores.contains(s));
        if critical_product || critical_store {
            p = (p * CRITICAL_BOOST).min(1.0);
        }
        p
    }

    /// Probabilistically raise a typed failure. Participants call this at
    /// their decision points (stock check, payment charge, DB write, service
    /// call).
    pub async fn maybe_fail(
        &self,
        kind: FailureKind,
        context: &FailureContext,
    ) -> Result<(), FailureError> {
        let config = self.current();
        if !config.enabled {
            return Ok(());
        }

        let p = Self::effective_probability(&config, kind, context);
        let triggered = {
            // rng must not be held across an await point
            let mut rng = rand::thread_rng();
            rng.gen::<f64>() < p
        };
        if !triggered {
            return Ok(());
        }

        if config.failure_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(config.failure_delay_ms)).await;
        }

        metrics::controlled_failure(kind, &context.service);
        warn!(
            failure_type = kind.as_str(),
            service = %context.service,
            product = context.product_name.as_deref().unwrap_or("-"),
            store = context.store_id.as_deref().unwrap_or("-"),
            "controlled failure triggered"
        );

        Err(FailureError {
            kind,
            message: format!("simulated {kind} in {}", context.service),
            context: context.clone(),
        })
    }

    /// Run `trials` draws for a failure kind and report how many would have
    /// triggered. Ignores the enabled flag and never sleeps; meant for test
    /// harnesses probing the configured probabilities.
    pub fn simulate(&self, kind: FailureKind, context: &FailureContext, trials: u32) -> u32 {
        let config = self.current();
        let p = Self::effective_probability(&config, kind, context);
        let mut rng = rand::thread_rng();
        (0..trials).filter(|_| rng.gen::<f64>() < p).count() as u32
    }
}
