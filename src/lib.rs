//! Saga orchestration service for distributed retail transactions.
//!
//! Two coordination styles share one state model, one event schema and one
//! compensation discipline: the orchestrated engine in [`coordinator`] drives
//! participants sequentially, while the observer in [`choreography`] follows
//! participant events on the bus. The engine itself is transport-agnostic;
//! [`handlers`] is just one host for it.

pub mod choreography;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod failure;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod participants;
pub mod saga;
pub mod store;
pub mod workflows;

pub use choreography::ChoreographyCoordinator;
pub use config::AppConfig;
pub use coordinator::{CoordinatorConfig, SagaCoordinator};
pub use handlers::AppState;
pub use saga::{SagaError, SagaRecord, SagaResult, SagaState, SagaType};

/// Helpers shared by the unit and integration test suites.
pub mod test_support {
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
    use std::sync::OnceLock;

    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

    /// A process-wide Prometheus handle that does not install a global
    /// recorder, so parallel test binaries never fight over it.
    pub fn metrics_handle() -> PrometheusHandle {
        HANDLE
            .get_or_init(|| PrometheusBuilder::new().build_recorder().handle())
            .clone()
    }
}
