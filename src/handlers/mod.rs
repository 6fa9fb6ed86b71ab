//! Administrative HTTP surface for the saga engine.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::choreography::ChoreographyCoordinator;
use crate::coordinator::SagaCoordinator;
use crate::failure::{FailureConfigUpdate, FailureContext, FailureInjector};
use crate::models::{CreateOrderRequest, CreateSaleRequest, StockUpdateRequest};
use crate::saga::{FailureKind, SagaError, SagaState};
use crate::store::SagaStore;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SagaCoordinator>,
    pub choreography: Arc<ChoreographyCoordinator>,
    pub store: Arc<dyn SagaStore>,
    pub injector: Arc<FailureInjector>,
    pub metrics_handle: PrometheusHandle,
}

/// Error envelope returned for every failing request
struct ApiError(SagaError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SagaError::Validation { .. } => StatusCode::BAD_REQUEST,
            SagaError::NotFound { .. } => StatusCode::NOT_FOUND,
            SagaError::IllegalState { .. } | SagaError::AlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            SagaError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.to_string(),
            "category": self.0.category(),
        }));
        (status, body).into_response()
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        Self(err)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/saga", get(list_sagas))
        .route("/saga/sale", post(start_sale_saga))
        .route("/saga/order", post(start_order_saga))
        .route("/saga/stock", post(start_stock_saga))
        .route("/saga/compensate/:saga_id", post(compensate_saga))
        .route("/saga/by-state/:state", get(sagas_by_state))
        .route("/saga/:saga_id", get(get_saga))
        .route("/saga/:saga_id/transitions", get(get_transitions))
        .route("/failure-config", get(get_failure_config).put(update_failure_config))
        .route("/failure-config/toggle", post(toggle_failure_config))
        .route("/failure-config/simulate", post(simulate_failures))
        .route("/metrics", get(metrics_exposition))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "saga-service",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn list_sagas(State(state): State<AppState>) -> Result<Response, ApiError> {
    let sagas = state.store.get_all().await?;
    Ok(Json(sagas).into_response())
}

async fn get_saga(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let record = state
        .store
        .get(saga_id)
        .await?
        .ok_or(SagaError::NotFound { saga_id })?;
    Ok(Json(record).into_response())
}

async fn get_transitions(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let transitions = state.store.get_transitions(saga_id).await?;
    Ok(Json(transitions).into_response())
}

async fn sagas_by_state(
    State(state): State<AppState>,
    Path(raw_state): Path<String>,
) -> Result<Response, ApiError> {
    let saga_state: SagaState = raw_state.parse().map_err(|_| SagaError::Validation {
        field: "state".to_string(),
        message: format!("unknown saga state {raw_state}"),
    })?;
    let sagas = state.store.get_by_state(saga_state).await?;
    Ok(Json(sagas).into_response())
}

async fn start_sale_saga(
    State(state): State<AppState>,
    Json(request): Json<CreateSaleRequest>,
) -> Result<Response, ApiError> {
    let result = state.coordinator.execute_sale_saga(request).await?;
    Ok(Json(result).into_response())
}

async fn start_order_saga(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, ApiError> {
    let result = state.coordinator.execute_order_saga(request).await?;
    Ok(Json(result).into_response())
}

async fn start_stock_saga(
    State(state): State<AppState>,
    Json(request): Json<StockUpdateRequest>,
) -> Result<Response, ApiError> {
    let result = state.coordinator.execute_stock_update_saga(request).await?;
    Ok(Json(result).into_response())
}

async fn compensate_saga(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let result = state.coordinator.compensate_saga(saga_id).await?;
    Ok(Json(result).into_response())
}

async fn get_failure_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(&*state.injector.current()).unwrap_or_default())
}

async fn update_failure_config(
    State(state): State<AppState>,
    Json(update): Json<FailureConfigUpdate>,
) -> Json<serde_json::Value> {
    let updated = state.injector.update(update);
    Json(serde_json::to_value(&*updated).unwrap_or_default())
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_failure_config(
    State(state): State<AppState>,
    Json(request): Json<ToggleRequest>,
) -> Json<serde_json::Value> {
    let updated = state.injector.toggle(request.enabled);
    Json(serde_json::to_value(&*updated).unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateRequest {
    failure_type: String,
    #[serde(default = "default_trials")]
    trials: u32,
    product_name: Option<String>,
    store_id: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

fn default_trials() -> u32 {
    100
}

async fn simulate_failures(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Response, ApiError> {
    let kind: FailureKind = request.failure_type.parse().map_err(|_| SagaError::Validation {
        field: "failureType".to_string(),
        message: format!("unknown failure type {}", request.failure_type),
    })?;

    let mut context =
        FailureContext::new(request.service.unwrap_or_else(|| "simulation".to_string()));
    if let Some(product) = request.product_name {
        context = context.with_product(product);
    }
    if let Some(store) = request.store_id {
        context = context.with_store(store);
    }

    let triggered = state.injector.simulate(kind, &context, request.trials);
    Ok(Json(json!({
        "failureType": kind.as_str(),
        "trials": request.trials,
        "triggered": triggered,
    }))
    .into_response())
}

async fn metrics_exposition(State(state): State<AppState>) -> Response {
    state.metrics_handle.render().into_response()
}
