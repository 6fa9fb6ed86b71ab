//! Saga service host: wires the engine, the event bus, the state store and
//! the administrative HTTP surface together.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saga_service::choreography::ChoreographyCoordinator;
use saga_service::config::{AppConfig, EventsBackend, StoreBackend};
use saga_service::coordinator::SagaCoordinator;
use saga_service::events::{EventBus, InMemoryEventBus, RedisEventBus};
use saga_service::failure::{FailureConfig, FailureInjector};
use saga_service::handlers::{router, AppState};
use saga_service::participants::{
    InMemoryOrders, InMemoryPayments, InMemoryProducts, InMemorySales, InMemoryStores,
    ParticipantSet,
};
use saga_service::store::{InMemorySagaStore, SagaStore};
use saga_service::metrics;
use saga_service::workflows::TemplateRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting saga service...");

    let config = AppConfig::from_env();
    let metrics_handle = metrics::install_recorder()?;

    let store: Arc<dyn SagaStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemorySagaStore::new()),
        #[cfg(feature = "database-persistence")]
        StoreBackend::Postgres => {
            let db_config = saga_service::store::postgres::DatabaseConfig {
                connection_string: config.store.database_url.clone(),
                max_connections: config.store.max_connections,
                ..Default::default()
            };
            Arc::new(saga_service::store::PostgresSagaStore::connect(db_config).await?)
        }
        #[cfg(not(feature = "database-persistence"))]
        StoreBackend::Postgres => {
            error!("built without database-persistence; falling back to the in-memory store");
            Arc::new(InMemorySagaStore::new())
        }
    };

    let bus: Arc<dyn EventBus> = match config.events.backend {
        EventsBackend::Memory => Arc::new(InMemoryEventBus::new()),
        EventsBackend::Redis => match RedisEventBus::new(&config.events.redis_url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                error!("Redis event bus unavailable ({e}); falling back to the in-memory bus");
                Arc::new(InMemoryEventBus::new())
            }
        },
    };

    let injector = Arc::new(FailureInjector::new(FailureConfig::default()));
    let products = Arc::new(InMemoryProducts::new(injector.clone()));
    let stores = Arc::new(InMemoryStores::new(injector.clone()));
    if config.seed_demo_data {
        seed_demo_data(&products, &stores).await;
    }
    let participants = ParticipantSet {
        product: products,
        store: stores,
        sale: Arc::new(InMemorySales::new(injector.clone())),
        order: Arc::new(InMemoryOrders::new(injector.clone())),
        payment: Arc::new(InMemoryPayments::new(injector.clone())),
    };

    let coordinator = Arc::new(SagaCoordinator::new(
        store.clone(),
        bus.clone(),
        participants,
        Arc::new(TemplateRegistry::builtin()),
        config.coordinator.clone(),
    ));

    let choreography = Arc::new(ChoreographyCoordinator::new(store.clone(), bus.clone()));
    choreography.spawn(&config.events.consumer_group).await?;

    // Keep the sagas-in-state gauges fresh
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15));
            loop {
                ticker.tick().await;
                coordinator.refresh_state_gauges().await;
            }
        });
    }

    let state = AppState {
        coordinator,
        choreography,
        store,
        injector,
        metrics_handle,
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("saga service listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn seed_demo_data(products: &InMemoryProducts, stores: &InMemoryStores) {
    stores.add_store("S1", "Downtown").await;
    stores.add_store("S2", "Riverside").await;
    stores.add_store("S3", "Airport").await;
    for store in ["S1", "S2", "S3"] {
        products.set_stock(store, "Milk", 100).await;
        products.set_stock(store, "Bread", 80).await;
        products.set_stock(store, "Premium Coffee", 25).await;
    }
    info!("seeded demo stores and stock");
}
