//! Saga orchestrator: engine bootstrap and admin HTTP surface.
//!
//! The admin endpoints expose the distribution and resilience registries,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use distribution::{QueuePartitioningManager, SagaShardingManager, WorkerLoadBalancer};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::CircuitBreakerManager;
use saga::StepRegistry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use handlers::ProposalSaga;
use routes::admin::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/workers", get(routes::admin::workers))
        .route("/shards", get(routes::admin::shards))
        .route("/partitions", get(routes::admin::partitions))
        .route("/circuit-breakers", get(routes::admin::circuit_breakers))
        .route("/circuit-breakers/{name}", get(routes::admin::circuit_breaker))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates empty registries, with breakers built from the configured defaults.
pub fn create_default_state(config: &Config) -> Arc<AppState> {
    Arc::new(AppState {
        load_balancer: Arc::new(WorkerLoadBalancer::new()),
        sharding: Arc::new(SagaShardingManager::new()),
        partitioning: Arc::new(QueuePartitioningManager::new()),
        circuit_breakers: Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())),
    })
}

/// Builds the registry of every handler group this binary ships.
pub fn build_registry() -> saga::Result<StepRegistry> {
    StepRegistry::builder().with_group(&ProposalSaga).build()
}
