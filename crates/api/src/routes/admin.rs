//! Read-only views of the distribution and resilience registries.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use distribution::{
    PartitionInfo, PartitioningStats, QueuePartitioningManager, SagaShardingManager, ShardInfo,
    ShardingStats, WorkerLoadBalancer, WorkerStats,
};
use resilience::{CircuitBreakerManager, CircuitBreakerStats};
use serde::Serialize;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub load_balancer: Arc<WorkerLoadBalancer>,
    pub sharding: Arc<SagaShardingManager>,
    pub partitioning: Arc<QueuePartitioningManager>,
    pub circuit_breakers: Arc<CircuitBreakerManager>,
}

// -- Response types --

#[derive(Serialize)]
pub struct ShardsResponse {
    pub stats: ShardingStats,
    pub shards: Vec<ShardInfo>,
}

#[derive(Serialize)]
pub struct PartitionsResponse {
    pub stats: PartitioningStats,
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Serialize)]
pub struct CircuitBreakerResponse {
    pub name: String,
    #[serde(flatten)]
    pub stats: CircuitBreakerStats,
}

// -- Handlers --

/// GET /workers: per-worker connection and availability snapshot.
pub async fn workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerStats>> {
    Json(state.load_balancer.stats())
}

/// GET /shards
pub async fn shards(State(state): State<Arc<AppState>>) -> Json<ShardsResponse> {
    Json(ShardsResponse {
        stats: state.sharding.stats(),
        shards: state.sharding.shards(),
    })
}

/// GET /partitions
pub async fn partitions(State(state): State<Arc<AppState>>) -> Json<PartitionsResponse> {
    Json(PartitionsResponse {
        stats: state.partitioning.stats(),
        partitions: state.partitioning.partitions(),
    })
}

/// GET /circuit-breakers: names of every breaker created so far.
pub async fn circuit_breakers(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.circuit_breakers.names())
}

/// GET /circuit-breakers/{name}
pub async fn circuit_breaker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerResponse>, ApiError> {
    let stats = state
        .circuit_breakers
        .stats(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Circuit breaker {name} not found")))?;
    Ok(Json(CircuitBreakerResponse { name, stats }))
}
