//! Distribution policies for saga traffic.
//!
//! - [`WorkerLoadBalancer`]: picks a worker by round-robin, least connections
//!   or spare-capacity weighting.
//! - [`SagaShardingManager`]: maps sagas onto domain shards.
//! - [`QueuePartitioningManager`]: maps tenants onto queue-name prefixes.
//!
//! Registries remember registration order, so "first registered" defaults and
//! hash/round-robin selection are deterministic for a given insertion history.

pub mod error;
pub mod load_balancer;
pub mod partitioning;
mod registry;
pub mod sharding;

pub use error::{DistributionError, Result};
pub use load_balancer::{LoadBalancingStrategy, WorkerInfo, WorkerLoadBalancer, WorkerStats};
pub use partitioning::{
    PartitionInfo, PartitioningStats, PartitioningStrategy, QueuePartitioningManager,
};
pub use registry::stable_hash;
pub use sharding::{SagaShardingManager, ShardInfo, ShardingStats, ShardingStrategy};
