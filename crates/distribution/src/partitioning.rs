use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::OrderedRegistry;
use crate::{DistributionError, Result};

/// A tenant's slice of the queue namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub partition_id: String,
    pub tenant_id: String,
    pub queue_prefix: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitioningStrategy {
    /// The tenant's mapped partition, else one registered for the tenant.
    TenantBased,
    /// Stable hash of the tenant identifier.
    HashBased,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitioningStats {
    pub total_partitions: usize,
    pub total_tenants: usize,
}

/// Maps tenants onto partitions and partitions onto queue-name prefixes.
pub struct QueuePartitioningManager {
    partitions: OrderedRegistry<PartitionInfo>,
    tenants: DashMap<String, String>,
    round_robin: AtomicUsize,
}

impl Default for QueuePartitioningManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuePartitioningManager {
    pub fn new() -> Self {
        Self {
            partitions: OrderedRegistry::new(),
            tenants: DashMap::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Registers a partition and maps its owning tenant onto it.
    pub fn register_partition(&self, tenant_id: &str, partition_id: &str, queue_prefix: &str) {
        self.partitions.insert(
            partition_id,
            PartitionInfo {
                partition_id: partition_id.to_string(),
                tenant_id: tenant_id.to_string(),
                queue_prefix: queue_prefix.to_string(),
                created_at: Utc::now(),
            },
        );
        self.tenants
            .insert(tenant_id.to_string(), partition_id.to_string());
        metrics::counter!("partitioning_operations_total", "operation" => "register").increment(1);
        info!(
            partition_id = %partition_id,
            tenant_id = %tenant_id,
            prefix = %queue_prefix,
            "Registered partition"
        );
    }

    /// Moves `tenant_id` onto an already registered partition.
    pub fn assign_tenant(&self, tenant_id: &str, partition_id: &str) -> Result<()> {
        if !self.partitions.contains(partition_id) {
            return Err(DistributionError::UnknownPartition(
                partition_id.to_string(),
            ));
        }
        self.tenants
            .insert(tenant_id.to_string(), partition_id.to_string());
        metrics::counter!("partitioning_operations_total", "operation" => "assign").increment(1);
        debug!(tenant_id = %tenant_id, partition_id = %partition_id, "Assigned tenant to partition");
        Ok(())
    }

    /// Mapped partition, else the first registered partition.
    pub fn partition_for_tenant(&self, tenant_id: &str) -> Option<String> {
        self.tenants
            .get(tenant_id)
            .map(|partition| partition.value().clone())
            .or_else(|| self.partitions.first_id())
    }

    /// `"{prefix}.{base_queue}"` for the tenant's partition, or `base_queue`
    /// unchanged when no partition is registered.
    pub fn partitioned_queue_name(&self, tenant_id: &str, base_queue: &str) -> String {
        self.partition_for_tenant(tenant_id)
            .and_then(|id| self.partitions.get(&id))
            .map(|partition| format!("{}.{}", partition.queue_prefix, base_queue))
            .unwrap_or_else(|| base_queue.to_string())
    }

    /// Whether `queue_name` lives under the tenant's partition prefix.
    pub fn is_queue_for_tenant(&self, queue_name: &str, tenant_id: &str) -> bool {
        self.partition_for_tenant(tenant_id)
            .and_then(|id| self.partitions.get(&id))
            .is_some_and(|partition| {
                queue_name
                    .strip_prefix(partition.queue_prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
            })
    }

    pub fn apply_strategy(
        &self,
        tenant_id: &str,
        strategy: PartitioningStrategy,
    ) -> Option<String> {
        metrics::counter!("partitioning_operations_total", "operation" => "select").increment(1);
        match strategy {
            PartitioningStrategy::TenantBased => self.partition_by_tenant(tenant_id),
            PartitioningStrategy::HashBased => self.partitions.id_by_hash(tenant_id),
            PartitioningStrategy::RoundRobin => {
                let counter = self.round_robin.fetch_add(1, Ordering::Relaxed);
                self.partitions.id_by_index(counter)
            }
        }
    }

    pub fn partition_info(&self, partition_id: &str) -> Option<PartitionInfo> {
        self.partitions.get(partition_id)
    }

    /// All partitions in registration order.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.partitions
            .ordered()
            .into_iter()
            .map(|(_, partition)| partition)
            .collect()
    }

    /// Removes the partition and unmaps every tenant pointing at it.
    pub fn remove_partition(&self, partition_id: &str) -> bool {
        if self.partitions.remove(partition_id).is_none() {
            return false;
        }
        self.tenants
            .retain(|_, partition| partition.as_str() != partition_id);
        metrics::counter!("partitioning_operations_total", "operation" => "remove").increment(1);
        info!(partition_id = %partition_id, "Removed partition");
        true
    }

    pub fn stats(&self) -> PartitioningStats {
        PartitioningStats {
            total_partitions: self.partitions.len(),
            total_tenants: self.tenants.len(),
        }
    }

    fn partition_by_tenant(&self, tenant_id: &str) -> Option<String> {
        if let Some(partition) = self.tenants.get(tenant_id) {
            return Some(partition.value().clone());
        }
        self.partitions
            .ordered()
            .into_iter()
            .find(|(_, partition)| partition.tenant_id == tenant_id)
            .map(|(id, _)| id)
            .or_else(|| self.partitions.first_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> QueuePartitioningManager {
        let manager = QueuePartitioningManager::new();
        manager.register_partition("T1", "P1", "P1-prefix");
        manager.register_partition("T2", "P2", "P2-prefix");
        manager
    }

    #[test]
    fn test_partitioned_queue_name() {
        let manager = manager();
        assert_eq!(
            manager.partitioned_queue_name("T1", "orders"),
            "P1-prefix.orders"
        );
        assert_eq!(
            manager.partitioned_queue_name("T2", "orders"),
            "P2-prefix.orders"
        );
        assert_eq!(
            manager.partitioned_queue_name("unknown", "orders"),
            "P1-prefix.orders"
        );
    }

    #[test]
    fn test_no_partitions_leaves_queue_unchanged() {
        let manager = QueuePartitioningManager::new();
        assert_eq!(manager.partitioned_queue_name("T1", "orders"), "orders");
        assert!(manager.partition_for_tenant("T1").is_none());
        assert!(
            manager
                .apply_strategy("T1", PartitioningStrategy::RoundRobin)
                .is_none()
        );
    }

    #[test]
    fn test_assign_tenant_reassigns_without_reregistering() {
        let manager = manager();
        manager.assign_tenant("T1", "P2").unwrap();
        assert_eq!(manager.partition_for_tenant("T1"), Some("P2".to_string()));
        assert_eq!(
            manager.partitioned_queue_name("T1", "orders"),
            "P2-prefix.orders"
        );
        assert_eq!(
            manager.assign_tenant("T3", "P9"),
            Err(DistributionError::UnknownPartition("P9".to_string()))
        );
    }

    #[test]
    fn test_is_queue_for_tenant() {
        let manager = manager();
        assert!(manager.is_queue_for_tenant("P1-prefix.orders", "T1"));
        assert!(!manager.is_queue_for_tenant("P2-prefix.orders", "T1"));
        assert!(!manager.is_queue_for_tenant("P1-prefixed.orders", "T1"));
    }

    #[test]
    fn test_strategies() {
        let manager = manager();
        assert_eq!(
            manager.apply_strategy("T2", PartitioningStrategy::TenantBased),
            Some("P2".to_string())
        );

        let hashed = manager.apply_strategy("tenant-x", PartitioningStrategy::HashBased);
        assert!(hashed.is_some());
        assert_eq!(
            manager.apply_strategy("tenant-x", PartitioningStrategy::HashBased),
            hashed
        );

        let picks: Vec<_> = (0..3)
            .map(|_| {
                manager
                    .apply_strategy("any", PartitioningStrategy::RoundRobin)
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec!["P1", "P2", "P1"]);
    }

    #[test]
    fn test_remove_partition_drops_tenant_mappings() {
        let manager = manager();
        manager.assign_tenant("T3", "P2").unwrap();
        assert_eq!(
            manager.stats(),
            PartitioningStats {
                total_partitions: 2,
                total_tenants: 3,
            }
        );

        assert!(manager.remove_partition("P2"));
        assert!(!manager.remove_partition("P2"));
        assert_eq!(manager.partition_for_tenant("T2"), Some("P1".to_string()));
        assert_eq!(
            manager.stats(),
            PartitioningStats {
                total_partitions: 1,
                total_tenants: 1,
            }
        );
        assert_eq!(manager.partitions().len(), 1);
        assert!(manager.partition_info("P2").is_none());
    }
}
