use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::OrderedRegistry;
use crate::{DistributionError, Result};

/// A named group of saga traffic for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    pub shard_id: String,
    pub domain: String,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Stable hash of the correlation identifier.
    HashBased,
    /// First shard registered for the saga's domain.
    DomainBased,
    /// Cycles through shards with its own counter.
    RoundRobin,
    /// Shard with the fewest explicit saga assignments.
    LoadBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardingStats {
    pub total_shards: usize,
    pub total_assignments: usize,
}

/// Maps sagas onto shards.
///
/// Explicit assignments live apart from the shard registry, so a saga can be
/// moved without re-registering anything. Sagas with no assignment resolve to
/// the first registered shard.
pub struct SagaShardingManager {
    shards: OrderedRegistry<ShardInfo>,
    assignments: DashMap<String, String>,
    round_robin: AtomicUsize,
}

impl Default for SagaShardingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaShardingManager {
    pub fn new() -> Self {
        Self {
            shards: OrderedRegistry::new(),
            assignments: DashMap::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn register_shard(&self, domain: &str, shard_id: &str, queue_name: &str) {
        self.shards.insert(
            shard_id,
            ShardInfo {
                shard_id: shard_id.to_string(),
                domain: domain.to_string(),
                queue_name: queue_name.to_string(),
                created_at: Utc::now(),
            },
        );
        metrics::counter!("sharding_operations_total", "operation" => "register").increment(1);
        info!(shard_id = %shard_id, domain = %domain, queue = %queue_name, "Registered shard");
    }

    /// Pins `saga_id` to a registered shard.
    pub fn assign_saga(&self, saga_id: &str, shard_id: &str) -> Result<()> {
        if !self.shards.contains(shard_id) {
            return Err(DistributionError::UnknownShard(shard_id.to_string()));
        }
        self.assignments
            .insert(saga_id.to_string(), shard_id.to_string());
        metrics::counter!("sharding_operations_total", "operation" => "assign").increment(1);
        debug!(saga_id = %saga_id, shard_id = %shard_id, "Assigned saga to shard");
        Ok(())
    }

    /// Drops the explicit assignment, returning the shard it pointed to.
    pub fn unassign_saga(&self, saga_id: &str) -> Option<String> {
        self.assignments.remove(saga_id).map(|(_, shard)| shard)
    }

    /// Assigned shard, else the first registered shard.
    pub fn shard_for_saga(&self, saga_id: &str) -> Option<String> {
        self.assignments
            .get(saga_id)
            .map(|shard| shard.value().clone())
            .or_else(|| self.default_shard())
    }

    pub fn shard_by_correlation_id(&self, correlation_id: &str) -> Option<String> {
        self.shards.id_by_hash(correlation_id)
    }

    /// First registered shard for `domain`, else the first registered shard.
    pub fn shard_by_domain(&self, domain: &str) -> Option<String> {
        self.shards
            .ordered()
            .into_iter()
            .find(|(_, shard)| shard.domain == domain)
            .map(|(id, _)| id)
            .or_else(|| self.default_shard())
    }

    pub fn shard_by_round_robin(&self) -> Option<String> {
        let counter = self.round_robin.fetch_add(1, Ordering::Relaxed);
        self.shards.id_by_index(counter)
    }

    /// Shard with the fewest assignments; ties go to the earliest registered.
    pub fn shard_by_load(&self) -> Option<String> {
        let shards = self.shards.ordered();
        shards
            .into_iter()
            .map(|(id, _)| {
                let load = self
                    .assignments
                    .iter()
                    .filter(|assignment| assignment.value() == &id)
                    .count();
                (id, load)
            })
            .min_by_key(|(_, load)| *load)
            .map(|(id, _)| id)
    }

    pub fn apply_strategy(
        &self,
        _saga_id: &str,
        correlation_id: &str,
        domain: &str,
        strategy: ShardingStrategy,
    ) -> Option<String> {
        metrics::counter!("sharding_operations_total", "operation" => "select").increment(1);
        match strategy {
            ShardingStrategy::HashBased => self.shard_by_correlation_id(correlation_id),
            ShardingStrategy::DomainBased => self.shard_by_domain(domain),
            ShardingStrategy::RoundRobin => self.shard_by_round_robin(),
            ShardingStrategy::LoadBased => self.shard_by_load(),
        }
    }

    pub fn shard_info(&self, shard_id: &str) -> Option<ShardInfo> {
        self.shards.get(shard_id)
    }

    /// All shards in registration order.
    pub fn shards(&self) -> Vec<ShardInfo> {
        self.shards
            .ordered()
            .into_iter()
            .map(|(_, shard)| shard)
            .collect()
    }

    /// Removes the shard and every assignment pointing at it.
    pub fn remove_shard(&self, shard_id: &str) -> bool {
        if self.shards.remove(shard_id).is_none() {
            return false;
        }
        self.assignments.retain(|_, shard| shard.as_str() != shard_id);
        metrics::counter!("sharding_operations_total", "operation" => "remove").increment(1);
        info!(shard_id = %shard_id, "Removed shard");
        true
    }

    pub fn stats(&self) -> ShardingStats {
        ShardingStats {
            total_shards: self.shards.len(),
            total_assignments: self.assignments.len(),
        }
    }

    fn default_shard(&self) -> Option<String> {
        self.shards.first_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SagaShardingManager {
        let manager = SagaShardingManager::new();
        manager.register_shard("sales", "s1", "sales.sagas");
        manager.register_shard("billing", "s2", "billing.sagas");
        manager.register_shard("sales", "s3", "sales.overflow");
        manager
    }

    #[test]
    fn test_unassigned_saga_uses_first_registered_shard() {
        let manager = manager();
        assert_eq!(manager.shard_for_saga("saga-1"), Some("s1".to_string()));
        assert!(SagaShardingManager::new().shard_for_saga("saga-1").is_none());
    }

    #[test]
    fn test_assignment_overrides_default() {
        let manager = manager();
        manager.assign_saga("saga-1", "s2").unwrap();
        assert_eq!(manager.shard_for_saga("saga-1"), Some("s2".to_string()));

        assert_eq!(manager.unassign_saga("saga-1"), Some("s2".to_string()));
        assert_eq!(manager.shard_for_saga("saga-1"), Some("s1".to_string()));
    }

    #[test]
    fn test_assign_to_unknown_shard_fails() {
        let manager = manager();
        assert_eq!(
            manager.assign_saga("saga-1", "nope"),
            Err(DistributionError::UnknownShard("nope".to_string()))
        );
    }

    #[test]
    fn test_domain_lookup() {
        let manager = manager();
        assert_eq!(manager.shard_by_domain("billing"), Some("s2".to_string()));
        assert_eq!(manager.shard_by_domain("sales"), Some("s1".to_string()));
        assert_eq!(manager.shard_by_domain("unknown"), Some("s1".to_string()));
    }

    #[test]
    fn test_hash_based_is_stable() {
        let manager = manager();
        let shard = manager.shard_by_correlation_id("corr-123").unwrap();
        for _ in 0..5 {
            assert_eq!(manager.shard_by_correlation_id("corr-123").unwrap(), shard);
        }
    }

    #[test]
    fn test_round_robin_cycles_independently_of_hash() {
        let manager = manager();
        let picks: Vec<_> = (0..4)
            .map(|_| manager.shard_by_round_robin().unwrap())
            .collect();
        assert_eq!(picks, vec!["s1", "s2", "s3", "s1"]);
    }

    #[test]
    fn test_load_based_picks_fewest_assignments() {
        let manager = manager();
        manager.assign_saga("a", "s1").unwrap();
        manager.assign_saga("b", "s2").unwrap();
        assert_eq!(manager.shard_by_load(), Some("s3".to_string()));

        manager.assign_saga("c", "s3").unwrap();
        assert_eq!(
            manager.apply_strategy("d", "corr", "sales", ShardingStrategy::LoadBased),
            Some("s1".to_string())
        );
    }

    #[test]
    fn test_remove_shard_drops_its_assignments() {
        let manager = manager();
        manager.assign_saga("a", "s2").unwrap();
        manager.assign_saga("b", "s3").unwrap();

        assert!(manager.remove_shard("s2"));
        assert!(!manager.remove_shard("s2"));
        assert_eq!(manager.shard_for_saga("a"), Some("s1".to_string()));
        assert_eq!(
            manager.stats(),
            ShardingStats {
                total_shards: 2,
                total_assignments: 1,
            }
        );
        assert!(manager.shard_info("s2").is_none());
        assert_eq!(manager.shards().len(), 2);
    }
}
