//! Worker registry with round-robin, least-connections and weighted selection.
//!
//! A worker is selectable while it is marked available and its connection
//! count is below its maximum concurrency. Connection counts are maintained by
//! the caller around each dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::registry::OrderedRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

/// A registered worker. Connection count and availability change over its lifetime.
#[derive(Debug)]
pub struct WorkerInfo {
    id: String,
    host: String,
    port: u16,
    max_concurrency: u32,
    connections: AtomicU32,
    available: AtomicBool,
    registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    fn new(id: &str, host: &str, port: u16, max_concurrency: u32) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            max_concurrency,
            connections: AtomicU32::new(0),
            available: AtomicBool::new(true),
            registered_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn current_connections(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Marked available and below maximum concurrency.
    pub fn is_selectable(&self) -> bool {
        self.available.load(Ordering::Acquire) && self.current_connections() < self.max_concurrency
    }

    /// Spare capacity used as the weighted round-robin weight.
    fn spare_capacity(&self) -> u64 {
        u64::from(self.max_concurrency.saturating_sub(self.current_connections()))
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            max_concurrency: self.max_concurrency,
            current_connections: self.current_connections(),
            available: self.available.load(Ordering::Acquire),
            registered_at: self.registered_at,
        }
    }
}

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub max_concurrency: u32,
    pub current_connections: u32,
    pub available: bool,
    pub registered_at: DateTime<Utc>,
}

impl WorkerStats {
    /// Connections over capacity, or 0.0 for a zero-capacity worker.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrency == 0 {
            0.0
        } else {
            f64::from(self.current_connections) / f64::from(self.max_concurrency)
        }
    }
}

pub struct WorkerLoadBalancer {
    workers: OrderedRegistry<Arc<WorkerInfo>>,
    counter: AtomicUsize,
}

impl Default for WorkerLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLoadBalancer {
    pub fn new() -> Self {
        Self {
            workers: OrderedRegistry::new(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Registers a worker, replacing any worker with the same id.
    pub fn register_worker(&self, worker_id: &str, host: &str, port: u16, max_concurrency: u32) {
        self.workers.insert(
            worker_id,
            Arc::new(WorkerInfo::new(worker_id, host, port, max_concurrency)),
        );
        info!(worker_id = %worker_id, host = %host, port, max_concurrency, "Registered worker");
    }

    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        let removed = self.workers.remove(worker_id).is_some();
        if removed {
            info!(worker_id = %worker_id, "Unregistered worker");
        }
        removed
    }

    pub fn worker(&self, worker_id: &str) -> Option<Arc<WorkerInfo>> {
        self.workers.get(worker_id)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn eligible(&self) -> Vec<Arc<WorkerInfo>> {
        self.workers
            .ordered()
            .into_iter()
            .map(|(_, worker)| worker)
            .filter(|worker| worker.is_selectable())
            .collect()
    }

    pub fn select(&self, strategy: LoadBalancingStrategy) -> Option<Arc<WorkerInfo>> {
        let selected = match strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(),
            LoadBalancingStrategy::LeastConnections => self.select_least_connections(),
            LoadBalancingStrategy::WeightedRoundRobin => self.select_weighted_round_robin(),
        };
        if selected.is_some() {
            metrics::counter!("load_balancer_selections_total", "strategy" => strategy.as_str())
                .increment(1);
        } else {
            debug!(strategy = strategy.as_str(), "No selectable worker");
        }
        selected
    }

    /// Cycles through selectable workers in registration order.
    pub fn select_round_robin(&self) -> Option<Arc<WorkerInfo>> {
        let eligible = self.eligible();
        if eligible.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible.into_iter().nth(index)
    }

    /// Selectable worker with the fewest connections; ties go to the earliest registered.
    pub fn select_least_connections(&self) -> Option<Arc<WorkerInfo>> {
        self.eligible()
            .into_iter()
            .min_by_key(|worker| worker.current_connections())
    }

    /// Picks workers in proportion to their spare capacity.
    pub fn select_weighted_round_robin(&self) -> Option<Arc<WorkerInfo>> {
        let weighted: Vec<_> = self
            .eligible()
            .into_iter()
            .map(|worker| {
                let weight = worker.spare_capacity();
                (worker, weight)
            })
            .collect();
        let total_weight: u64 = weighted.iter().map(|(_, weight)| weight).sum();
        if total_weight == 0 {
            return None;
        }

        let target = self.counter.fetch_add(1, Ordering::Relaxed) as u64 % total_weight;
        pick_weighted(&weighted, target)
    }

    pub fn increment_connections(&self, worker_id: &str) -> bool {
        match self.workers.get(worker_id) {
            Some(worker) => {
                let now = worker.connections.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(worker_id = %worker_id, connections = now, "Incremented worker connections");
                true
            }
            None => false,
        }
    }

    /// Decrements the connection count, never below zero.
    pub fn decrement_connections(&self, worker_id: &str) -> bool {
        match self.workers.get(worker_id) {
            Some(worker) => {
                let _ = worker
                    .connections
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
                debug!(
                    worker_id = %worker_id,
                    connections = worker.current_connections(),
                    "Decremented worker connections"
                );
                true
            }
            None => false,
        }
    }

    pub fn mark_unavailable(&self, worker_id: &str) -> bool {
        match self.workers.get(worker_id) {
            Some(worker) => {
                worker.available.store(false, Ordering::Release);
                warn!(worker_id = %worker_id, "Marked worker unavailable");
                true
            }
            None => false,
        }
    }

    pub fn mark_available(&self, worker_id: &str) -> bool {
        match self.workers.get(worker_id) {
            Some(worker) => {
                worker.available.store(true, Ordering::Release);
                info!(worker_id = %worker_id, "Marked worker available");
                true
            }
            None => false,
        }
    }

    /// Snapshots of all workers in registration order.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .ordered()
            .into_iter()
            .map(|(_, worker)| worker.stats())
            .collect()
    }
}

/// Walks the cumulative weights of a snapshot and returns the worker whose
/// range covers `target`. Workers that filled up after the snapshot are
/// skipped in favour of the next selectable one.
fn pick_weighted(weighted: &[(Arc<WorkerInfo>, u64)], target: u64) -> Option<Arc<WorkerInfo>> {
    let mut cumulative = 0;
    let start = weighted.iter().position(|(_, weight)| {
        cumulative += weight;
        cumulative > target
    })?;
    weighted
        .iter()
        .cycle()
        .skip(start)
        .take(weighted.len())
        .map(|(worker, _)| worker)
        .find(|worker| worker.is_selectable())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(workers: &[(&str, u32)]) -> WorkerLoadBalancer {
        let balancer = WorkerLoadBalancer::new();
        for (i, (id, max)) in workers.iter().enumerate() {
            balancer.register_worker(id, "10.0.0.1", 8080 + i as u16, *max);
        }
        balancer
    }

    #[test]
    fn test_round_robin_visits_each_worker_once_per_cycle() {
        let balancer = balancer(&[("w1", 10), ("w2", 10), ("w3", 10)]);

        let mut seen: Vec<String> = (0..3)
            .map(|_| balancer.select_round_robin().unwrap().id().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_round_robin_skips_unavailable_workers() {
        let balancer = balancer(&[("w1", 10), ("w2", 10)]);
        balancer.mark_unavailable("w1");

        for _ in 0..4 {
            assert_eq!(balancer.select_round_robin().unwrap().id(), "w2");
        }
        balancer.mark_available("w1");
        let ids: Vec<_> = (0..2)
            .map(|_| balancer.select_round_robin().unwrap().id().to_string())
            .collect();
        assert!(ids.contains(&"w1".to_string()));
    }

    #[test]
    fn test_least_connections_prefers_idle_worker() {
        let balancer = balancer(&[("w1", 10), ("w2", 10), ("w3", 10)]);
        balancer.increment_connections("w1");
        balancer.increment_connections("w1");
        balancer.increment_connections("w2");

        assert_eq!(balancer.select_least_connections().unwrap().id(), "w3");
    }

    #[test]
    fn test_least_connections_never_returns_saturated_worker() {
        let balancer = balancer(&[("w1", 1), ("w2", 5)]);
        balancer.increment_connections("w1");
        for _ in 0..4 {
            balancer.increment_connections("w2");
        }

        // w1 has fewer connections but is at capacity.
        assert_eq!(balancer.select_least_connections().unwrap().id(), "w2");
        balancer.increment_connections("w2");
        assert!(balancer.select_least_connections().is_none());
    }

    #[test]
    fn test_least_connections_ties_go_to_first_registered() {
        let balancer = balancer(&[("b", 3), ("a", 3)]);
        assert_eq!(balancer.select_least_connections().unwrap().id(), "b");
    }

    #[test]
    fn test_weighted_round_robin_follows_spare_capacity() {
        let balancer = balancer(&[("big", 3), ("small", 1)]);

        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select_weighted_round_robin().unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["big", "big", "big", "small"]);
    }

    #[test]
    fn test_weighted_round_robin_none_when_saturated() {
        let balancer = balancer(&[("w1", 1), ("w2", 1)]);
        balancer.increment_connections("w1");
        balancer.increment_connections("w2");

        assert!(balancer.select_weighted_round_robin().is_none());
        assert!(balancer.select(LoadBalancingStrategy::RoundRobin).is_none());
    }

    #[test]
    fn test_weighted_pick_skips_worker_filled_after_snapshot() {
        let balancer = balancer(&[("a", 2), ("b", 2)]);
        let weighted: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| (balancer.worker(id).unwrap(), 2))
            .collect();

        balancer.increment_connections("a");
        balancer.increment_connections("a");
        let picked = pick_weighted(&weighted, 0).unwrap();
        assert_eq!(picked.id(), "b");

        balancer.increment_connections("b");
        balancer.increment_connections("b");
        assert!(pick_weighted(&weighted, 0).is_none());
        assert!(pick_weighted(&weighted, 3).is_none());
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let balancer = balancer(&[("w1", 2)]);
        assert!(balancer.decrement_connections("w1"));
        assert_eq!(balancer.worker("w1").unwrap().current_connections(), 0);
        assert!(!balancer.decrement_connections("missing"));
    }

    #[test]
    fn test_stats_and_utilization() {
        let balancer = balancer(&[("w1", 4), ("w2", 0)]);
        balancer.increment_connections("w1");

        let stats = balancer.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].worker_id, "w1");
        assert_eq!(stats[0].utilization(), 0.25);
        assert_eq!(stats[1].utilization(), 0.0);
    }

    #[test]
    fn test_unregister_worker() {
        let balancer = balancer(&[("w1", 1)]);
        assert!(balancer.unregister_worker("w1"));
        assert!(!balancer.unregister_worker("w1"));
        assert!(balancer.select(LoadBalancingStrategy::LeastConnections).is_none());
        assert_eq!(balancer.worker_count(), 0);
    }
}
