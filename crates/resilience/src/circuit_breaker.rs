//! Per-name circuit breakers over a count-based sliding window.
//!
//! A breaker opens once at least `minimum_calls` outcomes are in the window and
//! the failure rate reaches the threshold. While open, calls are rejected
//! without running the operation. After `open_duration` the next call moves the
//! breaker to half-open, where `half_open_calls` trial calls decide whether it
//! closes again or re-opens.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate in percent at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent call outcomes kept in the window.
    pub sliding_window_size: usize,
    /// Outcomes required in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays open before allowing trial calls.
    pub open_duration: Duration,
    /// Trial calls permitted while half-open.
    pub half_open_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            minimum_calls: 5,
            open_duration: Duration::from_secs(60),
            half_open_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by a breaker-protected call.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The operation ran and failed; the failure was recorded.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }
}

/// A state change of one named breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failure rate in percent over the current window, or `None` below the minimum call count.
    pub failure_rate: Option<f64>,
    pub buffered_calls: usize,
    pub failed_calls: u64,
    pub successful_calls: u64,
    pub not_permitted_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_permits: usize,
    half_open_outcomes: Vec<bool>,
    /// Bumped on every transition so stale permits can be told apart.
    generation: u64,
    failed_calls: u64,
    successful_calls: u64,
    not_permitted_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_permits: 0,
            half_open_outcomes: Vec::new(),
            generation: 0,
            failed_calls: 0,
            successful_calls: 0,
            not_permitted_calls: 0,
        }
    }
}

fn failure_rate(outcomes: impl ExactSizeIterator<Item = bool>) -> f64 {
    let total = outcomes.len();
    if total == 0 {
        return 0.0;
    }
    let failures = outcomes.filter(|failed| *failed).count();
    failures as f64 * 100.0 / total as f64
}

/// Admission to one call through a breaker.
///
/// A permit dropped without an outcome (the call was cancelled or its future
/// was dropped) hands its half-open trial slot back.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    half_open_generation: Option<u64>,
    settled: bool,
}

impl CallPermit<'_> {
    fn settle(mut self, failed: bool) {
        self.settled = true;
        self.breaker.on_result(failed);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.half_open_generation {
            self.breaker.release_half_open_permit(generation);
        }
    }
}

/// A single named breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    fn new(
        name: String,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<StateTransition>,
    ) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let failure_rate = (inner.window.len() >= self.config.minimum_calls)
            .then(|| failure_rate(inner.window.iter().copied()));
        CircuitBreakerStats {
            state: inner.state,
            failure_rate,
            buffered_calls: inner.window.len(),
            failed_calls: inner.failed_calls,
            successful_calls: inner.successful_calls,
            not_permitted_calls: inner.not_permitted_calls,
        }
    }

    /// Runs `operation` unless the breaker rejects the call.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            metrics::counter!("circuit_breaker_rejected_total", "name" => self.name.clone())
                .increment(1);
            return Err(CircuitBreakerError::CircuitOpen {
                name: self.name.clone(),
            });
        };

        match operation().await {
            Ok(value) => {
                permit.settle(false);
                Ok(value)
            }
            Err(e) => {
                permit.settle(true);
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.open_duration)
                .unwrap_or(true);
            if elapsed {
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        let permitted = match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.half_open_permits < self.config.half_open_calls {
                    inner.half_open_permits += 1;
                    Some(Some(inner.generation))
                } else {
                    None
                }
            }
        };

        match permitted {
            Some(half_open_generation) => Some(CallPermit {
                breaker: self,
                half_open_generation,
                settled: false,
            }),
            None => {
                inner.not_permitted_calls += 1;
                None
            }
        }
    }

    fn release_half_open_permit(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.half_open_permits = inner.half_open_permits.saturating_sub(1);
        }
    }

    fn on_result(&self, failed: bool) {
        let mut inner = self.inner.lock();
        if failed {
            inner.failed_calls += 1;
        } else {
            inner.successful_calls += 1;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(failed);
                while inner.window.len() > self.config.sliding_window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_calls
                    && failure_rate(inner.window.iter().copied())
                        >= self.config.failure_rate_threshold
                {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_outcomes.push(failed);
                if inner.half_open_outcomes.len() >= self.config.half_open_calls {
                    let rate = failure_rate(inner.half_open_outcomes.iter().copied());
                    let next = if rate >= self.config.failure_rate_threshold {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(&mut inner, next);
                }
            }
            // Late result of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.half_open_permits = 0;
        inner.half_open_outcomes.clear();
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }

        if to == CircuitState::Open {
            warn!(breaker = %self.name, from = %from, "Circuit breaker opened");
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        }
        metrics::counter!(
            "circuit_breaker_state_transitions_total",
            "name" => self.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        // No subscribers is fine.
        let _ = self.events.send(StateTransition {
            name: self.name.clone(),
            from,
            to,
        });
    }
}

/// Registry of independent, lazily created breakers keyed by name.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    events: broadcast::Sender<StateTransition>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            breakers: DashMap::new(),
            default_config,
            events,
        }
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name.to_string(),
                    self.default_config.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Runs `operation` through the breaker named `name`.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(name);
        breaker.call(operation).await
    }

    /// Installs a breaker with a custom config, replacing any existing one.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) {
        let breaker = CircuitBreaker::new(name.to_string(), config, self.events.clone());
        self.breakers.insert(name.to_string(), Arc::new(breaker));
    }

    /// Drops the breaker; the next use of `name` starts from a fresh one.
    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.get(name).map(|b| b.state())
    }

    pub fn stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.breakers.get(name).map(|b| b.stats())
    }

    /// Names of all breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribes to state transitions of every breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn succeed(manager: &CircuitBreakerManager, name: &str) -> Result<(), CircuitBreakerError<String>> {
        manager.execute(name, || async { Ok::<_, String>(()) }).await
    }

    async fn fail(manager: &CircuitBreakerManager, name: &str) -> Result<(), CircuitBreakerError<String>> {
        manager
            .execute(name, || async { Err::<(), _>("boom".to_string()) })
            .await
    }

    #[tokio::test]
    async fn test_breaker_is_created_lazily_closed() {
        let manager = CircuitBreakerManager::default();
        assert!(manager.state("payments").is_none());

        succeed(&manager, "payments").await.unwrap();
        assert_eq!(manager.state("payments"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_opens_after_minimum_calls_at_threshold() {
        let manager = CircuitBreakerManager::default();

        for _ in 0..2 {
            succeed(&manager, "svc").await.unwrap();
        }
        for _ in 0..2 {
            assert!(fail(&manager, "svc").await.is_err());
        }
        // Four calls: below the minimum, still closed.
        assert_eq!(manager.state("svc"), Some(CircuitState::Closed));

        assert!(fail(&manager, "svc").await.is_err());
        assert_eq!(manager.state("svc"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_invoking() {
        let manager = CircuitBreakerManager::default();
        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }

        let invoked = AtomicUsize::new(0);
        let result = manager
            .execute("svc", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats("svc").unwrap().not_permitted_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trials_close_breaker() {
        let manager = CircuitBreakerManager::default();
        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }
        assert_eq!(manager.state("svc"), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(61)).await;

        succeed(&manager, "svc").await.unwrap();
        assert_eq!(manager.state("svc"), Some(CircuitState::HalfOpen));
        succeed(&manager, "svc").await.unwrap();
        succeed(&manager, "svc").await.unwrap();
        assert_eq!(manager.state("svc"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failures_reopen_breaker() {
        let manager = CircuitBreakerManager::default();
        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let _ = fail(&manager, "svc").await;
        let _ = fail(&manager, "svc").await;
        succeed(&manager, "svc").await.unwrap();
        assert_eq!(manager.state("svc"), Some(CircuitState::Open));

        // Still inside the new cool-down.
        assert!(succeed(&manager, "svc").await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let config = CircuitBreakerConfig {
            half_open_calls: 1,
            ..Default::default()
        };
        let manager = CircuitBreakerManager::new(config);
        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let breaker = manager.breaker("svc");
        let trial = breaker.try_acquire();
        assert!(trial.is_some());
        assert!(breaker.try_acquire().is_none());

        drop(trial);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_returns_its_permit() {
        let config = CircuitBreakerConfig {
            half_open_calls: 1,
            ..Default::default()
        };
        let manager = CircuitBreakerManager::new(config);
        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let hung = manager.execute("svc", || std::future::pending::<Result<(), String>>());
        let timed_out = tokio::time::timeout(Duration::from_secs(1), hung).await;
        assert!(timed_out.is_err());
        assert_eq!(manager.state("svc"), Some(CircuitState::HalfOpen));

        succeed(&manager, "svc").await.unwrap();
        assert_eq!(manager.state("svc"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_breakers_are_independent() {
        let manager = CircuitBreakerManager::default();
        for _ in 0..5 {
            let _ = fail(&manager, "a").await;
        }
        assert_eq!(manager.state("a"), Some(CircuitState::Open));
        succeed(&manager, "b").await.unwrap();
        assert_eq!(manager.state("b"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let manager = CircuitBreakerManager::default();
        let mut events = manager.subscribe();

        for _ in 0..5 {
            let _ = fail(&manager, "svc").await;
        }

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            StateTransition {
                name: "svc".to_string(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
    }

    #[tokio::test]
    async fn test_window_only_keeps_recent_calls() {
        let manager = CircuitBreakerManager::default();
        for _ in 0..6 {
            succeed(&manager, "svc").await.unwrap();
        }
        for _ in 0..4 {
            let _ = fail(&manager, "svc").await;
        }
        assert_eq!(manager.stats("svc").unwrap().failure_rate, Some(40.0));

        for _ in 0..10 {
            succeed(&manager, "svc").await.unwrap();
        }
        let stats = manager.stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.buffered_calls, 10);
        assert_eq!(stats.failure_rate, Some(0.0));
        assert_eq!(stats.failed_calls, 4);
        assert_eq!(stats.successful_calls, 16);
    }

    #[tokio::test]
    async fn test_configure_and_remove() {
        let manager = CircuitBreakerManager::default();
        manager.configure(
            "strict",
            CircuitBreakerConfig {
                minimum_calls: 1,
                sliding_window_size: 1,
                ..Default::default()
            },
        );

        let _ = fail(&manager, "strict").await;
        assert_eq!(manager.state("strict"), Some(CircuitState::Open));

        assert!(manager.remove("strict"));
        assert!(!manager.remove("strict"));
        succeed(&manager, "strict").await.unwrap();
        assert_eq!(manager.state("strict"), Some(CircuitState::Closed));
        assert_eq!(manager.names(), vec!["strict".to_string()]);
    }
}
