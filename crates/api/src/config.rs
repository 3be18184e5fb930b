//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use execution_store::{PoolOptions, RecorderConfig};
use messaging::AmqpConfig;
use resilience::{CircuitBreakerConfig, RateLimitConfig};

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Broker implementation selected by `SAGA_BROKER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    RabbitMq,
}

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: admin HTTP bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `SAGA_BROKER`: `memory` or `rabbitmq` (default `memory`)
/// - `AMQP_HOST`, `AMQP_PORT`, `AMQP_USERNAME`, `AMQP_PASSWORD`, `AMQP_VHOST`,
///   `AMQP_HEARTBEAT_SECS`, `AMQP_CONNECTION_TIMEOUT_MS`, `AMQP_MAX_CHANNELS`
/// - `DATABASE_URL`: PostgreSQL execution store; unset keeps records in memory
/// - `DB_MIN_CONNECTIONS`, `DB_MAX_CONNECTIONS`, `DB_IDLE_TIMEOUT_MS`,
///   `DB_MAX_LIFETIME_MS`, `DB_ACQUIRE_TIMEOUT_MS`
/// - `RECORDER_QUEUE_CAPACITY` (default `10000`), `RECORDER_WRITERS`
///   (default `4`): execution-record writer sizing
/// - `SAGA_EXCHANGE` (default `"saga"`), `SAGA_QUEUES`: extra comma-separated
///   queues to declare besides the registered steps' queues
/// - `RATE_LIMIT_DEFAULT_REQUESTS`, `RATE_LIMIT_DEFAULT_WINDOW_SECS`
/// - `CIRCUIT_BREAKER_FAILURE_RATE`, `CIRCUIT_BREAKER_WINDOW_SIZE`,
///   `CIRCUIT_BREAKER_MIN_CALLS`, `CIRCUIT_BREAKER_OPEN_SECS`,
///   `CIRCUIT_BREAKER_HALF_OPEN_CALLS`
/// - `SAGA_GUARD_STEPS`: run every step through its rate limiter and
///   circuit breaker (default `false`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub broker: BrokerKind,
    pub amqp: AmqpConfig,
    pub database_url: Option<String>,
    pub pool: PoolOptions,
    pub recorder: RecorderConfig,
    pub exchange: String,
    pub queues: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub guard_steps: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(lookup);
        let defaults = Self::default();

        let amqp = AmqpConfig {
            host: env.text("AMQP_HOST", defaults.amqp.host),
            port: env.parse("AMQP_PORT").unwrap_or(defaults.amqp.port),
            username: env.text("AMQP_USERNAME", defaults.amqp.username),
            password: env.text("AMQP_PASSWORD", defaults.amqp.password),
            vhost: env.text("AMQP_VHOST", defaults.amqp.vhost),
            heartbeat: env.secs("AMQP_HEARTBEAT_SECS", defaults.amqp.heartbeat),
            connection_timeout: env.millis(
                "AMQP_CONNECTION_TIMEOUT_MS",
                defaults.amqp.connection_timeout,
            ),
            max_channels: env
                .parse("AMQP_MAX_CHANNELS")
                .unwrap_or(defaults.amqp.max_channels),
        };

        let pool = PoolOptions {
            min_connections: env
                .parse("DB_MIN_CONNECTIONS")
                .unwrap_or(defaults.pool.min_connections),
            max_connections: env
                .parse("DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.pool.max_connections),
            idle_timeout: env.millis("DB_IDLE_TIMEOUT_MS", defaults.pool.idle_timeout),
            max_lifetime: env.millis("DB_MAX_LIFETIME_MS", defaults.pool.max_lifetime),
            acquire_timeout: env.millis("DB_ACQUIRE_TIMEOUT_MS", defaults.pool.acquire_timeout),
        };

        let recorder = RecorderConfig {
            capacity: env
                .parse("RECORDER_QUEUE_CAPACITY")
                .unwrap_or(defaults.recorder.capacity),
            writers: env
                .parse("RECORDER_WRITERS")
                .unwrap_or(defaults.recorder.writers),
        };

        let rate_limit = RateLimitConfig {
            requests: env
                .parse("RATE_LIMIT_DEFAULT_REQUESTS")
                .unwrap_or(defaults.rate_limit.requests),
            window: env.secs("RATE_LIMIT_DEFAULT_WINDOW_SECS", defaults.rate_limit.window),
        };

        let breaker = &defaults.circuit_breaker;
        let circuit_breaker = CircuitBreakerConfig {
            failure_rate_threshold: env
                .parse("CIRCUIT_BREAKER_FAILURE_RATE")
                .unwrap_or(breaker.failure_rate_threshold),
            sliding_window_size: env
                .parse("CIRCUIT_BREAKER_WINDOW_SIZE")
                .unwrap_or(breaker.sliding_window_size),
            minimum_calls: env
                .parse("CIRCUIT_BREAKER_MIN_CALLS")
                .unwrap_or(breaker.minimum_calls),
            open_duration: env.secs("CIRCUIT_BREAKER_OPEN_SECS", breaker.open_duration),
            half_open_calls: env
                .parse("CIRCUIT_BREAKER_HALF_OPEN_CALLS")
                .unwrap_or(breaker.half_open_calls),
        };

        Self {
            host: env.text("HOST", defaults.host),
            port: env.parse("PORT").unwrap_or(defaults.port),
            log_level: env.text("RUST_LOG", defaults.log_level),
            log_format: env
                .get("LOG_FORMAT")
                .and_then(|v| parse_log_format(&v))
                .unwrap_or(defaults.log_format),
            broker: env
                .get("SAGA_BROKER")
                .and_then(|v| parse_broker(&v))
                .unwrap_or(defaults.broker),
            amqp,
            database_url: env.get("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            pool,
            recorder,
            exchange: env.text("SAGA_EXCHANGE", defaults.exchange),
            queues: env
                .get("SAGA_QUEUES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            rate_limit,
            circuit_breaker,
            guard_steps: env
                .get("SAGA_GUARD_STEPS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.guard_steps),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            broker: BrokerKind::Memory,
            amqp: AmqpConfig::default(),
            database_url: None,
            pool: PoolOptions::default(),
            recorder: RecorderConfig::default(),
            exchange: "saga".to_string(),
            queues: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            guard_steps: false,
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn text(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).map(Duration::from_millis).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).map(Duration::from_secs).unwrap_or(default)
    }
}

fn parse_log_format(value: &str) -> Option<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" => Some(LogFormat::Text),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

fn parse_broker(value: &str) -> Option<BrokerKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" | "in-memory" => Some(BrokerKind::Memory),
        "rabbitmq" | "amqp" => Some(BrokerKind::RabbitMq),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
