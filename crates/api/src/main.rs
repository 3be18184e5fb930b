//! Saga orchestrator entry point.

use std::sync::Arc;

use api::config::{BrokerKind, Config, LogFormat};
use api::error::StartupError;
use api::handlers::PROPOSAL_ISSUANCE_QUEUE;
use execution_store::{
    ExecutionRecorder, ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore,
};
use messaging::{InMemoryBroker, MessageBroker, RabbitMqBroker};
use resilience::RateLimiter;
use saga::{EngineGuards, SagaEngine};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

/// Connection slots advertised for this process in the worker registry.
const LOCAL_WORKER_CONCURRENCY: u32 = 100;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "orchestrator failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    // 1. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    // 2. Execution store and background recorder
    let store: Arc<dyn ExecutionStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresExecutionStore::connect(url, &config.pool).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL execution store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, keeping execution records in memory");
            Arc::new(InMemoryExecutionStore::new())
        }
    };
    let recorder = Arc::new(ExecutionRecorder::spawn_with(store, config.recorder));

    // 3. Broker
    let (broker, rabbit): (Arc<dyn MessageBroker>, Option<Arc<RabbitMqBroker>>) =
        match config.broker {
            BrokerKind::RabbitMq => {
                let rabbit =
                    Arc::new(RabbitMqBroker::connect(&config.amqp, config.exchange.clone()).await?);
                (rabbit.clone() as Arc<dyn MessageBroker>, Some(rabbit))
            }
            BrokerKind::Memory => {
                tracing::warn!("SAGA_BROKER=memory, messages stay inside this process");
                (Arc::new(InMemoryBroker::new()), None)
            }
        };

    // 4. Engine, registries and topology
    let state = api::create_default_state(&config);
    let mut engine = SagaEngine::new(api::build_registry()?, broker.clone(), recorder.clone());
    if config.guard_steps {
        engine = engine.with_guards(EngineGuards::new(
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            state.circuit_breakers.clone(),
        ));
    }

    let topology = engine
        .topology(&config.exchange)
        .with_queues(config.queues.iter().cloned());
    broker.declare_topology(&topology).await?;
    tracing::info!(
        exchange = %topology.exchange,
        queues = topology.queues.len(),
        "declared saga topology"
    );

    let worker_id = format!("orchestrator-{}", Uuid::new_v4());
    state
        .load_balancer
        .register_worker(&worker_id, &config.host, config.port, LOCAL_WORKER_CONCURRENCY);
    state
        .sharding
        .register_shard("proposal", "proposal-0", PROPOSAL_ISSUANCE_QUEUE);

    let engine = Arc::new(engine);
    let handle = Arc::clone(&engine).start().await?;
    tracing::info!(steps = handle.step_count(), "saga engine started");

    // 5. Admin server
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting admin server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Drain
    handle.shutdown().await;
    recorder.shutdown().await;
    if let Some(rabbit) = rabbit {
        rabbit.close().await?;
    }

    tracing::info!("orchestrator shut down gracefully");
    Ok(())
}
