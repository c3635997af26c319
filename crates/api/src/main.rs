//! Order saga service entry point.

use std::sync::Arc;

use api::AppState;
use api::config::{Config, LogFormat};
use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{HttpFundsClient, HttpMatchingClient, SagaCoordinator, SagaRunner};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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
    let filter = EnvFilter::new(&config.log_level);
    let (json, pretty) = match config.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
}

#[tokio::main]
async fn main() {
    // 1. Load and check configuration before anything else runs
    let config = match Config::from_env().and_then(|config| config.validate().map(|()| config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Pick the saga log
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresEventStore::connect(&url, 10)
                .await
                .expect("failed to connect to the saga log database");
            store
                .run_migrations()
                .await
                .expect("failed to run saga log migrations");
            tracing::info!("using PostgreSQL saga log");
            run(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga log is in memory and lost on exit");
            run(InMemoryEventStore::new(), config, metrics_handle).await;
        }
    }
}

async fn run<S: EventStore + 'static>(store: S, config: Config, metrics_handle: PrometheusHandle) {
    // 5. Build the saga engine
    let saga_config = config.saga_config().expect("configuration was validated");
    let funds = HttpFundsClient::new(&config.funds_service_url, saga_config.call_timeout)
        .expect("invalid FUNDS_SERVICE_URL");
    let matching = HttpMatchingClient::new(&config.matching_service_url, saga_config.call_timeout)
        .expect("invalid MATCHING_SERVICE_URL");
    let coordinator = Arc::new(SagaCoordinator::from_config(
        store,
        funds,
        matching,
        &saga_config,
    ));
    let runner = Arc::new(SagaRunner::new(coordinator, saga_config.max_concurrent_sagas));

    // 6. Pick up sagas a previous process left unfinished
    if let Err(e) = runner.recover().await {
        tracing::error!(error = %e, "saga recovery failed");
    }

    // 7. Build the application
    let app = api::create_app(AppState::new(Arc::clone(&runner)), metrics_handle);

    // 8. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting order saga service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 9. Let running sagas, including compensation, finish
    if tokio::time::timeout(config.shutdown_timeout, runner.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = runner.in_flight(),
            "shutdown timeout elapsed with sagas still running"
        );
    }

    tracing::info!("server shut down gracefully");
}
