use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iris_api::broker::{Broker, RedisBroker};
use iris_api::config::Config;
use iris_api::db::jobs::{JobApplicationStore, PgJobStore};
use iris_api::workflow::{HttpWorkflowTrigger, WorkflowTrigger};
use iris_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis_url)
            .await
            .expect("failed to connect to redis"),
    );

    let db = iris_api::db::pool::connect(&config.database_url)
        .expect("failed to build connection pool");
    let jobs: Arc<dyn JobApplicationStore> = Arc::new(PgJobStore::new(db));

    let workflows: Arc<dyn WorkflowTrigger> = Arc::new(HttpWorkflowTrigger::new(
        &config.workflow_url,
        &config.workflow_task_queue,
    ));

    tracing::info!(
        workflow_url = %config.workflow_url,
        task_queue = %config.workflow_task_queue,
        "iris-api configured"
    );

    let state = AppState::new(config, broker, jobs, workflows);
    let shutdown = state.shutdown.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(iris_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "iris-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // End open event streams so in-flight connections can drain.
            shutdown.cancel();
        })
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
