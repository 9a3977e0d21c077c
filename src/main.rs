//! forohtoo watch-service entrypoint.
//!
//! Launches the Axum HTTP server exposing subscription management and the
//! transaction event stream, alongside the poll scheduler.
//!
//! Endpoints:
//! - `POST /api/v1/subscriptions` – register an address (201, or 402 with an invoice)
//! - `GET /api/v1/subscriptions` – list registrations
//! - `GET /api/v1/subscriptions/{address}` – registrations for one address
//! - `DELETE /api/v1/subscriptions/{address}` – unregister
//! - `GET /api/v1/stream/transactions[/{address}]` – SSE stream (history, then live)
//! - `GET /api/v1/workflows/{id}` – registration workflow status
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `DATABASE_URL`, `NATS_URL` name the backing services
//! - `OTEL_*` variables enable tracing export

use axum::Router;
use axum::http::Method;
use dashmap::DashMap;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use forohtoo::admin::AdminService;
use forohtoo::awaiter::TransactionAwaiter;
use forohtoo::config::Config;
use forohtoo::events::{EventLog, JetStreamEventLog};
use forohtoo::handlers::{self, AppState};
use forohtoo::poll::{PollEngine, PollTuning};
use forohtoo::rpc::{RpcPool, SolanaRpc};
use forohtoo::scheduler::{Schedules, Scheduler};
use forohtoo::shutdown::ShutdownSignal;
use forohtoo::store::{PostgresStore, Store};
use forohtoo::telemetry::Telemetry;
use forohtoo::workflow::{PollWorkflow, RegistrationWorkflow};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;

    let store: Arc<dyn Store> = Arc::new(
        PostgresStore::connect(config.database_url(), config.database_max_connections()).await?,
    );
    let events: Arc<dyn EventLog> = Arc::new(
        JetStreamEventLog::connect(
            config.nats_url(),
            config.event_stream_name(),
            config.event_retention(),
        )
        .await?,
    );
    let rpc: Arc<dyn SolanaRpc> = Arc::new(RpcPool::new(
        &config.rpc().mainnet,
        &config.rpc().devnet,
        config.rpc().timeout,
    ));

    let shutdown = ShutdownSignal::install()?.token();

    let engine = PollEngine::new(Arc::clone(&rpc), PollTuning::default());
    let poll_workflow = Arc::new(PollWorkflow::new(
        Arc::clone(&store),
        Arc::clone(&events),
        engine,
    ));
    let scheduler = Arc::new(Scheduler::new(poll_workflow, shutdown.clone()));
    scheduler.reconcile(store.as_ref()).await?;

    let admin = Arc::new(AdminService::new(
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn Schedules>,
    ));
    let awaiter = Arc::new(TransactionAwaiter::new(
        Arc::clone(&store),
        Arc::clone(&events),
    ));
    let registration = Arc::new(RegistrationWorkflow::new(
        Arc::clone(&store),
        Arc::clone(&admin),
        awaiter,
    ));
    registration.clone().resume_pending().await?;

    let state = AppState {
        store,
        events,
        admin,
        registration,
        fees: config.registration_fee().cloned(),
        stream: config.stream().clone(),
        pending: Arc::new(DashMap::new()),
    };

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let axum_cancellation_token = shutdown.clone();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
