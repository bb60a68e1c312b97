use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use relay_shared::clients::db::{create_pool, DbPool};

mod config;
mod dispatcher;
mod models;
mod outbox;
mod registry;
mod router;
mod routes;
mod scheduler;
mod schema;
mod signing;

use config::AppConfig;
use dispatcher::{DispatchJob, Dispatcher};
use router::Router as EventRouter;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    /// Entry point for SMS provider adapters (out of scope: no HTTP route
    /// is wired to it here, this is the contract boundary they call into).
    pub router: EventRouter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_shared::middleware::init_tracing("relay-engine");
    let metrics_handle = relay_shared::middleware::init_metrics();

    let config = AppConfig::load()?;
    let port = config.port;

    std::env::set_var("RELAY_JWT_SECRET", &config.jwt_secret);

    let db = create_pool(&config.database_url);

    let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel::<DispatchJob>(config.emit_channel_capacity);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let event_router = EventRouter::new(db.clone(), dispatch_tx.clone());

    let dispatcher = Dispatcher::new(
        db.clone(),
        config.dispatcher_concurrency,
        config.dispatcher_timeout_secs,
        shutdown_rx.clone(),
    )?;
    let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    tokio::spawn(dispatcher.run(dispatch_rx, grace));

    let stuck_threshold = std::time::Duration::from_secs(
        config.stuck_claim_multiplier as u64 * config.dispatcher_timeout_secs,
    );
    tokio::spawn(scheduler::run(
        db.clone(),
        std::time::Duration::from_secs(config.scheduler_tick_secs),
        config.scheduler_batch_size,
        stuck_threshold,
        dispatch_tx.clone(),
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        db,
        config,
        router: event_router,
    });

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/webhooks", post(routes::webhooks::create).get(routes::webhooks::list))
        .route(
            "/webhooks/:id",
            get(routes::webhooks::get)
                .put(routes::webhooks::update)
                .delete(routes::webhooks::delete),
        )
        .route("/webhooks/:id/rotate-secret", post(routes::webhooks::rotate_secret))
        .route("/webhooks/:id/test", post(routes::webhooks::test))
        .route("/webhooks/:id/events", get(routes::webhooks::events))
        .route("/webhooks/:id/stats", get(routes::webhooks::stats))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .layer(middleware::from_fn(relay_shared::middleware::metrics_middleware))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "relay-engine starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl-c handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}
