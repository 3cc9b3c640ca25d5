use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;

use sendgrid_hook_common::ingest::Ingestor;
use sendgrid_hook_common::metrics::setup_metrics_routes;
use sendgrid_hook_common::store::EventStore;

mod config;
mod handlers;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;

    tracing::info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = EventStore::new(
        &config.database_url,
        config.max_pg_connections,
        "sendgrid-hook-api",
    )?;

    if config.run_migrations {
        sqlx::migrate!("../migrations").run(store.pool()).await?;
    }

    let ingestor = Ingestor::new(store, config.ingest.clone());

    let app = handlers::add_routes(
        Router::new(),
        ingestor,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = if config.export_prometheus {
        setup_metrics_routes(app)?
    } else {
        app
    };

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start sendgrid-hook-api http server, {}", e),
    }

    Ok(())
}
