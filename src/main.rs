use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use visitrack::config::Config;
use visitrack::{api, connect_store, Registry, VisitTracker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visitrack=info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    let registry = Arc::new(Registry::from_definition(config.registry.clone())?);
    for visitable in registry.visitable_types() {
        info!(visitable, "registered visitable type");
    }

    info!(backend = ?config.database.backend, url = %config.database.url, "Initializing database...");
    let store = connect_store(&config.database, registry.extra_columns()).await?;
    info!("Database initialized successfully");

    let tracker = Arc::new(VisitTracker::new(store, registry));
    let router = api::create_api_router(tracker, config.proxy.clone());

    let addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
