use axum::http::{header, Method};
use log::{error, info};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use support_desk::config::AppConfig;
use support_desk::tickets::{
    ticket_routes, BroadcastChangeFeed, MemoryTicketStore, TicketStore, TicketsState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    let feed = BroadcastChangeFeed::new(config.sync.feed_capacity);
    let store = build_store(&config, feed.clone()).await?;

    let state = TicketsState {
        store,
        feed: feed.clone(),
        admin: config.admin.clone(),
    };
    let app = ticket_routes(state).layer(cors_layer());

    let address = config.server.bind_address();
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            return Err(e.into());
        }
    };
    info!("Support desk listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(feed))
        .await?;
    Ok(())
}

async fn shutdown_signal(feed: BroadcastChangeFeed) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    feed.shutdown();
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

#[cfg(feature = "postgres")]
async fn build_store(
    config: &AppConfig,
    feed: BroadcastChangeFeed,
) -> anyhow::Result<Arc<dyn TicketStore>> {
    use support_desk::tickets::PgTicketStore;

    match &config.database {
        Some(db) => {
            let store = PgTicketStore::connect(&db.url, db.max_connections, feed)?;
            store.run_migrations().await?;
            info!("Using Postgres ticket store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, using in-memory ticket store");
            Ok(Arc::new(MemoryTicketStore::new(feed)))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store(
    config: &AppConfig,
    feed: BroadcastChangeFeed,
) -> anyhow::Result<Arc<dyn TicketStore>> {
    if config.database.is_some() {
        log::warn!("DATABASE_URL is set but postgres support is not compiled in");
    }
    info!("Using in-memory ticket store");
    Ok(Arc::new(MemoryTicketStore::new(feed)))
}
