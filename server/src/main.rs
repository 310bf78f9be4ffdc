//! Timetable Server binary.

use timetable_server::config::Config;
use timetable_server::db::DocumentStore;
use timetable_server::{build_app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timetable_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        site_id = %config.site_id,
        "Starting Timetable Server on {}:{}",
        config.host,
        config.port
    );

    let store = match &config.database_url {
        Some(url) => DocumentStore::connect(url).await?,
        None => {
            tracing::warn!("DATABASE_URL not set, documents are kept in memory");
            DocumentStore::memory()
        }
    };

    let sweep_interval = config.sweep_interval;
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState::new(config, store);
    let reaper = state.sessions.spawn_reaper(sweep_interval);
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    reaper.abort();
    Ok(())
}
