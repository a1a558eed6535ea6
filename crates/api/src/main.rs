//! Subledger API Server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use subledger_api::{create_router, AppState, Config, Tracker};
use subledger_billing::BillingService;
use subledger_shared::{
    create_pool, run_migrations, AccountLocks, AccountStore, InMemoryAccountStore, PgAccountStore,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,subledger_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Subledger API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let store: Arc<dyn AccountStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            run_migrations(&pool).await?;
            tracing::info!("Database connection established");
            Arc::new(PgAccountStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, accounts are kept in memory only");
            Arc::new(InMemoryAccountStore::new())
        }
    };

    let locks = AccountLocks::new();
    let billing = BillingService::from_env(store.clone(), locks.clone())?;
    tracing::info!("Stripe billing service initialized");

    let tracker = Tracker::from_config(
        config.analytics_endpoint.as_deref(),
        config.analytics_token.clone(),
    )?;

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .allow_credentials(true);

    let addr: SocketAddr = config.bind_address.parse()?;

    let state = AppState::new(config, store, billing, locks, tracker);
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
