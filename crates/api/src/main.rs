//! Lead Billing API Server
//!
//! Receives lead deliveries and payment webhooks, serves the replacement API
//! and operator endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use leadgen_api::{create_router, AppState, Config};
use leadgen_billing::{BillingService, InvariantChecker, PgLedgerStore};
use leadgen_shared::{create_migration_pool, create_pool, run_migrations, DedupCache};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,leadgen_api=debug,leadgen_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lead Billing API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Migrations run on a dedicated single-connection pool
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    let dedup = match &config.redis_url {
        Some(url) => match DedupCache::connect_redis(url, config.dedup_ttl).await {
            Ok(cache) => {
                tracing::info!("Delivery dedup cache backed by Redis");
                cache
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, using in-memory dedup cache");
                DedupCache::new_in_memory(config.dedup_ttl)
            }
        },
        None => DedupCache::new_in_memory(config.dedup_ttl),
    };

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let billing = Arc::new(BillingService::new(config.billing.clone(), store)?);

    let state = AppState::new(billing, dedup, config.tokens.clone())
        .with_invariants(InvariantChecker::new(pool));

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
