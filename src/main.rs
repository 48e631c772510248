// =============================================================================
// WARD CAPACITY SERVICE - Main Entry Point
// =============================================================================
// WHAT THIS SERVICE DOES:
// - Assigns, releases and shifts beds between hospital departments
// - Keeps a per-department ledger of equipment and supplies
// - Runs the admission, transfer and discharge workflows
// - Exposes Prometheus metrics for observability
// - Optionally caches occupancy summaries in Redis
// =============================================================================

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ward_capacity::app::{self, AppState};
use ward_capacity::cache::OccupancyCache;
use ward_capacity::collaborators::{
    http_client, AssessmentService, BillingService, HttpAssessment, HttpBilling,
    LogOnlyAssessment, LogOnlyBilling,
};
use ward_capacity::config::{Config, StoreBackend};
use ward_capacity::metrics::setup_metrics;
use ward_capacity::store::{self, CapacityStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Environment and logging
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ward_capacity=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Ward Capacity Service...");

    // -------------------------------------------------------------------------
    // STEP 2: Configuration and metrics
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(port = config.port, backend = ?config.store_backend, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 3: Capacity store
    // -------------------------------------------------------------------------
    let store: Arc<dyn CapacityStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres backend"))?;
            let pg = PgStore::connect(url).await?;
            info!("Connected to PostgreSQL");
            pg.run_migrations().await?;
            info!("Database migrations completed");
            Arc::new(pg)
        }
        StoreBackend::Memory => {
            info!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    if config.seed_sample_data {
        store::seed_sample_data(store.as_ref()).await?;
    }

    // -------------------------------------------------------------------------
    // STEP 4: Redis cache
    // -------------------------------------------------------------------------
    let cache = match config.redis_url.as_deref() {
        Some(url) => {
            let cache = OccupancyCache::connect(url).await?;
            info!("Connected to Redis");
            cache
        }
        None => {
            info!("REDIS_URL not set, occupancy cache disabled");
            OccupancyCache::disabled()
        }
    };

    // -------------------------------------------------------------------------
    // STEP 5: Billing and assessment collaborators
    // -------------------------------------------------------------------------
    let client = http_client(config.collaborator_timeout)?;

    let billing: Arc<dyn BillingService> = match config.billing_url.as_deref() {
        Some(url) => {
            info!(url, "Billing service configured");
            Arc::new(HttpBilling::new(client.clone(), url))
        }
        None => Arc::new(LogOnlyBilling),
    };

    let assessment: Arc<dyn AssessmentService> = match config.assessment_url.as_deref() {
        Some(url) => {
            info!(url, "Assessment service configured");
            Arc::new(HttpAssessment::new(client, url))
        }
        None => Arc::new(LogOnlyAssessment),
    };

    // -------------------------------------------------------------------------
    // STEP 6: Application state and routes
    // -------------------------------------------------------------------------
    let state = Arc::new(AppState::new(
        store,
        billing,
        assessment,
        cache.clone(),
        metrics_handle,
    ));
    cache.spawn_invalidator(&state.feed);

    let app = app::router(state);

    // -------------------------------------------------------------------------
    // STEP 7: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Ward Capacity Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
