use axum::{Router, routing::get, routing::post, routing::put};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use canvass_api::AppState;
use canvass_api::batch_writer::{BatchWriter, spawn_writer_flusher};
use canvass_api::config::{CanvassConfig, Secrets};
use canvass_api::customers::CustomerDirectory;
use canvass_api::dataset_cache::{DatasetCache, spawn_lock_janitor};
use canvass_api::dataset_engine::{DatasetEngine, spawn_dataset_flusher};
use canvass_api::day_store::{DayStore, spawn_retention_cleanup};
use canvass_api::followmee::{FollowMeeClient, spawn_pull_scheduler};
use canvass_api::geocode::{DisabledGeocoder, GeocodeQueue, Geocoder, PrimaryGeocoder};
use canvass_api::handlers;
use canvass_api::reconciler::spawn_reconciler;
use canvass_api::sheet_store::{SheetsClient, TabularStore};
use canvass_api::tracking::{TrackingIngest, spawn_unknown_flusher};
use canvass_api::users::UserDirectory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("canvass_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("CANVASS_CONFIG").unwrap_or_else(|_| "./canvass.toml".to_string());
    let config = CanvassConfig::load(&config_path)?;
    let secrets = Secrets::from_env();

    // ── initialization in dependency order, leaves first ──

    let day_store = Arc::new(DayStore::open(&config.storage.data_root)?);
    tracing::info!("day store root: {}/user-logs", config.storage.data_root);

    let sheets_url = secrets
        .backing_store_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("CANVASS_SHEETS_URL must be set"))?;
    let sheets_document = secrets
        .backing_store_document
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("CANVASS_SHEETS_DOCUMENT must be set"))?;
    let sheets_token = secrets.backing_store_token.as_deref().unwrap_or_default();
    let store: Arc<dyn TabularStore> =
        Arc::new(SheetsClient::new(sheets_url, sheets_document, sheets_token)?);

    let geocoder: Arc<dyn Geocoder> = match &secrets.geocode_api_key {
        Some(key) => {
            let url = secrets
                .geocode_url
                .as_deref()
                .unwrap_or("https://eu1.locationiq.com/v1");
            Arc::new(PrimaryGeocoder::new(url, key)?)
        }
        None => {
            tracing::warn!("no geocoder key configured, addresses stay unvalidated");
            Arc::new(DisabledGeocoder)
        }
    };
    let geocode = GeocodeQueue::spawn(geocoder);

    let customers = Arc::new(CustomerDirectory::new(store.clone()));
    let users = Arc::new(UserDirectory::new(store.clone()));

    let cache = Arc::new(DatasetCache::new(std::time::Duration::from_millis(
        config.datasets.lock_timeout_ms,
    )));
    let engine = Arc::new(DatasetEngine::new(
        cache.clone(),
        store.clone(),
        geocode.clone(),
        customers.clone(),
        config.datasets.edit_window_days,
    ));
    // a cold cache would report every address as free; refuse to start
    engine.load().await?;

    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        config.writer.max_backoff_ms,
        &config.writer.fallback_file,
        &secrets.smtp,
    ));

    let tracking = Arc::new(TrackingIngest::new(
        day_store.clone(),
        writer.clone(),
        users.clone(),
        store.clone(),
    ));

    // ── background tasks ──

    spawn_lock_janitor(cache.clone());
    spawn_dataset_flusher(engine.clone(), config.datasets.flush_interval_ms);
    spawn_writer_flusher(writer.clone(), config.writer.flush_interval_ms);
    spawn_retention_cleanup(day_store.clone(), config.storage.retention_days);
    spawn_unknown_flusher(tracking.clone());
    spawn_reconciler(
        store.clone(),
        users.clone(),
        day_store.clone(),
        writer.clone(),
    );

    if let (Some(key), Some(tracker_user)) = (&secrets.tracker_api_key, &secrets.tracker_username)
    {
        let client = Arc::new(FollowMeeClient::new(
            "https://www.followmee.com",
            key,
            tracker_user,
        )?);
        spawn_pull_scheduler(
            client,
            users.clone(),
            tracking.clone(),
            config.tracker.pull_interval_secs,
            config.tracker.lookback_minutes,
        );
    } else {
        tracing::info!("tracker pull disabled, no FollowMee credentials");
    }

    let state = AppState {
        engine: engine.clone(),
        day_store: day_store.clone(),
        geocode,
        writer: writer.clone(),
        customers,
        users,
        tracking,
        external_push_key: secrets.external_push_key.clone(),
    };

    let app = Router::new()
        // Dataset endpoints
        .route(
            "/api/datasets",
            get(handlers::datasets::lookup).post(handlers::datasets::create_dataset),
        )
        .route(
            "/api/datasets/search-local",
            get(handlers::datasets::search_local),
        )
        .route(
            "/api/datasets/residents",
            put(handlers::datasets::update_resident),
        )
        .route(
            "/api/datasets/bulk-residents",
            put(handlers::datasets::bulk_update_residents),
        )
        .route(
            "/api/datasets/scan-preview",
            post(handlers::datasets::scan_preview),
        )
        .route(
            "/api/datasets/streets/suggestions",
            get(handlers::datasets::street_suggestions),
        )
        .route(
            "/api/datasets/streets/{street}",
            get(handlers::datasets::streets_overview),
        )
        .route(
            "/api/datasets/history/{username}/{date}",
            get(handlers::datasets::history),
        )
        .route("/api/datasets/{id}", get(handlers::datasets::get_by_id))
        // Tracking endpoints
        .route(
            "/api/tracking/location",
            post(handlers::tracking::post_location),
        )
        .route(
            "/api/tracking/actions",
            post(handlers::tracking::post_actions),
        )
        .route(
            "/api/tracking/external",
            post(handlers::tracking::external_push),
        )
        // Customer master list
        .route(
            "/api/customers",
            post(handlers::customers::create),
        )
        .route(
            "/api/customers/search",
            get(handlers::customers::search),
        )
        // Status
        .route(
            "/api/status/geocode-queue",
            get(handlers::status::geocode_queue),
        )
        .route("/api/status/writer", get(handlers::status::writer))
        .route(
            "/api/status/logs/{date}",
            get(handlers::status::day_store_stats),
        )
        .route("/healthz", get(handlers::status::healthz))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("canvass-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── teardown: flush what we can, keep store and cache consistent ──
    tracing::info!("shutting down, flushing dirty state");
    engine.flush_dirty().await;
    writer.flush_once().await;
    day_store.checkpoint_all_open();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("shutdown signal listener failed: {e}");
    }
}
