//! Binary entrypoint for the box ingestion service.
use anyhow::Context;
use axum::{body::Body, http::Request, middleware::{self, Next}, response::Response};
use box_ingest::catalog::{CatalogReconciler, MemoryCatalog};
use box_ingest::config::{CatalogMode, ConfigStore};
use box_ingest::coordinator::UploadCoordinator;
use box_ingest::services::catalog::PgCatalog;
use box_ingest::storage::StorageLayout;
use box_ingest::telemetry::{init_tracing, normalize_path, HTTP_REQUESTS};
use box_ingest::{build_router, db::init_db, AppState};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let resp = next.run(req).await;
    let status = resp.status().as_u16().to_string();
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), status.as_str()]).inc();
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = ConfigStore::from_env();
    let cfg = store.load_or_default().await;
    init_tracing(cfg.log_format);
    if !store.exists() {
        match store.save(&cfg).await {
            Ok(()) => info!(path = %store.path().display(), "config.default_written"),
            Err(e) => warn!(path = %store.path().display(), error = %format!("{e:#}"), "config.default_write_failed"),
        }
    }

    tokio::fs::create_dir_all(&cfg.storage_root).await
        .with_context(|| format!("create storage root {}", cfg.storage_root.display()))?;

    let catalog: Arc<dyn CatalogReconciler> = match cfg.catalog {
        CatalogMode::Postgres => {
            let url = cfg.database_url.clone().context("catalog: postgres requires database_url or DATABASE_URL")?;
            let pool = init_db(&url, (cfg.max_concurrent_uploads as u32).clamp(5, 50)).await?;
            Arc::new(PgCatalog::new(pool))
        }
        CatalogMode::Memory => {
            warn!("catalog.memory: records are lost on restart");
            Arc::new(MemoryCatalog::new())
        }
    };

    let limits = cfg.limits();
    let layout = StorageLayout::new(&cfg.storage_root, cfg.artifact_file_name.clone());
    let coordinator = UploadCoordinator::new(layout, catalog.clone(), limits);
    let state = AppState::new(coordinator, catalog, cfg.max_concurrent_uploads);
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics));

    let addr: SocketAddr = cfg.listen_addr.parse().with_context(|| format!("invalid listen_addr {}", cfg.listen_addr))?;
    info!(%addr, storage_root = %cfg.storage_root.display(), max_bytes = limits.max_bytes, catalog = ?cfg.catalog, "box-ingest listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { warn!(error = %e, "shutdown.signal_unavailable"); std::future::pending::<()>().await; }
        info!("shutdown.signal received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
