pub mod atomic;
pub mod catalog;
pub mod checksum;
pub mod chunks;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod drain;
pub mod error;
pub mod handlers;
pub mod models;
pub mod safe_fs;
pub mod services;
pub mod storage;
pub mod telemetry;

use axum::{Router, extract::DefaultBodyLimit, routing::{get, post}};
use handlers::{health::health, readiness::readiness, uploads::{create_upload, replace_upload, list_chunks, abandon_chunks}};
use std::sync::Arc;
use tokio::sync::Semaphore;
use utoipa::OpenApi;
use crate::catalog::CatalogReconciler;
use crate::coordinator::UploadCoordinator;
use crate::telemetry::metrics_handler;

pub const UPLOAD_ROUTE: &str = "/api/organization/:organization/box/:box/version/:version/provider/:provider/architecture/:architecture/file/upload";
pub const CHUNKS_ROUTE: &str = "/api/organization/:organization/box/:box/version/:version/provider/:provider/architecture/:architecture/file/upload/chunks";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<UploadCoordinator>,
    pub catalog: Arc<dyn CatalogReconciler>,
    pub upload_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(coordinator: UploadCoordinator, catalog: Arc<dyn CatalogReconciler>, max_concurrent_uploads: usize) -> Self {
        Self { coordinator: Arc::new(coordinator), catalog, upload_permits: Arc::new(Semaphore::new(max_concurrent_uploads.max(1))) }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::uploads::create_upload,
        handlers::uploads::replace_upload,
        handlers::uploads::list_chunks,
        handlers::uploads::abandon_chunks,
    ),
    components(schemas(
        error::ApiErrorBody,
        handlers::uploads::UploadResponse,
        handlers::uploads::UploadCompleteResponse,
        handlers::uploads::ChunkAcceptedResponse,
        handlers::uploads::ChunkListResponse,
        handlers::uploads::MessageResponse,
        coordinator::UploadSummary,
        coordinator::ChunkProgress,
        coordinator::ChecksumStatus,
        coordinator::FileStatus,
    )),
    tags( (name = "uploads", description = "Box artifact ingestion") )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route(UPLOAD_ROUTE, post(create_upload).put(replace_upload))
        .route(CHUNKS_ROUTE, get(list_chunks).delete(abandon_chunks))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        // bodies are streamed to disk; the coordinator enforces the size ceiling
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::{Request, StatusCode}, body::Body};
    use tower::util::ServiceExt;
    use serde_json::json;
    use crate::catalog::MemoryCatalog;
    use crate::coordinator::UploadLimits;
    use crate::storage::StorageLayout;

    fn app(root: &std::path::Path) -> Router {
        let catalog: Arc<MemoryCatalog> = Arc::new(MemoryCatalog::new());
        let limits = UploadLimits { max_bytes: 1024, size_tolerance: 0 };
        let coordinator = UploadCoordinator::new(StorageLayout::new(root, "vagrant.box"), catalog.clone(), limits);
        build_router(AppState::new(coordinator, catalog, 4))
    }

    #[tokio::test]
    async fn health_ok() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(dir.path()).oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"status":"ok","version":env!("CARGO_PKG_VERSION")}));
    }

    #[tokio::test]
    async fn readiness_ok_with_memory_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(dir.path()).oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn openapi_lists_upload_paths() {
        let dir = tempfile::tempdir().unwrap();
        let res = app(dir.path()).oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v["paths"].get("/api/organization/{organization}/box/{box}/version/{version}/provider/{provider}/architecture/{architecture}/file/upload").is_some());
    }
}
