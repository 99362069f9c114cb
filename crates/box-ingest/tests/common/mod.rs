#![allow(dead_code)]
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use box_ingest::catalog::{CatalogReconciler, MemoryCatalog};
use box_ingest::coordinator::{UploadCoordinator, UploadLimits};
use box_ingest::storage::{StorageLayout, UploadTarget};
use box_ingest::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt; // for oneshot

pub const MAX_BYTES: u64 = 64 * 1024;

pub fn target() -> UploadTarget { UploadTarget::new("acme", "ubuntu", "1.0.0", "virtualbox", "amd64").unwrap() }

pub fn upload_uri(t: &UploadTarget) -> String {
    format!("/api/organization/{}/box/{}/version/{}/provider/{}/architecture/{}/file/upload", t.organization, t.box_name, t.version, t.provider, t.architecture)
}

pub struct Harness {
    pub dir: TempDir,
    pub layout: StorageLayout,
    pub memory: Arc<MemoryCatalog>,
    pub router: Router,
}

impl Harness {
    /// Router over a temp storage root and an in-memory catalog with `target()` registered.
    pub fn new() -> Self {
        let memory = Arc::new(MemoryCatalog::new());
        memory.register(&target());
        Self::with_catalog(memory.clone(), memory)
    }

    pub fn with_catalog(catalog: Arc<dyn CatalogReconciler>, memory: Arc<MemoryCatalog>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "vagrant.box");
        let limits = UploadLimits { max_bytes: MAX_BYTES, size_tolerance: 0 };
        let coordinator = UploadCoordinator::new(layout.clone(), catalog.clone(), limits);
        let router = build_router(AppState::new(coordinator, catalog, 8));
        Self { dir, layout, memory, router }
    }

    pub fn final_path(&self) -> PathBuf { self.layout.final_path(&target()) }

    pub fn chunk_dir(&self) -> PathBuf { self.layout.chunk_dir(&target()) }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let res = self.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let body = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let json = if body.is_empty() { serde_json::Value::Null } else { serde_json::from_slice(&body).unwrap() };
        (status, json)
    }

    /// Upload `body` to `target()` with a matching Content-Length plus `headers`.
    pub async fn upload(&self, method: &str, headers: &[(&str, &str)], body: &[u8]) -> (StatusCode, serde_json::Value) {
        let len = body.len().to_string();
        let mut all: Vec<(&str, &str)> = vec![("content-length", len.as_str())];
        all.extend_from_slice(headers);
        self.send(upload_request(method, &all, body.to_vec())).await
    }
}

pub fn upload_request(method: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(upload_uri(&target())).header("content-type", "application/octet-stream");
    for (k, v) in headers { builder = builder.header(*k, *v); }
    builder.body(Body::from(body)).unwrap()
}

/// True when no `.part` staging files are left in `dir`.
pub fn no_staging_leftovers(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir).map(|d| d.flatten().all(|e| !e.file_name().to_string_lossy().ends_with(".part"))).unwrap_or(true)
}
