use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse { pub status: &'static str, pub version: &'static str }

/// Liveness probe; never touches storage or the catalog
#[utoipa::path(get, path = "/health", responses( (status = 200, body = HealthResponse) ))]
pub async fn health() -> Json<HealthResponse> { Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") }) }
