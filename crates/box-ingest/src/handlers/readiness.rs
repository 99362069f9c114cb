use axum::{Json, extract::State};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReadinessResponse { pub status: &'static str }

/// Readiness probe: pings the catalog backend
#[utoipa::path(get, path = "/readyz", responses(
	(status = 200, body = ReadinessResponse, description = "Service ready"),
	(status = 503, body = ReadinessResponse, description = "Catalog not reachable")
))]
pub async fn readiness(State(state): State<AppState>) -> (axum::http::StatusCode, Json<ReadinessResponse>) {
	match state.catalog.ping().await {
		Ok(()) => (axum::http::StatusCode::OK, Json(ReadinessResponse { status: "ready" })),
		Err(e) => {
			tracing::warn!(error = %e, "readiness_catalog_unreachable");
			(axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(ReadinessResponse { status: "degraded" }))
		}
	}
}
