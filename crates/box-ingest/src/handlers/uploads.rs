use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_LENGTH, HeaderMap};
use axum::Json;
use serde::Serialize;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use utoipa::ToSchema;
use crate::{AppState, chunks::ChunkSpec, storage::UploadTarget};
use crate::coordinator::{ChecksumSpec, ChunkProgress, UploadMethod, UploadOutcome, UploadRequest, UploadSummary};
use crate::error::{ApiError, ApiResult, UploadError};
use crate::telemetry::{UPLOADS_IN_PROGRESS, UPLOAD_BYTES, UPLOAD_DURATION, UPLOAD_OUTCOMES};

pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";
pub const CHECKSUM_HEADER: &str = "x-checksum";
pub const CHECKSUM_TYPE_HEADER: &str = "x-checksum-type";

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadCompleteResponse { pub message: String, pub details: UploadSummary }

#[derive(Debug, Serialize, ToSchema)]
pub struct ChunkAcceptedResponse { pub message: String, pub details: ChunkProgress }

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum UploadResponse { Completed(UploadCompleteResponse), ChunkAccepted(ChunkAcceptedResponse) }

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkListResponse { pub chunks: Vec<u32>, pub count: usize }

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse { pub message: String }

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

/// Translate request headers into an [`UploadRequest`]. Only size and chunk
/// headers can be malformed; checksum headers are opt-in and never rejected.
pub fn parse_upload_request(target: UploadTarget, method: UploadMethod, headers: &HeaderMap) -> Result<UploadRequest, UploadError> {
    let content_length = match headers.get(CONTENT_LENGTH) {
        None => None,
        Some(v) => Some(v.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| UploadError::InvalidRequest("Invalid Content-Length header".into()))?),
    };
    let chunk = match (header_str(headers, CHUNK_INDEX_HEADER), header_str(headers, TOTAL_CHUNKS_HEADER)) {
        (Some(index), Some(total)) => Some(ChunkSpec::parse(index, total)?),
        (None, None) => None,
        (index, total) => {
            debug!(index = ?index, total = ?total, "chunk_headers_incomplete_single_shot");
            None
        }
    };
    let checksum = match (header_str(headers, CHECKSUM_HEADER), header_str(headers, CHECKSUM_TYPE_HEADER)) {
        (Some(value), Some(algorithm)) if !algorithm.eq_ignore_ascii_case("null") => Some(ChecksumSpec { value: value.to_string(), algorithm: algorithm.to_string() }),
        _ => None,
    };
    Ok(UploadRequest { target, method, content_length, checksum, chunk })
}

/// Create upload (single request or one chunk of a set)
#[utoipa::path(post, path = "/api/organization/{organization}/box/{box}/version/{version}/provider/{provider}/architecture/{architecture}/file/upload",
    params(("organization" = String, Path,), ("box" = String, Path,), ("version" = String, Path,), ("provider" = String, Path,), ("architecture" = String, Path,)),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, body = UploadResponse),
        (status = 400, body = crate::error::ApiErrorBody),
        (status = 404, body = crate::error::ApiErrorBody),
        (status = 413, body = crate::error::ApiErrorBody),
        (status = 500, body = crate::error::ApiErrorBody)
    ), tag = "uploads")]
pub async fn create_upload(State(state): State<AppState>, Path(target): Path<UploadTarget>, headers: HeaderMap, body: Body) -> ApiResult<Json<UploadResponse>> {
    run_upload(state, target, UploadMethod::Create, headers, body).await
}

/// Replace upload; keeps the catalog record's download count
#[utoipa::path(put, path = "/api/organization/{organization}/box/{box}/version/{version}/provider/{provider}/architecture/{architecture}/file/upload",
    params(("organization" = String, Path,), ("box" = String, Path,), ("version" = String, Path,), ("provider" = String, Path,), ("architecture" = String, Path,)),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, body = UploadResponse),
        (status = 400, body = crate::error::ApiErrorBody),
        (status = 413, body = crate::error::ApiErrorBody),
        (status = 500, body = crate::error::ApiErrorBody)
    ), tag = "uploads")]
pub async fn replace_upload(State(state): State<AppState>, Path(target): Path<UploadTarget>, headers: HeaderMap, body: Body) -> ApiResult<Json<UploadResponse>> {
    run_upload(state, target, UploadMethod::Replace, headers, body).await
}

async fn run_upload(state: AppState, target: UploadTarget, method: UploadMethod, headers: HeaderMap, body: Body) -> ApiResult<Json<UploadResponse>> {
    let start = Instant::now();
    target.validate().map_err(record_failure)?;
    let req = parse_upload_request(target, method, &headers).map_err(record_failure)?;
    let _permit = state.upload_permits.clone().acquire_owned().await.map_err(|_| ApiError::service_unavailable())?;
    struct InProgress;
    impl Drop for InProgress { fn drop(&mut self) { UPLOADS_IN_PROGRESS.dec(); } }
    UPLOADS_IN_PROGRESS.inc();
    let _g = InProgress;
    // cancelled when this future is dropped, e.g. on client disconnect
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let outcome = state.coordinator.handle(&req, body.into_data_stream(), &cancel).await.map_err(record_failure)?;
    UPLOAD_DURATION.observe(start.elapsed().as_secs_f64());
    match outcome {
        UploadOutcome::ChunkAccepted(progress) => {
            UPLOAD_OUTCOMES.with_label_values(&["chunk_accepted"]).inc();
            UPLOAD_BYTES.inc_by(progress.bytes_received);
            Ok(Json(UploadResponse::ChunkAccepted(ChunkAcceptedResponse { message: "Chunk upload completed".into(), details: progress })))
        }
        UploadOutcome::Completed(summary) => {
            UPLOAD_OUTCOMES.with_label_values(&["completed"]).inc();
            UPLOAD_BYTES.inc_by(summary.bytes_received);
            info!(upload = %req.target, size = summary.file_size, ms = start.elapsed().as_millis() as u64, "upload_request_done");
            Ok(Json(UploadResponse::Completed(UploadCompleteResponse { message: "File upload completed".into(), details: summary })))
        }
    }
}

fn record_failure(e: UploadError) -> ApiError {
    UPLOAD_OUTCOMES.with_label_values(&[e.kind()]).inc();
    e.into()
}

/// Chunk indices already stored for a target, for resuming an interrupted upload
#[utoipa::path(get, path = "/api/organization/{organization}/box/{box}/version/{version}/provider/{provider}/architecture/{architecture}/file/upload/chunks",
    params(("organization" = String, Path,), ("box" = String, Path,), ("version" = String, Path,), ("provider" = String, Path,), ("architecture" = String, Path,)),
    responses((status = 200, body = ChunkListResponse), (status = 400, body = crate::error::ApiErrorBody)), tag = "uploads")]
pub async fn list_chunks(State(state): State<AppState>, Path(target): Path<UploadTarget>) -> ApiResult<Json<ChunkListResponse>> {
    target.validate()?;
    let chunks: Vec<u32> = state.coordinator.chunks().list_chunks(&target).await?.into_iter().collect();
    Ok(Json(ChunkListResponse { count: chunks.len(), chunks }))
}

/// Abandon a partially uploaded chunk set
#[utoipa::path(delete, path = "/api/organization/{organization}/box/{box}/version/{version}/provider/{provider}/architecture/{architecture}/file/upload/chunks",
    params(("organization" = String, Path,), ("box" = String, Path,), ("version" = String, Path,), ("provider" = String, Path,), ("architecture" = String, Path,)),
    responses((status = 200, body = MessageResponse), (status = 400, body = crate::error::ApiErrorBody)), tag = "uploads")]
pub async fn abandon_chunks(State(state): State<AppState>, Path(target): Path<UploadTarget>) -> ApiResult<Json<MessageResponse>> {
    target.validate()?;
    state.coordinator.chunks().cleanup(&target).await;
    info!(upload = %target, "chunk_set_abandoned");
    Ok(Json(MessageResponse { message: "Chunk set removed".into() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn target() -> UploadTarget { UploadTarget::new("acme", "ubuntu", "1.0.0", "virtualbox", "amd64").unwrap() }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs { h.insert(*k, HeaderValue::from_static(v)); }
        h
    }

    #[test]
    fn classifies_requests() {
        let single = parse_upload_request(target(), UploadMethod::Create, &headers(&[("content-length", "100")])).unwrap();
        assert_eq!(single.content_length, Some(100));
        assert!(single.chunk.is_none() && single.checksum.is_none());

        let chunked = parse_upload_request(target(), UploadMethod::Create, &headers(&[("x-chunk-index", "1"), ("x-total-chunks", "3")])).unwrap();
        assert_eq!(chunked.chunk, Some(ChunkSpec { index: 1, total: 3 }));

        let lone = parse_upload_request(target(), UploadMethod::Create, &headers(&[("x-chunk-index", "1")])).unwrap();
        assert!(lone.chunk.is_none());
    }

    #[test]
    fn rejects_malformed_size_and_chunk_headers() {
        assert!(matches!(parse_upload_request(target(), UploadMethod::Create, &headers(&[("content-length", "12abc")])), Err(UploadError::InvalidRequest(_))));
        assert!(matches!(parse_upload_request(target(), UploadMethod::Create, &headers(&[("x-chunk-index", "3"), ("x-total-chunks", "3")])), Err(UploadError::InvalidRequest(_))));
    }

    #[test]
    fn checksum_needs_both_headers() {
        let h = headers(&[("x-checksum", "abc"), ("x-checksum-type", "SHA256")]);
        let req = parse_upload_request(target(), UploadMethod::Replace, &h).unwrap();
        assert_eq!(req.checksum, Some(ChecksumSpec { value: "abc".into(), algorithm: "SHA256".into() }));
        assert!(parse_upload_request(target(), UploadMethod::Create, &headers(&[("x-checksum", "abc")])).unwrap().checksum.is_none());
        assert!(parse_upload_request(target(), UploadMethod::Create, &headers(&[("x-checksum", "abc"), ("x-checksum-type", "NULL")])).unwrap().checksum.is_none());
    }
}
