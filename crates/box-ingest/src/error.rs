use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use crate::atomic::AtomicWriteError;
use crate::catalog::{CatalogError, CatalogMiss};

/// Everything that can end an upload early. Variants follow the order in which
/// an upload can fail: client input, transport, integrity, catalog.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("File size {size} exceeds the maximum allowed size of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("{0}")]
    NotFound(CatalogMiss),
    #[error("upload stream failed: {0}")]
    Transport(String),
    #[error("upload cancelled before completion")]
    Cancelled,
    #[error("File size mismatch")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Checksum verification failed")]
    ChecksumMismatch { algorithm: String, expected: String, actual: String },
    #[error("Missing chunks: {}", join_indices(.0))]
    MissingChunks(Vec<u32>),
    #[error("Chunk size mismatch: expected {expected}, got {actual}")]
    ChunkSizeMismatch { index: u32, expected: u64, actual: u64 },
    #[error("{0}")]
    CatalogRace(CatalogMiss),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

fn join_indices(v: &[u32]) -> String { v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ") }

impl From<AtomicWriteError> for UploadError {
    fn from(e: AtomicWriteError) -> Self { Self::Storage(e.into()) }
}

impl From<CatalogError> for UploadError {
    fn from(e: CatalogError) -> Self {
        match e { CatalogError::NotFound(miss) => Self::NotFound(miss), CatalogError::Backend(msg) => Self::Catalog(msg) }
    }
}

impl UploadError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::NotFound(_) => "not_found",
            Self::Transport(_) => "transport",
            Self::Cancelled => "cancelled",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::MissingChunks(_) => "missing_chunks",
            Self::ChunkSizeMismatch { .. } => "chunk_size_mismatch",
            Self::CatalogRace(_) => "catalog_race",
            Self::Catalog(_) => "catalog",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub message: String, pub error: Option<String>, pub details: Option<serde_json::Value> }

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), error: None, details: None }
    }
    pub fn with_error(mut self, error: impl Into<String>) -> Self { self.error = Some(error.into()); self }
    pub fn with_details(mut self, details: serde_json::Value) -> Self { self.details = Some(details); self }
    pub fn invalid_request(msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, msg).with_error("INVALID_REQUEST") }
    pub fn file_too_large(msg: impl Into<String>) -> Self { Self::new(StatusCode::PAYLOAD_TOO_LARGE, msg).with_error("FILE_TOO_LARGE") }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg) }
    pub fn service_unavailable() -> Self { Self::new(StatusCode::SERVICE_UNAVAILABLE, "Upload capacity exhausted").with_error("UPLOAD_ERROR") }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        let message = e.to_string();
        match e {
            UploadError::InvalidRequest(_) => Self::invalid_request(message),
            UploadError::FileTooLarge { size, limit } => Self::file_too_large(message)
                .with_details(serde_json::json!({ "fileSize": size, "maxFileSize": limit })),
            UploadError::NotFound(_) => Self::not_found(message),
            UploadError::Transport(_) | UploadError::Cancelled => Self::internal(message).with_error("UPLOAD_ERROR"),
            UploadError::SizeMismatch { expected, actual } => Self::internal(message)
                .with_error(format!("expected {expected} bytes, received {actual}"))
                .with_details(serde_json::json!({ "expectedSize": expected, "actualSize": actual })),
            UploadError::ChecksumMismatch { algorithm, expected, actual } => Self::internal(message)
                .with_error(format!("{algorithm} digest {actual} does not match expected {expected}")),
            UploadError::MissingChunks(ref missing) => Self::internal(message.clone())
                .with_error(message)
                .with_details(serde_json::json!({ "missingChunks": missing })),
            UploadError::ChunkSizeMismatch { index, .. } => Self::internal(message.clone())
                .with_error(format!("chunk {index}: {message}")),
            UploadError::CatalogRace(_) => Self::internal(message)
                .with_error("catalog entry disappeared during upload; file left in storage for reconciliation"),
            UploadError::Catalog(detail) => Self::internal("Catalog update failed").with_error(detail),
            UploadError::Storage(io) => Self::internal("Storage operation failed").with_error(io.to_string()),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.status, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { message: self.message, error: self.error, details: self.details };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
