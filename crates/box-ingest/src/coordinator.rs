//! The upload state machine.
//!
//! Every request starts in [`UploadState::Idle`] and advances one transition
//! function at a time until it reaches `Done` or fails. A failure in any state
//! is returned as an [`UploadError`]; temp artifacts are released by the
//! `StagedFile`/`PendingChunk` guards or deleted explicitly where the failure
//! requires it.
use crate::catalog::{CatalogError, CatalogReconciler, FileRecordInput};
use crate::checksum::{self, Verification};
use crate::chunks::{ChunkCommit, ChunkSpec, ChunkStore};
use crate::drain::drain;
use crate::error::UploadError;
use crate::models::FileRecord;
use crate::storage::{StagedFile, StorageLayout, UploadTarget};
use crate::telemetry::CHUNK_MERGES;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMethod { Create, Replace }

impl UploadMethod {
    pub fn as_str(&self) -> &'static str { match self { Self::Create => "create", Self::Replace => "replace" } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumSpec { pub value: String, pub algorithm: String }

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub target: UploadTarget,
    pub method: UploadMethod,
    pub content_length: Option<u64>,
    pub checksum: Option<ChecksumSpec>,
    pub chunk: Option<ChunkSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_bytes: u64,
    /// Allowed |declared - received| before a size mismatch is raised.
    pub size_tolerance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumStatus { Matched, Skipped, NotRequested }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus { Created, Updated }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProgress {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    pub chunks_received: usize,
    /// True when a concurrent request already merged (or abandoned) the set.
    pub merged: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub file_name: String,
    pub file_size: u64,
    pub bytes_received: u64,
    pub status: FileStatus,
    pub chunked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_merged: Option<u32>,
    pub checksum: ChecksumStatus,
    #[serde(skip)]
    pub record: Option<FileRecord>,
}

#[derive(Debug, Clone)]
pub enum UploadOutcome {
    ChunkAccepted(ChunkProgress),
    Completed(UploadSummary),
}

/// Bytes that made it to a staged file, plus how they got there.
#[derive(Debug)]
pub struct Received {
    staged: StagedFile,
    bytes_received: u64,
    chunks_merged: Option<u32>,
}

#[derive(Debug)]
pub struct Placed {
    path: PathBuf,
    size: u64,
    bytes_received: u64,
    chunks_merged: Option<u32>,
    checksum: ChecksumStatus,
}

#[derive(Debug)]
pub enum UploadState {
    Idle,
    Receiving,
    Complete(Received),
    AwaitingMoreChunks(ChunkProgress),
    Merging { spec: ChunkSpec, bytes_received: u64 },
    Verifying(Received),
    Placing(Received, ChecksumStatus),
    CatalogUpdating(Placed),
    Done(UploadOutcome),
}

impl UploadState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Receiving => "receiving",
            Self::Complete(_) => "complete",
            Self::AwaitingMoreChunks(_) => "awaiting_more_chunks",
            Self::Merging { .. } => "merging",
            Self::Verifying(_) => "verifying",
            Self::Placing(..) => "placing",
            Self::CatalogUpdating(_) => "catalog_updating",
            Self::Done(_) => "done",
        }
    }
}

pub struct UploadCoordinator {
    layout: StorageLayout,
    chunks: ChunkStore,
    catalog: Arc<dyn CatalogReconciler>,
    limits: UploadLimits,
}

impl UploadCoordinator {
    pub fn new(layout: StorageLayout, catalog: Arc<dyn CatalogReconciler>, limits: UploadLimits) -> Self {
        Self { chunks: ChunkStore::new(layout.clone()), layout, catalog, limits }
    }

    pub fn chunks(&self) -> &ChunkStore { &self.chunks }
    pub fn layout(&self) -> &StorageLayout { &self.layout }
    pub fn limits(&self) -> UploadLimits { self.limits }

    /// Drive one request to completion. `body` is only read in `Receiving`.
    pub async fn handle<S, E>(&self, req: &UploadRequest, body: S, cancel: &CancellationToken) -> Result<UploadOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut body = Some(body);
        let mut state = UploadState::Idle;
        loop {
            let name = state.name();
            debug!(upload = %req.target, state = name, "upload_state");
            let step = match state {
                UploadState::Idle => self.on_idle(req).await,
                UploadState::Receiving => match body.take() {
                    Some(body) => self.on_receiving(req, body, cancel).await,
                    None => Err(UploadError::Transport("request body already consumed".into())),
                },
                UploadState::Complete(received) => Ok(UploadState::Verifying(received)),
                UploadState::Merging { spec, bytes_received } => self.on_merging(req, cancel, spec, bytes_received).await,
                UploadState::AwaitingMoreChunks(progress) => Ok(UploadState::Done(UploadOutcome::ChunkAccepted(progress))),
                UploadState::Verifying(received) => self.on_verifying(req, cancel, received).await,
                UploadState::Placing(received, checksum) => self.on_placing(req, cancel, received, checksum).await,
                UploadState::CatalogUpdating(placed) => self.on_catalog_updating(req, placed).await,
                UploadState::Done(outcome) => return Ok(outcome),
            };
            state = match step {
                Ok(next) => next,
                Err(e) => {
                    match &e {
                        UploadError::Storage(_) | UploadError::Catalog(_) => error!(upload = %req.target, state = name, kind = e.kind(), error = %e, "upload_failed"),
                        _ => warn!(upload = %req.target, state = name, kind = e.kind(), error = %e, "upload_failed"),
                    }
                    return Err(e);
                }
            };
        }
    }

    /// Pre-I/O checks: declared size and catalog chain.
    async fn on_idle(&self, req: &UploadRequest) -> Result<UploadState, UploadError> {
        if let Some(declared) = req.content_length {
            if declared > self.limits.max_bytes {
                return Err(UploadError::FileTooLarge { size: declared, limit: self.limits.max_bytes });
            }
        }
        self.catalog.resolve_chain(&req.target).await?;
        Ok(UploadState::Receiving)
    }

    async fn on_receiving<S, E>(&self, req: &UploadRequest, body: S, cancel: &CancellationToken) -> Result<UploadState, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let target = &req.target;
        match req.chunk {
            Some(spec) => {
                let mut pending = self.chunks.begin_chunk(target, spec).await?;
                let written = drain(body, pending.file(), self.limits.max_bytes, cancel).await.into_result(self.limits.max_bytes)?;
                if let Err(e) = self.reconcile_size(req.content_length, written) {
                    pending.discard().await;
                    return Err(e);
                }
                match pending.commit().await? {
                    ChunkCommit::Stored(recorded) => {
                        info!(upload = %target, index = spec.index, total = spec.total, bytes = recorded, "chunk_accepted");
                        Ok(UploadState::Merging { spec, bytes_received: written })
                    }
                    ChunkCommit::SetConsumed => {
                        info!(upload = %target, index = spec.index, total = spec.total, "chunk_arrived_after_merge");
                        Ok(UploadState::AwaitingMoreChunks(ChunkProgress {
                            chunk_index: spec.index,
                            total_chunks: spec.total,
                            bytes_received: written,
                            chunks_received: 0,
                            merged: true,
                        }))
                    }
                }
            }
            None => {
                tokio::fs::create_dir_all(self.layout.target_dir(target)).await?;
                let mut staged = StagedFile::new(self.layout.staging_path(target, "upload"), 0);
                let mut file = tokio::fs::File::create(staged.path()).await?;
                let written = drain(body, &mut file, self.limits.max_bytes, cancel).await.into_result(self.limits.max_bytes)?;
                file.sync_all().await?;
                drop(file);
                if let Err(e) = self.reconcile_size(req.content_length, written) {
                    staged.discard().await;
                    return Err(e);
                }
                staged.set_size(written);
                Ok(UploadState::Complete(Received { staged, bytes_received: written, chunks_merged: None }))
            }
        }
    }

    fn reconcile_size(&self, declared: Option<u64>, actual: u64) -> Result<(), UploadError> {
        match declared {
            Some(expected) if expected.abs_diff(actual) > self.limits.size_tolerance => Err(UploadError::SizeMismatch { expected, actual }),
            _ => Ok(()),
        }
    }

    async fn on_merging(&self, req: &UploadRequest, cancel: &CancellationToken, spec: ChunkSpec, bytes_received: u64) -> Result<UploadState, UploadError> {
        let target = &req.target;
        match self.chunks.try_merge(target, spec.total, self.limits.max_bytes, cancel).await? {
            Some(staged) => {
                CHUNK_MERGES.inc();
                Ok(UploadState::Verifying(Received { staged, bytes_received, chunks_merged: Some(spec.total) }))
            }
            None => {
                let present = self.chunks.list_chunks(target).await?;
                // an empty set right after our own commit means a concurrent request merged it
                let merged = present.is_empty();
                Ok(UploadState::AwaitingMoreChunks(ChunkProgress {
                    chunk_index: spec.index,
                    total_chunks: spec.total,
                    bytes_received,
                    chunks_received: present.range(..spec.total).count(),
                    merged,
                }))
            }
        }
    }

    async fn on_verifying(&self, req: &UploadRequest, cancel: &CancellationToken, received: Received) -> Result<UploadState, UploadError> {
        let Some(spec) = &req.checksum else { return Ok(UploadState::Placing(received, ChecksumStatus::NotRequested)) };
        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            v = checksum::verify(received.staged.path(), &spec.value, &spec.algorithm) => v?,
        };
        match verdict {
            Verification::Matched => Ok(UploadState::Placing(received, ChecksumStatus::Matched)),
            Verification::Skipped => Ok(UploadState::Placing(received, ChecksumStatus::Skipped)),
            Verification::Mismatched { expected, actual } => {
                received.staged.discard().await;
                Err(UploadError::ChecksumMismatch { algorithm: spec.algorithm.to_ascii_lowercase(), expected, actual })
            }
        }
    }

    /// Last point where cancellation is honoured; past it the file is placed.
    async fn on_placing(&self, req: &UploadRequest, cancel: &CancellationToken, received: Received, checksum: ChecksumStatus) -> Result<UploadState, UploadError> {
        if cancel.is_cancelled() { return Err(UploadError::Cancelled); }
        let dest = self.layout.final_path(&req.target);
        let size = received.staged.size();
        received.staged.place(&dest).await?;
        debug!(upload = %req.target, path = %dest.display(), size, "artifact_placed");
        Ok(UploadState::CatalogUpdating(Placed { path: dest, size, bytes_received: received.bytes_received, chunks_merged: received.chunks_merged, checksum }))
    }

    /// The placed file stays on disk whatever happens here.
    async fn on_catalog_updating(&self, req: &UploadRequest, placed: Placed) -> Result<UploadState, UploadError> {
        let target = &req.target;
        let chain = match self.catalog.resolve_chain(target).await {
            Ok(chain) => chain,
            Err(CatalogError::NotFound(miss)) => {
                warn!(upload = %target, path = %placed.path.display(), missing = %miss, "catalog_race_orphaned_file");
                return Err(UploadError::CatalogRace(miss));
            }
            Err(e) => return Err(e.into()),
        };
        let input = FileRecordInput {
            file_name: self.layout.file_name().to_string(),
            file_size: i64::try_from(placed.size).unwrap_or(i64::MAX),
            checksum: req.checksum.as_ref().map(|c| c.value.trim().to_string()),
            checksum_type: req.checksum.as_ref().map(|c| c.algorithm.trim().to_string()),
        };
        let upserted = self.catalog.upsert_file_record(chain.architecture_id, &input).await?;
        let status = if upserted.created { FileStatus::Created } else { FileStatus::Updated };
        info!(upload = %target, method = req.method.as_str(), size = placed.size, status = ?status, chunked = placed.chunks_merged.is_some(), "upload_completed");
        Ok(UploadState::Done(UploadOutcome::Completed(UploadSummary {
            file_name: input.file_name,
            file_size: placed.size,
            bytes_received: placed.bytes_received,
            status,
            chunked: placed.chunks_merged.is_some(),
            chunks_merged: placed.chunks_merged,
            checksum: placed.checksum,
            record: Some(upserted.record),
        })))
    }
}
