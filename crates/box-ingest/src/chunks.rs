//! Chunk sets: one directory per upload target holding `chunk-<i>` files plus
//! a `chunk-<i>.len` record of each chunk's size at write time.
use crate::atomic;
use crate::error::UploadError;
use crate::safe_fs;
use crate::storage::{StagedFile, StorageLayout, UploadTarget};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Upper bound on `X-Total-Chunks`.
pub const MAX_TOTAL_CHUNKS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec { pub index: u32, pub total: u32 }

impl ChunkSpec {
    pub fn new(index: u32, total: u32) -> Result<Self, UploadError> {
        if total == 0 || total > MAX_TOTAL_CHUNKS {
            return Err(UploadError::InvalidRequest(format!("Invalid total chunks: {total}")));
        }
        if index >= total {
            return Err(UploadError::InvalidRequest(format!("Chunk index {index} out of range for {total} chunks")));
        }
        Ok(Self { index, total })
    }

    /// Parse the raw `X-Chunk-Index` / `X-Total-Chunks` header values.
    pub fn parse(index: &str, total: &str) -> Result<Self, UploadError> {
        let index = index.trim().parse::<u32>().map_err(|_| UploadError::InvalidRequest(format!("Invalid chunk index: {index}")))?;
        let total = total.trim().parse::<u32>().map_err(|_| UploadError::InvalidRequest(format!("Invalid total chunks: {total}")))?;
        Self::new(index, total)
    }
}

fn chunk_name(index: u32) -> String { format!("chunk-{index}") }

fn parse_chunk_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("chunk-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) { return None; }
    digits.parse().ok()
}

/// What [`PendingChunk::commit`] did with the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCommit {
    /// Stored under its index with this recorded size.
    Stored(u64),
    /// The set was merged or abandoned while the chunk was in flight.
    SetConsumed,
}

/// A chunk being received. Lives at a unique `.part` path until committed;
/// dropping it uncommitted deletes the partial file.
#[derive(Debug)]
pub struct PendingChunk {
    index: u32,
    part: PathBuf,
    dest: PathBuf,
    len_path: PathBuf,
    file: File,
    lock: Arc<tokio::sync::Mutex<()>>,
    armed: bool,
}

impl PendingChunk {
    pub fn index(&self) -> u32 { self.index }
    pub fn file(&mut self) -> &mut File { &mut self.file }

    /// Sync the chunk, record its on-disk size and make it visible to
    /// [`ChunkStore::list_chunks`]. Runs under the target's set lock, so
    /// commits of the same index never share the size record's temp file.
    pub async fn commit(mut self) -> Result<ChunkCommit, UploadError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let lock = self.lock.clone();
        let _held = lock.lock().await;
        let size = match tokio::fs::metadata(&self.part).await {
            Ok(meta) => meta.len(),
            // the part went away with its directory
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.armed = false;
                debug!(index = self.index, "chunk_set_consumed");
                return Ok(ChunkCommit::SetConsumed);
            }
            Err(e) => return Err(e.into()),
        };
        atomic::write_atomic(&self.len_path, size.to_string()).await?;
        tokio::fs::rename(&self.part, &self.dest).await?;
        self.armed = false;
        debug!(index = self.index, size, "chunk_committed");
        Ok(ChunkCommit::Stored(size))
    }

    pub async fn discard(mut self) {
        self.armed = false;
        safe_fs::unlink(&self.part).await;
    }
}

impl Drop for PendingChunk {
    fn drop(&mut self) {
        if self.armed { safe_fs::unlink_sync(&self.part); }
    }
}

pub struct ChunkStore {
    layout: StorageLayout,
    // set locks keyed by chunk directory; held to open, commit, merge and remove chunks
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChunkStore {
    pub fn new(layout: StorageLayout) -> Self { Self { layout, locks: Mutex::new(HashMap::new()) } }

    pub fn layout(&self) -> &StorageLayout { &self.layout }

    /// Open a fresh part file for `spec.index`, creating the chunk directory if needed.
    pub async fn begin_chunk(&self, target: &UploadTarget, spec: ChunkSpec) -> Result<PendingChunk, UploadError> {
        let dir = self.layout.chunk_dir(target);
        let lock = self.lock_for(&dir);
        let held = lock.lock().await;
        create_chunk_dir(&dir).await?;
        let name = chunk_name(spec.index);
        let part = dir.join(format!("{name}.{}.part", Uuid::new_v4()));
        let file = File::create(&part).await?;
        drop(held);
        Ok(PendingChunk { index: spec.index, dest: dir.join(&name), len_path: dir.join(format!("{name}.len")), part, file, lock, armed: true })
    }

    /// Indices of committed chunks. A missing directory is an empty set.
    pub async fn list_chunks(&self, target: &UploadTarget) -> Result<BTreeSet<u32>, UploadError> {
        let dir = self.layout.chunk_dir(target);
        let mut present = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(present),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(index) = entry.file_name().to_str().and_then(parse_chunk_name) else { continue };
            if entry.file_type().await?.is_file() { present.insert(index); }
        }
        Ok(present)
    }

    /// Concatenate chunks `0..total` in index order into a staged file next to
    /// the final path. Chunks are left untouched whatever the outcome.
    pub async fn merge_chunks(&self, target: &UploadTarget, total: u32, limit: u64, cancel: &CancellationToken) -> Result<StagedFile, UploadError> {
        let present = self.list_chunks(target).await?;
        let missing: Vec<u32> = (0..total).filter(|i| !present.contains(i)).collect();
        if !missing.is_empty() { return Err(UploadError::MissingChunks(missing)); }

        let dir = self.layout.chunk_dir(target);
        tokio::fs::create_dir_all(self.layout.target_dir(target)).await?;
        let mut staged = StagedFile::new(self.layout.staging_path(target, "merge"), 0);
        // any early return from here on drops the guard and removes the partial merge
        let mut out = File::create(staged.path()).await?;
        let mut merged = 0u64;
        for index in 0..total {
            if cancel.is_cancelled() { return Err(UploadError::Cancelled); }
            let chunk = dir.join(chunk_name(index));
            let expected = recorded_size(&dir, index).await?;
            let actual = tokio::fs::metadata(&chunk).await?.len();
            if expected != actual { return Err(UploadError::ChunkSizeMismatch { index, expected, actual }); }
            merged += actual;
            if merged > limit { return Err(UploadError::FileTooLarge { size: merged, limit }); }
            let mut input = File::open(&chunk).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        staged.set_size(merged);
        info!(upload = %target, total, bytes = merged, "chunks_merged");
        Ok(staged)
    }

    /// Merge if the set covers `0..total`, holding the target's merge lock.
    /// `None` means the set is not complete, or another request already merged it.
    /// A successful merge removes the chunk set.
    pub async fn try_merge(&self, target: &UploadTarget, total: u32, limit: u64, cancel: &CancellationToken) -> Result<Option<StagedFile>, UploadError> {
        let lock = self.lock_for(&self.layout.chunk_dir(target));
        let result = {
            let _held = lock.lock().await;
            let present = self.list_chunks(target).await?;
            if (0..total).all(|i| present.contains(&i)) {
                let staged = self.merge_chunks(target, total, limit, cancel).await?;
                self.remove_set(target).await;
                Some(staged)
            } else {
                debug!(upload = %target, have = present.len(), total, "chunk_set_incomplete");
                None
            }
        };
        drop(lock);
        self.prune_locks();
        Ok(result)
    }

    /// Remove the chunk set. Idempotent.
    pub async fn cleanup(&self, target: &UploadTarget) {
        let lock = self.lock_for(&self.layout.chunk_dir(target));
        {
            let _held = lock.lock().await;
            self.remove_set(target).await;
        }
        drop(lock);
        self.prune_locks();
    }

    /// Caller holds the set lock. Empty parents are pruned up to the chunk root.
    async fn remove_set(&self, target: &UploadTarget) {
        let dir = self.layout.chunk_dir(target);
        safe_fs::remove_dir_all(&dir).await;
        let root = self.layout.chunk_root();
        let mut parent = dir.parent();
        while let Some(p) = parent {
            if p == root.as_path() || !p.starts_with(&root) { break; }
            // non-empty means another target still lives below
            if tokio::fs::remove_dir(p).await.is_err() { break; }
            parent = p.parent();
        }
    }

    fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|_, l| Arc::strong_count(l) > 1);
    }
}

/// Another target's cleanup can prune a shared parent between the steps of
/// `create_dir_all`, so a vanished parent is retried.
async fn create_chunk_dir(dir: &Path) -> io::Result<()> {
    let mut attempts = 0;
    loop {
        match tokio::fs::create_dir_all(dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempts < 3 => attempts += 1,
            other => return other,
        }
    }
}

async fn recorded_size(dir: &Path, index: u32) -> Result<u64, UploadError> {
    let raw = tokio::fs::read_to_string(dir.join(format!("{}.len", chunk_name(index)))).await?;
    raw.trim().parse::<u64>().map_err(|_| UploadError::Storage(io::Error::new(io::ErrorKind::InvalidData, format!("corrupt size record for chunk {index}"))))
}
