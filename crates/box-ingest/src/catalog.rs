//! Boundary to the relational catalog of organizations, boxes, versions,
//! providers, architectures and files. The engine only resolves the chain and
//! upserts the file row; naming rules and duplicate detection live elsewhere.
use crate::models::FileRecord;
use crate::storage::UploadTarget;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogLink { Organization, Box, Version, Provider, Architecture }

impl CatalogLink {
    pub const CHAIN: [CatalogLink; 5] = [Self::Organization, Self::Box, Self::Version, Self::Provider, Self::Architecture];
}

impl fmt::Display for CatalogLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Self::Organization => "Organization", Self::Box => "Box", Self::Version => "Version", Self::Provider => "Provider", Self::Architecture => "Architecture" })
    }
}

/// The first link of the chain that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMiss { pub link: CatalogLink, pub name: String }

impl fmt::Display for CatalogMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {} not found", self.link, self.name) }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{0}")]
    NotFound(CatalogMiss),
    #[error("{0}")]
    Backend(String),
}

impl From<sqlx::Error> for CatalogError {
    fn from(e: sqlx::Error) -> Self { Self::Backend(e.to_string()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIds { pub organization_id: Uuid, pub box_id: Uuid, pub version_id: Uuid, pub provider_id: Uuid, pub architecture_id: Uuid }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecordInput { pub file_name: String, pub file_size: i64, pub checksum: Option<String>, pub checksum_type: Option<String> }

#[derive(Debug, Clone)]
pub struct UpsertedFile { pub record: FileRecord, pub created: bool }

#[async_trait]
pub trait CatalogReconciler: Send + Sync + 'static {
    async fn resolve_chain(&self, target: &UploadTarget) -> Result<ChainIds, CatalogError>;
    /// Insert the file row, or update size/checksum of the existing one. Download
    /// counts are never touched by an update.
    async fn upsert_file_record(&self, architecture_id: Uuid, file: &FileRecordInput) -> Result<UpsertedFile, CatalogError>;
    async fn ping(&self) -> Result<(), CatalogError> { Ok(()) }
}

/// In-process catalog used by `catalog: memory` deployments and by tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog { inner: Mutex<MemoryInner> }

#[derive(Debug, Default)]
struct MemoryInner {
    // keyed by chain prefix: [org], [org, box], ... [org, box, version, provider, arch]
    links: HashMap<Vec<String>, Uuid>,
    files: HashMap<(Uuid, String), FileRecord>,
}

impl MemoryCatalog {
    pub fn new() -> Self { Self::default() }

    /// Create every missing link of the target's chain. Returns the chain ids.
    pub fn register(&self, target: &UploadTarget) -> ChainIds {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let segs = target.segments();
        let mut ids = [Uuid::nil(); 5];
        for depth in 1..=5 {
            let key: Vec<String> = segs[..depth].iter().map(|s| s.to_string()).collect();
            ids[depth - 1] = *inner.links.entry(key).or_insert_with(Uuid::new_v4);
        }
        ChainIds { organization_id: ids[0], box_id: ids[1], version_id: ids[2], provider_id: ids[3], architecture_id: ids[4] }
    }

    /// Remove `link` of the target's chain and everything below it, the way a
    /// cascading delete in the surrounding system would.
    pub fn remove(&self, target: &UploadTarget, link: CatalogLink) {
        let depth = CatalogLink::CHAIN.iter().position(|l| *l == link).unwrap_or(0) + 1;
        let prefix: Vec<String> = target.segments()[..depth].iter().map(|s| s.to_string()).collect();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let doomed: Vec<Uuid> = inner.links.iter().filter(|(k, _)| k.len() == 5 && k.starts_with(&prefix)).map(|(_, id)| *id).collect();
        inner.links.retain(|k, _| !k.starts_with(&prefix));
        inner.files.retain(|(arch, _), _| !doomed.contains(arch));
    }

    pub fn file(&self, target: &UploadTarget, file_name: &str) -> Option<FileRecord> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let key: Vec<String> = target.segments().iter().map(|s| s.to_string()).collect();
        let arch = inner.links.get(&key)?;
        inner.files.get(&(*arch, file_name.to_string())).cloned()
    }

    /// Simulate downloads recorded by the (external) download flow.
    pub fn record_downloads(&self, target: &UploadTarget, file_name: &str, count: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let key: Vec<String> = target.segments().iter().map(|s| s.to_string()).collect();
        let Some(arch) = inner.links.get(&key).copied() else { return };
        if let Some(f) = inner.files.get_mut(&(arch, file_name.to_string())) { f.download_count += count; }
    }
}

#[async_trait]
impl CatalogReconciler for MemoryCatalog {
    async fn resolve_chain(&self, target: &UploadTarget) -> Result<ChainIds, CatalogError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let segs = target.segments();
        let mut ids = [Uuid::nil(); 5];
        for (depth, link) in CatalogLink::CHAIN.iter().enumerate() {
            let key: Vec<String> = segs[..=depth].iter().map(|s| s.to_string()).collect();
            match inner.links.get(&key) {
                Some(id) => ids[depth] = *id,
                None => return Err(CatalogError::NotFound(CatalogMiss { link: *link, name: segs[depth].to_string() })),
            }
        }
        Ok(ChainIds { organization_id: ids[0], box_id: ids[1], version_id: ids[2], provider_id: ids[3], architecture_id: ids[4] })
    }

    async fn upsert_file_record(&self, architecture_id: Uuid, file: &FileRecordInput) -> Result<UpsertedFile, CatalogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !inner.links.values().any(|id| *id == architecture_id) {
            return Err(CatalogError::Backend(format!("architecture {architecture_id} does not exist")));
        }
        let now = Utc::now();
        let key = (architecture_id, file.file_name.clone());
        if let Some(existing) = inner.files.get_mut(&key) {
            existing.file_size = file.file_size;
            existing.checksum = file.checksum.clone();
            existing.checksum_type = file.checksum_type.clone();
            existing.updated_at = now;
            return Ok(UpsertedFile { record: existing.clone(), created: false });
        }
        let record = FileRecord {
            id: Uuid::new_v4(),
            architecture_id,
            file_name: file.file_name.clone(),
            file_size: file.file_size,
            checksum: file.checksum.clone(),
            checksum_type: file.checksum_type.clone(),
            download_count: 0,
            created_at: now,
            updated_at: now,
        };
        inner.files.insert(key, record.clone());
        Ok(UpsertedFile { record, created: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> UploadTarget { UploadTarget::new("acme", "ubuntu", "1.0.0", "virtualbox", "amd64").unwrap() }

    #[tokio::test]
    async fn resolves_registered_chain() {
        let c = MemoryCatalog::new();
        let ids = c.register(&target());
        assert_eq!(c.resolve_chain(&target()).await.unwrap(), ids);
        // registering again keeps ids stable
        assert_eq!(c.register(&target()), ids);
    }

    #[tokio::test]
    async fn reports_first_missing_link() {
        let c = MemoryCatalog::new();
        c.register(&target());
        c.remove(&target(), CatalogLink::Version);
        match c.resolve_chain(&target()).await {
            Err(CatalogError::NotFound(miss)) => assert_eq!(miss.to_string(), "Version 1.0.0 not found"),
            other => panic!("unexpected {other:?}"),
        }
        let other = UploadTarget::new("ghost", "ubuntu", "1.0.0", "virtualbox", "amd64").unwrap();
        let err = c.resolve_chain(&other).await.unwrap_err();
        assert_eq!(err.to_string(), "Organization ghost not found");
    }

    #[tokio::test]
    async fn upsert_preserves_download_count() {
        let c = MemoryCatalog::new();
        let ids = c.register(&target());
        let input = FileRecordInput { file_name: "vagrant.box".into(), file_size: 10, checksum: None, checksum_type: None };
        let first = c.upsert_file_record(ids.architecture_id, &input).await.unwrap();
        assert!(first.created);
        assert_eq!(first.record.download_count, 0);
        c.record_downloads(&target(), "vagrant.box", 7);
        let input2 = FileRecordInput { file_size: 20, checksum: Some("ab".into()), checksum_type: Some("sha256".into()), ..input };
        let second = c.upsert_file_record(ids.architecture_id, &input2).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.file_size, 20);
        assert_eq!(second.record.download_count, 7);
    }
}
