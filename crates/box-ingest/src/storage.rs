use crate::atomic::{self, AtomicWriteError};
use crate::error::UploadError;
use crate::safe_fs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory under the storage root that holds in-progress chunk sets.
pub const CHUNK_ROOT: &str = ".chunks";

/// The artifact slot an upload is destined for. Immutable for the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct UploadTarget {
    pub organization: String,
    #[serde(rename = "box")]
    pub box_name: String,
    pub version: String,
    pub provider: String,
    pub architecture: String,
}

impl UploadTarget {
    pub fn new(organization: &str, box_name: &str, version: &str, provider: &str, architecture: &str) -> Result<Self, UploadError> {
        let t = Self { organization: organization.into(), box_name: box_name.into(), version: version.into(), provider: provider.into(), architecture: architecture.into() };
        t.validate()?;
        Ok(t)
    }

    /// Reject segments that could escape the target directory.
    pub fn validate(&self) -> Result<(), UploadError> {
        for (label, seg) in self.labelled_segments() {
            let bad = seg.is_empty() || seg.starts_with('.') || seg.contains(['/', '\\', '\0']);
            if bad { return Err(UploadError::InvalidRequest(format!("invalid {label} segment '{seg}'"))); }
        }
        Ok(())
    }

    fn labelled_segments(&self) -> [(&'static str, &str); 5] {
        [("organization", &self.organization), ("box", &self.box_name), ("version", &self.version), ("provider", &self.provider), ("architecture", &self.architecture)]
    }

    pub fn segments(&self) -> [&str; 5] {
        [&self.organization, &self.box_name, &self.version, &self.provider, &self.architecture]
    }
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.segments().join("/")) }
}

/// Maps upload targets onto the storage tree:
/// `<root>/<org>/<box>/<version>/<provider>/<arch>/<file>` for placed artifacts and
/// `<root>/.chunks/<org>/<box>/<version>/<provider>/<arch>` for chunk sets.
#[derive(Debug, Clone)]
pub struct StorageLayout { root: PathBuf, file_name: String }

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self { Self { root: root.into(), file_name: file_name.into() } }

    pub fn root(&self) -> &Path { &self.root }
    pub fn file_name(&self) -> &str { &self.file_name }

    pub fn target_dir(&self, target: &UploadTarget) -> PathBuf {
        target.segments().iter().fold(self.root.clone(), |p, s| p.join(s))
    }

    pub fn final_path(&self, target: &UploadTarget) -> PathBuf { self.target_dir(target).join(&self.file_name) }

    /// Stable per target, so concurrent chunked uploads to one slot share (and collide on) a set.
    pub fn chunk_dir(&self, target: &UploadTarget) -> PathBuf {
        target.segments().iter().fold(self.chunk_root(), |p, s| p.join(s))
    }

    pub fn chunk_root(&self) -> PathBuf { self.root.join(CHUNK_ROOT) }

    /// Unique staging path next to the final file (same filesystem, so placement is a rename).
    pub fn staging_path(&self, target: &UploadTarget, purpose: &str) -> PathBuf {
        self.target_dir(target).join(format!(".{}.{purpose}-{}.part", self.file_name, Uuid::new_v4()))
    }
}

/// A fully written file waiting to be placed. Deleted on drop unless placed,
/// so an abandoned or cancelled upload never leaves it behind.
#[derive(Debug)]
pub struct StagedFile { path: PathBuf, size: u64, armed: bool }

impl StagedFile {
    pub fn new(path: PathBuf, size: u64) -> Self { Self { path, size, armed: true } }
    pub fn path(&self) -> &Path { &self.path }
    pub fn size(&self) -> u64 { self.size }
    pub(crate) fn set_size(&mut self, size: u64) { self.size = size; }

    pub async fn discard(mut self) {
        self.armed = false;
        safe_fs::unlink(&self.path).await;
    }

    /// Rename onto `dest`. On failure the staged file is already gone.
    pub async fn place(mut self, dest: &Path) -> Result<(), AtomicWriteError> {
        self.armed = false;
        atomic::place(&self.path, dest).await
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed { safe_fs::unlink_sync(&self.path); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> UploadTarget { UploadTarget::new("acme", "ubuntu", "1.0.0", "virtualbox", "amd64").unwrap() }

    #[test]
    fn layout_paths() {
        let l = StorageLayout::new("/srv/boxes", "vagrant.box");
        let t = target();
        assert_eq!(l.final_path(&t), PathBuf::from("/srv/boxes/acme/ubuntu/1.0.0/virtualbox/amd64/vagrant.box"));
        assert_eq!(l.chunk_dir(&t), PathBuf::from("/srv/boxes/.chunks/acme/ubuntu/1.0.0/virtualbox/amd64"));
        let staged = l.staging_path(&t, "upload");
        assert_eq!(staged.parent().unwrap(), l.target_dir(&t));
        assert_ne!(staged, l.staging_path(&t, "upload"));
    }

    #[tokio::test]
    async fn staged_file_is_removed_unless_placed() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join("dropped.part");
        std::fs::write(&dropped, b"x").unwrap();
        drop(StagedFile::new(dropped.clone(), 1));
        assert!(!dropped.exists());

        let kept = dir.path().join("kept.part");
        std::fs::write(&kept, b"xy").unwrap();
        let dest = dir.path().join("final");
        StagedFile::new(kept.clone(), 2).place(&dest).await.unwrap();
        assert!(!kept.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"xy");
    }

    #[test]
    fn rejects_escaping_segments() {
        for bad in ["", "..", ".chunks", "a/b", "a\\b"] {
            assert!(UploadTarget::new("acme", bad, "1.0.0", "vb", "amd64").is_err(), "{bad:?} accepted");
        }
        assert_eq!(target().to_string(), "acme/ubuntu/1.0.0/virtualbox/amd64");
    }
}
