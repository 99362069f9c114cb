//! Write-or-nothing file persistence.
//!
//! Content goes to `<path>.tmp` first and is renamed onto `<path>` once fully
//! written and synced. A concurrent reader sees the old file or the new one,
//! never a partial write. The temp file never outlives a failed call.
use crate::safe_fs;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, #[source] source: io::Error },
    #[error("failed to rename {} onto {}: {source}", from.display(), to.display())]
    Rename { from: PathBuf, to: PathBuf, #[source] source: io::Error },
}

impl From<AtomicWriteError> for io::Error {
    fn from(e: AtomicWriteError) -> Self {
        let kind = match &e { AtomicWriteError::Write { source, .. } | AtomicWriteError::Rename { source, .. } => source.kind() };
        io::Error::new(kind, e)
    }
}

/// Sibling temp path used by [`write_atomic`]: `<path>.tmp`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

pub async fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> Result<(), AtomicWriteError> {
    let tmp = tmp_path_for(path);
    if let Err(source) = write_synced(&tmp, content.as_ref()).await {
        safe_fs::unlink(&tmp).await;
        return Err(AtomicWriteError::Write { path: tmp, source });
    }
    place(&tmp, path).await
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = tokio::fs::File::create(path).await?;
    f.write_all(bytes).await?;
    f.sync_all().await
}

/// Rename an already-written staged file onto `dest`. The staged file is
/// removed if the rename fails.
pub async fn place(staged: &Path, dest: &Path) -> Result<(), AtomicWriteError> {
    if let Err(source) = tokio::fs::rename(staged, dest).await {
        safe_fs::unlink(staged).await;
        return Err(AtomicWriteError::Rename { from: staged.to_path_buf(), to: dest.to_path_buf(), source });
    }
    Ok(())
}

pub fn write_atomic_sync(path: &Path, content: impl AsRef<[u8]>) -> Result<(), AtomicWriteError> {
    let tmp = tmp_path_for(path);
    let written = std::fs::File::create(&tmp).and_then(|mut f| { f.write_all(content.as_ref())?; f.sync_all() });
    if let Err(source) = written {
        safe_fs::unlink_sync(&tmp);
        return Err(AtomicWriteError::Write { path: tmp, source });
    }
    if let Err(source) = std::fs::rename(&tmp, path) {
        safe_fs::unlink_sync(&tmp);
        return Err(AtomicWriteError::Rename { from: tmp, to: path.to_path_buf(), source });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_and_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write_atomic(&path, "a: 1\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: 1\n");
        write_atomic(&path, b"a: 2\n".to_vec()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: 2\n");
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn write_failure_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-parent").join("file");
        let err = write_atomic(&path, "x").await.unwrap_err();
        assert!(matches!(err, AtomicWriteError::Write { .. }));
        assert!(!tmp_path_for(&path).exists());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rename_failure_removes_temp_and_keeps_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"k").unwrap();
        let err = write_atomic(&path, "x").await.unwrap_err();
        assert!(matches!(err, AtomicWriteError::Rename { .. }), "{err}");
        assert!(!tmp_path_for(&path).exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn sync_variant_has_same_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        write_atomic_sync(&path, "one").unwrap();
        write_atomic_sync(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!tmp_path_for(&path).exists());
        let bad = dir.path().join("nope").join("doc");
        assert!(matches!(write_atomic_sync(&bad, "x"), Err(AtomicWriteError::Write { .. })));
        assert!(!tmp_path_for(&bad).exists());
    }

    #[tokio::test]
    async fn interrupted_writer_never_touches_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        write_atomic(&path, "complete original").await.unwrap();
        // writer killed after a partial write, before rename
        std::fs::write(tmp_path_for(&path), b"trunc").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "complete original");
        // a later writer truncates the stale temp and completes normally
        write_atomic(&path, "replacement").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "replacement");
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn interrupted_first_write_leaves_nothing_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");
        std::fs::write(tmp_path_for(&path), b"partial").unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_reader_sees_only_whole_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot");
        let a = vec![b'a'; 256 * 1024];
        let b = vec![b'b'; 256 * 1024];
        write_atomic(&path, &a).await.unwrap();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for i in 0..20 { write_atomic(&writer_path, if i % 2 == 0 { &b } else { &a }).await.unwrap(); }
        });
        for _ in 0..50 {
            let seen = tokio::fs::read(&path).await.unwrap();
            assert_eq!(seen.len(), 256 * 1024);
            assert!(seen.iter().all(|c| *c == seen[0]));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
