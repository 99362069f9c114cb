//! Best-effort filesystem helpers for cleanup paths.
//!
//! Every function here swallows its error after logging it at `info`. They run
//! inside other failure paths, where a secondary error must never replace the
//! primary one being reported.
use std::future::Future;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// Await `op` and log any error instead of returning it.
pub async fn best_effort<T, F>(action: &'static str, path: &Path, op: F) -> Option<T>
where
    F: Future<Output = io::Result<T>>,
{
    match op.await {
        Ok(v) => Some(v),
        Err(e) => { log_failure(action, path, &e); None }
    }
}

/// Synchronous counterpart of [`best_effort`], used from `Drop` impls.
pub fn best_effort_sync<T>(action: &'static str, path: &Path, op: impl FnOnce() -> io::Result<T>) -> Option<T> {
    match op() {
        Ok(v) => Some(v),
        Err(e) => { log_failure(action, path, &e); None }
    }
}

fn log_failure(action: &'static str, path: &Path, e: &io::Error) {
    if e.kind() == io::ErrorKind::NotFound {
        debug!(action, path=%path.display(), "safe_fs_target_missing");
    } else {
        info!(action, path=%path.display(), error=%e, "safe_fs_failed");
    }
}

/// Remove a file. Returns whether something was removed.
pub async fn unlink(path: &Path) -> bool {
    best_effort("unlink", path, tokio::fs::remove_file(path)).await.is_some()
}

pub fn unlink_sync(path: &Path) -> bool {
    best_effort_sync("unlink", path, || std::fs::remove_file(path)).is_some()
}

/// Remove a directory tree. A missing directory is a no-op.
pub async fn remove_dir_all(path: &Path) {
    if !exists(path).await { return; }
    best_effort("remove_dir_all", path, tokio::fs::remove_dir_all(path)).await;
}

pub fn remove_dir_all_sync(path: &Path) {
    if !path.exists() { return; }
    best_effort_sync("remove_dir_all", path, || std::fs::remove_dir_all(path));
}

/// Create a directory and its parents. An existing directory is a no-op.
pub async fn create_dir_all(path: &Path) -> bool {
    best_effort("create_dir_all", path, tokio::fs::create_dir_all(path)).await.is_some()
}

pub fn create_dir_all_sync(path: &Path) -> bool {
    best_effort_sync("create_dir_all", path, || std::fs::create_dir_all(path)).is_some()
}

pub async fn rename(from: &Path, to: &Path) -> bool {
    best_effort("rename", from, tokio::fs::rename(from, to)).await.is_some()
}

pub async fn exists(path: &Path) -> bool {
    best_effort("exists", path, tokio::fs::try_exists(path)).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_targets_are_quiet_noops() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("ghost");
        assert!(!unlink(&ghost).await);
        assert!(!unlink_sync(&ghost));
        remove_dir_all(&ghost).await;
        remove_dir_all_sync(&ghost);
        assert!(!rename(&ghost, &dir.path().join("other")).await);
        assert!(!exists(&ghost).await);
    }

    #[tokio::test]
    async fn create_dir_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        assert!(create_dir_all(&nested).await);
        assert!(create_dir_all(&nested).await);
        assert!(create_dir_all_sync(&nested));
        assert!(exists(&nested).await);
    }

    #[tokio::test]
    async fn unlink_and_rename_report_success() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        assert!(rename(&a, &b).await);
        assert!(unlink(&b).await);
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn best_effort_swallows_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        // a file cannot be the parent of a directory
        let r = best_effort("create_dir", &file, tokio::fs::create_dir(file.join("child"))).await;
        assert!(r.is_none());
        assert!(file.exists());
    }
}
