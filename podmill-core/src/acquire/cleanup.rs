//! Temporary artifact disposal shared by every exit path.
//!
//! Failure cleanup must never mask the original error, so everything here is
//! best-effort: problems are logged and swallowed.

use std::path::Path;

use tracing::{debug, warn};

/// Remove the given files if they exist.
pub async fn remove_artifacts(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed temporary artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
        }
    }
}

/// Remove `dir` and any ancestors that became empty, walking up to but never
/// including `root`. Non-empty directories stop the walk.
pub async fn prune_empty_dirs(dir: &Path, root: &Path) {
    let mut current = Some(dir.to_path_buf());

    while let Some(path) = current {
        if path == root || !path.starts_with(root) {
            break;
        }
        match tokio::fs::remove_dir(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "pruned empty directory");
                current = path.parent().map(|p| p.to_path_buf());
            }
            // Not empty, already gone, or otherwise stuck: stop walking up.
            Err(_) => break,
        }
    }
}

/// Recursively delete a working directory, then prune empty ancestors.
pub async fn remove_work_dir(dir: &Path, root: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove working directory"),
    }
    if let Some(parent) = dir.parent() {
        prune_empty_dirs(parent, root).await;
    }
}
