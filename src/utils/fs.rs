//! Filesystem helpers shared across modules.

use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Create `dst` as another name for `src`: try a hard link first and fall
/// back to a byte copy when the filesystem refuses (cross-device, quota,
/// unsupported).
///
/// When `dst` already exists as a link to the same inode this is a no-op;
/// copying there would truncate the shared inode and destroy the source. A
/// stale `dst` is removed and replaced.
pub async fn hardlink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if same_inode(src, dst).await {
                return Ok(());
            }
            let _ = tokio::fs::remove_file(dst).await;
            if tokio::fs::hard_link(src, dst).await.is_ok() {
                return Ok(());
            }
        }
        Err(link_err) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %link_err,
                "hard link failed, copying instead"
            );
        }
    }

    tokio::fs::copy(src, dst)
        .await
        .map(|_| ())
        .map_err(|e| Error::io_path("copying file", dst, e))
}

#[cfg(unix)]
async fn same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
async fn same_inode(_a: &Path, _b: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_dir_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir_all(&nested).await.unwrap();
        ensure_dir_all(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_hardlink_or_copy_links_on_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("original.jpg");
        let dst = dir.path().join("linked.jpg");
        tokio::fs::write(&src, b"image bytes").await.unwrap();

        hardlink_or_copy(&src, &dst).await.unwrap();

        let content = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(content, b"image bytes");

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(&dst).unwrap();
            assert_eq!(meta.nlink(), 2);
        }
    }

    #[tokio::test]
    async fn test_hardlink_or_copy_replaces_stale_dst() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("original.jpg");
        let dst = dir.path().join("existing.jpg");
        tokio::fs::write(&src, b"new bytes").await.unwrap();
        tokio::fs::write(&dst, b"stale").await.unwrap();

        hardlink_or_copy(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new bytes");
    }

    #[tokio::test]
    async fn test_hardlink_or_copy_is_idempotent_for_linked_dst() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("original.jpg");
        let dst = dir.path().join("device.jpg");
        tokio::fs::write(&src, b"image bytes").await.unwrap();

        hardlink_or_copy(&src, &dst).await.unwrap();
        // Re-materializing the same path must not truncate the shared inode.
        hardlink_or_copy(&src, &dst).await.unwrap();

        assert_eq!(tokio::fs::read(&src).await.unwrap(), b"image bytes");
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"image bytes");
    }
}
