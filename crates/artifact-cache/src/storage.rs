//! Removal of materialized bytes from the local filesystem.

use std::io;
use std::path::Path;

use futures::future::BoxFuture;

/// Deletes the bytes an entry materialized at its local path.
pub trait Storage: Send + Sync + 'static {
    /// Removes whatever lives at `local_path`.
    ///
    /// A path that does not exist is not an error.
    fn delete<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, io::Result<()>>;
}

/// [`Storage`] backed by the local filesystem.
///
/// Removes files and whole directory trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for LocalStorage {
    fn delete<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let metadata = match tokio::fs::symlink_metadata(local_path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            };

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(local_path).await
            } else {
                tokio::fs::remove_file(local_path).await
            };

            match result {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => {
                    tracing::trace!("Deleted `{}`", local_path.display());
                    other
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_file() {
        let dir = artifact_cache_test::tempdir();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello").unwrap();

        LocalStorage.delete(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let dir = artifact_cache_test::tempdir();
        let path = dir.path().join("artifact");
        std::fs::create_dir_all(path.join("nested")).unwrap();
        std::fs::write(path.join("nested/file.txt"), b"hello").unwrap();

        LocalStorage.delete(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let dir = artifact_cache_test::tempdir();
        LocalStorage
            .delete(&dir.path().join("does-not-exist"))
            .await
            .unwrap();
    }
}
