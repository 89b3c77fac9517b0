//! Support to download from the local filesystem.
//!
//! Files are streamed into the destination, directories are copied recursively.

use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWrite;
use walkdir::WalkDir;

use crate::error::FetchError;

/// Downloader implementation that supports filesystem locations.
#[derive(Debug)]
pub struct FilesystemDownloader {}

impl FilesystemDownloader {
    pub fn new() -> Self {
        Self {}
    }

    /// Copies the file at `path` into `destination`.
    pub async fn download_source(
        &self,
        path: &Path,
        mut destination: impl AsyncWrite + Unpin,
    ) -> Result<(), FetchError> {
        tracing::debug!("Fetching artifact from {:?}", path);

        let mut file = File::open(path).await.map_err(not_found)?;
        tokio::io::copy(&mut file, &mut destination).await?;
        Ok(())
    }

    /// Copies the directory tree at `path` into the existing, empty directory `destination`.
    ///
    /// Symlinks are followed, the copy only contains regular files and directories.
    pub async fn download_dir(&self, path: &Path, destination: &Path) -> Result<(), FetchError> {
        tracing::debug!("Fetching artifact directory from {:?}", path);

        let path = path.to_owned();
        let destination = destination.to_owned();
        tokio::task::spawn_blocking(move || copy_dir(&path, &destination))
            .await
            .map_err(|e| FetchError::Io(io::Error::other(e)))?
    }
}

fn copy_dir(source: &Path, destination: &Path) -> Result<(), FetchError> {
    for entry in WalkDir::new(source).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| not_found(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn not_found(e: io::Error) -> FetchError {
    match e.kind() {
        io::ErrorKind::NotFound => FetchError::NotFound,
        _ => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_download_file() {
        artifact_cache_test::setup();
        let dir = artifact_cache_test::tempdir();
        let dest = dir.path().join("hello.txt");

        let downloader = FilesystemDownloader::new();
        let destination = File::create(&dest).await.unwrap();
        downloader
            .download_source(&artifact_cache_test::fixture("artifacts/hello.txt"), destination)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(dest).unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let dir = artifact_cache_test::tempdir();
        let destination = File::create(dir.path().join("out")).await.unwrap();

        let result = FilesystemDownloader::new()
            .download_source(&dir.path().join("does-not-exist"), destination)
            .await;
        assert!(matches!(result, Err(FetchError::NotFound)));
    }

    #[tokio::test]
    async fn test_download_dir() {
        artifact_cache_test::setup();
        let dir = artifact_cache_test::tempdir();

        FilesystemDownloader::new()
            .download_dir(&artifact_cache_test::fixture("artifacts/outputs"), dir.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("result.json")).unwrap(),
            "{\"passed\": 12, \"failed\": 0}\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("reports/summary.txt")).unwrap(),
            "all green\n"
        );
    }
}
