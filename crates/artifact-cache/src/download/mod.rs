//! Fetching artifacts from remote locations into the local filesystem.
//!
//! The cache talks to the [`Fetcher`] trait. [`DownloadService`] is the implementation used in
//! production. It dispatches on the [`RemoteLocation`] parsed from the remote path, and makes
//! the artifact appear at the local path atomically: bytes are written into a temp file (or
//! temp directory) next to the local path and renamed into place once complete.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::prelude::*;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::FetchError;
use crate::utils::http::{DownloadTimeouts, create_client};

mod compression;
mod filesystem;
mod http;
mod location;
mod s3;

pub use self::compression::{maybe_decompress_file, tempfile_in_parent};
pub use self::location::RemoteLocation;

/// The user agent sent with every HTTP request.
pub const USER_AGENT: &str = concat!("artifact-cache/", env!("CARGO_PKG_VERSION"));

/// How many S3 clients (one per region) are kept around.
const S3_CLIENT_CAPACITY: u64 = 32;

/// Copies the contents of a remote location to a local path.
///
/// The cache calls this at most once per entry, while holding the entry's lock exclusively.
/// When the returned future resolves to `Ok`, the complete artifact must be present at
/// `local_path` in a form the [`Reader`](crate::Reader) understands. On error, implementations
/// may leave partial bytes behind; the cache deletes them.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        remote_path: &'a str,
        local_path: &'a Path,
        expected_size: u64,
    ) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// A [`Fetcher`] for local files and directories, HTTP(S) URLs and S3 objects.
///
/// Compressed payloads (gzip, zlib, zstd) are decompressed transparently.
#[derive(Debug)]
pub struct DownloadService {
    timeouts: DownloadTimeouts,
    http: http::HttpDownloader,
    s3: s3::S3Downloader,
    fs: filesystem::FilesystemDownloader,
}

impl DownloadService {
    /// Creates a new download service using the timeouts and S3 settings of `config`.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts).context("failed to create HTTP client")?;

        Ok(Self {
            timeouts,
            http: http::HttpDownloader::new(client, timeouts),
            s3: s3::S3Downloader::new(config.s3.clone(), timeouts, S3_CLIENT_CAPACITY),
            fs: filesystem::FilesystemDownloader::new(),
        })
    }

    /// Downloads the artifact at `remote_path` and publishes it at `local_path`.
    ///
    /// Transient failures are retried, and the whole download, including retries, is bounded
    /// by the `max_download_timeout`.
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), FetchError> {
        let location = RemoteLocation::parse(remote_path)?;

        let timeout = self.timeouts.max_download;
        let job = retry(|| self.dispatch_download(&location, local_path));
        let result = match tokio::time::timeout(timeout, job).await {
            Err(_) => Err(FetchError::Timeout(timeout)),
            Ok(result) => result,
        };

        match &result {
            Ok(()) => tracing::debug!("File `{}` fetched successfully", location),
            Err(err) => tracing::debug!(
                error = err as &dyn std::error::Error,
                source = location.source_name(),
                "File `{}` fetching failed",
                location,
            ),
        }

        result
    }

    /// Dispatches one download attempt to the appropriate backend.
    async fn dispatch_download(
        &self,
        location: &RemoteLocation,
        local_path: &Path,
    ) -> Result<(), FetchError> {
        let parent = local_path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "local path has no parent")
        })?;
        tokio::fs::create_dir_all(parent).await?;

        if let RemoteLocation::Filesystem(path) = location
            && tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
        {
            return self.download_dir(path, local_path).await;
        }

        let temp_file = tempfile_in_parent(local_path)?;
        let mut destination = File::from_std(temp_file.reopen()?);
        match location {
            RemoteLocation::Filesystem(path) => {
                self.fs.download_source(path, &mut destination).await
            }
            RemoteLocation::Http(url) => self.http.download_source(url, &mut destination).await,
            RemoteLocation::S3 { bucket, key } => {
                self.s3.download_source(bucket, key, &mut destination).await
            }
        }?;
        destination.flush().await?;
        drop(destination);

        let local_path = local_path.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut temp_file = temp_file;
            // Treat decompression errors as malformed files. It is more likely that
            // the error comes from a corrupt file than a local file system error.
            maybe_decompress_file(&mut temp_file)
                .map_err(|e| FetchError::Malformed(e.to_string()))?;
            temp_file.persist(&local_path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| FetchError::Io(io::Error::other(e)))?
    }

    /// Copies a directory into a temp directory next to `local_path`, then renames it.
    async fn download_dir(&self, path: &Path, local_path: &Path) -> Result<(), FetchError> {
        let parent = local_path.parent().ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let temp_dir = tempfile::Builder::new().prefix(".tmp").tempdir_in(parent)?;

        self.fs.download_dir(path, temp_dir.path()).await?;

        // A directory cannot be renamed over a non-empty one.
        if tokio::fs::symlink_metadata(local_path)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            tokio::fs::remove_dir_all(local_path).await?;
        }
        // `temp_dir` only cleans up when the rename did not happen.
        tokio::fs::rename(temp_dir.path(), local_path).await?;
        Ok(())
    }
}

impl Fetcher for DownloadService {
    fn fetch<'a>(
        &'a self,
        remote_path: &'a str,
        local_path: &'a Path,
        expected_size: u64,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        tracing::trace!(remote_path, expected_size, "Starting download");
        Box::pin(self.download(remote_path, local_path))
    }
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
///
/// Only [transient](FetchError::is_transient) errors are retried.
pub async fn retry<G, F, T>(task_gen: G) -> Result<T, FetchError>
where
    G: Fn() -> F,
    F: Future<Output = Result<T, FetchError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_retry = matches!(&result, Err(err) if err.is_transient());
        if !should_retry || tries >= 3 {
            break result;
        }

        tracing::trace!(tries, "Retrying download");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Writes a stream of byte chunks into `destination`.
async fn download_stream(
    stream: impl Stream<Item = Result<Bytes, FetchError>>,
    destination: &mut File,
) -> Result<(), FetchError> {
    futures::pin_mut!(stream);

    while let Some(chunk) = stream.next().await.transpose()? {
        destination.write_all(&chunk).await?;
    }

    Ok(())
}
