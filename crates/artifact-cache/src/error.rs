use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching an artifact from a remote location.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The artifact was not found at the remote location.
    #[error("not found")]
    NotFound,
    /// The artifact could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The download did not finish in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The artifact could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    Download(String),
    /// The artifact was fetched, but its payload could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The remote path does not name a location any backend understands.
    #[error("unsupported remote location: {0}")]
    UnsupportedLocation(String),
    /// Writing the artifact to the local filesystem failed.
    #[error("local I/O failed")]
    Io(#[from] io::Error),
}

impl FetchError {
    /// Creates a [`FetchError::Download`] from the root cause of `error`.
    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Download(error_string)
    }

    /// Whether retrying the same download could plausibly give a different result.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Download(_) | Self::Io(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// An error that happens when reading a member out of a materialized artifact.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The artifact has no member of that name.
    #[error("member `{0}` not found")]
    MemberNotFound(String),
    /// The member name tries to escape the artifact, e.g. via `..` or an absolute path.
    #[error("invalid member name `{0}`")]
    InvalidMember(String),
    /// The artifact is an archive that could not be opened.
    #[error("malformed archive: {0}")]
    Malformed(String),
    /// The entry has no bytes to read from.
    #[error("artifact is not materialized")]
    NotMaterialized,
    #[error("local I/O failed")]
    Io(#[from] io::Error),
}

impl From<zip::result::ZipError> for ReadError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(e) => Self::Io(e),
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// The errors surfaced by [`ArtifactCache::get`](crate::ArtifactCache::get).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested artifact can never fit, regardless of eviction.
    #[error("artifact of {size} bytes exceeds the cache capacity of {capacity} bytes")]
    Oversize { size: u64, capacity: u64 },
    /// Artifacts must have a positive size.
    #[error("artifact size must be positive")]
    InvalidSize,
    /// The fetcher failed. The entry was removed and a later call starts from scratch.
    ///
    /// The error is shared between all callers that waited on the same fetch.
    #[error("failed to fetch `{remote_path}`")]
    Fetch {
        remote_path: String,
        #[source]
        source: Arc<FetchError>,
    },
    /// The reader failed on a materialized entry. The entry stays cached.
    #[error("failed to read member `{member}`")]
    Read {
        member: String,
        #[source]
        source: ReadError,
    },
    /// Deleting the bytes of an evicted entry failed.
    ///
    /// This is logged and never returned from `get`, the entry is removed from the index anyway.
    #[error("failed to delete evicted artifact at `{}`", path.display())]
    Evict {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    /// Whether the same request may succeed when issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Read { .. })
    }
}
