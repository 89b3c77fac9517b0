//! Support to download from HTTP sources.

use futures::TryStreamExt;
use reqwest::{Client, StatusCode, Url, header};
use tokio::fs::File;

use crate::error::FetchError;
use crate::utils::http::{DownloadTimeouts, content_length_timeout};

use super::USER_AGENT;

/// Downloader implementation that supports HTTP(S) locations.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpDownloader {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Downloads an artifact hosted on an HTTP server.
    pub async fn download_source(&self, url: &Url, destination: &mut File) -> Result<(), FetchError> {
        tracing::debug!("Fetching artifact from `{}`", url);

        let request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send();
        let response = tokio::time::timeout(self.timeouts.head, request)
            .await
            .map_err(|_| FetchError::Timeout(self.timeouts.head))??;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        tracing::trace!("Success hitting `{url}`");

        let timeout = response
            .content_length()
            .map(|cl| content_length_timeout(cl, self.timeouts.streaming));
        let stream = response.bytes_stream().map_err(FetchError::from);
        let future = super::download_stream(stream, destination);

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| FetchError::Timeout(timeout))?,
            None => future.await,
        }
    }
}

/// Infers the [`FetchError`] from an unsuccessful status code.
///
/// Redirects are followed by the client, except for `302 Found`.
fn status_error(url: &Url, status: StatusCode) -> FetchError {
    debug_assert!(!status.is_success());

    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        FetchError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading from `{url}`: {status}");
        FetchError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        FetchError::Download(status.to_string())
    }
}
