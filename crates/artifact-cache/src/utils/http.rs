use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Various timeouts for all the downloaders.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// An adaptive timeout per 1GB of content.
    pub streaming: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            streaming: config.streaming_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            streaming: Duration::from_secs(250),
            max_download: Duration::from_secs(315),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Redirects are followed up to 10 hops, except temporary redirects (`302 Found`), which
/// commonly lead to login pages instead of the requested artifact. Those are surfaced
/// to the downloader as the response itself.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::custom(|attempt| {
            if attempt.status() == reqwest::StatusCode::FOUND {
                attempt.stop()
            } else if attempt.previous().len() >= 10 {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        }))
        .build()
}

/// Computes the timeout for streaming `content_length` bytes.
///
/// Scales `timeout_per_gb` with the size, but never goes below 10 seconds.
pub fn content_length_timeout(content_length: u64, timeout_per_gb: Duration) -> Duration {
    let gb = content_length as f64 / (1024.0 * 1024.0 * 1024.0);
    timeout_per_gb.mul_f64(gb).max(Duration::from_secs(10))
}
