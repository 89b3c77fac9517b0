//! A fixed-capacity local cache for artifacts stored in a remote blob store.
//!
//! Callers request a single member of an artifact by a stable key. The first request for a key
//! fetches the artifact to a local path, concurrent and later requests are served from that
//! local copy, and the oldest artifacts are evicted once the declared sizes exceed the
//! capacity.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use artifact_cache::{ArtifactCache, Config};
//!
//! let cache = ArtifactCache::from_config(&Config::default())?;
//! let log = cache
//!     .get(
//!         "build-1234",
//!         4096,
//!         "/var/cache/artifacts/build-1234",
//!         "s3://ci-artifacts/build-1234.zip",
//!         "logs/build.log",
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod key;
pub mod logging;
pub mod reader;
pub mod storage;
pub mod utils;


pub use cache::{ArtifactCache, CacheStats};
pub use config::{Config, EvictionPolicy};
pub use download::{DownloadService, Fetcher};
pub use error::{CacheError, FetchError, ReadError};
pub use key::CacheKey;
pub use reader::{ArtifactReader, Reader};
pub use storage::{LocalStorage, Storage};
