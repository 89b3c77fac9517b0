//! Concurrent requests against a single cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use artifact_cache::{ArtifactCache, CacheError, CacheStats};
use serde::{Deserialize, Serialize};

/// One `get` call, as listed in a batch file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub key: String,
    pub size: u64,
    pub remote: String,
    pub local: PathBuf,
    /// Defaults to the empty name, which addresses single-file artifacts.
    #[serde(default)]
    pub member: String,
}

/// The outcome of one [`Request`].
#[derive(Debug, Serialize)]
pub struct RequestReport {
    pub key: String,
    pub member: String,
    /// The size of the returned member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    /// The full error chain if the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestReport {
    fn new(request: Request, result: Result<usize, CacheError>) -> Self {
        let (bytes, error) = match result {
            Ok(len) => (Some(len), None),
            Err(error) => (None, Some(format!("{:#}", anyhow::Error::new(error)))),
        };
        Self {
            key: request.key,
            member: request.member,
            bytes,
            error,
        }
    }
}

/// Results in request order, followed by the cache's bookkeeping after all requests finished.
#[derive(Debug, Serialize)]
pub struct Report {
    pub results: Vec<RequestReport>,
    pub stats: CacheStats,
}

/// Reads a YAML list of requests.
pub fn load(path: &Path) -> Result<Vec<Request>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file `{}`", path.display()))?;
    serde_yaml::from_str(&contents).context("failed to parse batch file")
}

/// Issues all `requests` at once, each on its own task.
pub async fn run(cache: Arc<ArtifactCache>, requests: Vec<Request>) -> Result<Report> {
    tracing::info!(requests = requests.len(), "Running batch");

    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let result = cache
                    .get(
                        request.key.as_str(),
                        request.size,
                        request.local.clone(),
                        request.remote.clone(),
                        &request.member,
                    )
                    .await
                    .map(|bytes| bytes.len());
                RequestReport::new(request, result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.context("request task panicked")?);
    }

    Ok(Report {
        results,
        stats: cache.stats().await,
    })
}

#[cfg(test)]
mod tests {
    use artifact_cache::Config;
    use artifact_cache_test::{fixture, setup, tempdir};

    use super::*;

    fn cache(capacity: u64) -> Arc<ArtifactCache> {
        let mut config = Config::default();
        config.cache.capacity = capacity;
        Arc::new(ArtifactCache::from_config(&config).unwrap())
    }

    fn request(key: &str, size: u64, remote: &Path, local: &Path, member: &str) -> Request {
        Request {
            key: key.to_owned(),
            size,
            remote: remote.to_string_lossy().into_owned(),
            local: local.to_owned(),
            member: member.to_owned(),
        }
    }

    #[test]
    fn test_load() {
        let dir = tempdir();
        let path = dir.path().join("batch.yml");
        std::fs::write(
            &path,
            r#"
            - key: build-1
              size: 252
              remote: s3://ci-artifacts/build-1.zip
              local: /var/cache/artifacts/build-1
              member: logs/build.log
            - key: readme
              size: 12
              remote: https://example.com/readme.txt
              local: /var/cache/artifacts/readme
            "#,
        )
        .unwrap();

        let requests = load(&path).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0],
            Request {
                key: "build-1".into(),
                size: 252,
                remote: "s3://ci-artifacts/build-1.zip".into(),
                local: "/var/cache/artifacts/build-1".into(),
                member: "logs/build.log".into(),
            }
        );
        assert_eq!(requests[1].member, "");
    }

    #[test]
    fn test_load_invalid() {
        let dir = tempdir();
        let path = dir.path().join("batch.yml");
        std::fs::write(&path, "- key: a\n  size: -1\n").unwrap();

        let error = load(&path).unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"failed to parse batch file");

        let error = load(&dir.path().join("missing.yml")).unwrap_err();
        assert!(error.to_string().starts_with("failed to read batch file"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run() {
        setup();
        let cache_dir = tempdir();
        let missing = cache_dir.path().join("nowhere.txt");

        let requests = vec![
            request(
                "hello",
                12,
                &fixture("artifacts/hello.txt"),
                &cache_dir.path().join("hello"),
                "",
            ),
            request(
                "hello",
                12,
                &fixture("artifacts/hello.txt"),
                &cache_dir.path().join("hello"),
                "",
            ),
            request(
                "bundle",
                252,
                &fixture("artifacts/bundle.zip"),
                &cache_dir.path().join("bundle"),
                "hello.txt",
            ),
            request("missing", 5, &missing, &cache_dir.path().join("missing"), ""),
        ];

        let report = run(cache(1024), requests).await.unwrap();

        let bytes: Vec<_> = report.results.iter().map(|r| r.bytes).collect();
        assert_eq!(bytes, [Some(12), Some(12), Some(12), None]);

        let error = report.results[3].error.as_deref().unwrap();
        assert!(error.starts_with("failed to fetch `"), "{error}");
        assert!(error.ends_with("`: not found"), "{error}");

        let stats = report.stats;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.current_size, 264);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.fetch_failures, 1);
        assert!(!cache_dir.path().join("missing").exists());
    }

    #[tokio::test]
    async fn test_report_serialization() {
        setup();
        let cache_dir = tempdir();
        let requests = vec![
            request(
                "hello",
                12,
                &fixture("artifacts/hello.txt"),
                &cache_dir.path().join("hello"),
                "",
            ),
            request(
                "huge",
                2048,
                &fixture("artifacts/hello.txt"),
                &cache_dir.path().join("huge"),
                "",
            ),
        ];

        let report = run(cache(1024), requests).await.unwrap();
        let json = serde_json::to_string(&report.results).unwrap();
        insta::assert_snapshot!(json, @r#"[{"key":"hello","member":"","bytes":12},{"key":"huge","member":"","error":"artifact of 2048 bytes exceeds the cache capacity of 1024 bytes"}]"#);
    }
}
