use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Which entry is evicted first when the cache is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// The oldest insertion is evicted, hits do not matter.
    #[default]
    Fifo,
    /// A hit moves the entry to the back of the eviction order.
    Lru,
}

/// Sizing and eviction of the artifact cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum total size of all cached artifacts, in bytes.
    pub capacity: u64,
    /// The eviction policy.
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10 * 1024 * 1024 * 1024,
            policy: EvictionPolicy::Fifo,
        }
    }
}

/// Access to `s3://` locations.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct S3Config {
    /// The default region of buckets.
    pub region: String,
    /// A custom endpoint, e.g. for minio or localstack.
    pub endpoint: Option<String>,
    /// Static credentials. Without them, the AWS default provider chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Regions of individual buckets that are not in the default region.
    pub bucket_regions: BTreeMap<String, String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_owned(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            bucket_regions: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Size and eviction policy of the cache.
    pub cache: CacheConfig,

    /// The maximum timeout for downloads.
    ///
    /// This is the upper limit the download service will take for downloading a single
    /// artifact, regardless of how many retries are involved.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection in a download.
    ///
    /// This timeout applies to each individual attempt if retries take place.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout until the response headers of a download arrive.
    ///
    /// This timeout applies to each individual attempt if retries take place.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// The timeout per GB for streaming a download.
    ///
    /// For downloads with a known size, this timeout applies per individual
    /// download attempt. If the download size is not known, it is ignored and
    /// only `max_download_timeout` applies. The minimum streaming timeout is 10s.
    #[serde(with = "humantime_serde")]
    pub streaming_timeout: Duration,

    /// Access to S3 buckets.
    pub s3: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            cache: CacheConfig::default(),
            // We want to have a hard download timeout of 5 minutes.
            // This means a download connection needs to sustain ~6,7MB/s to download a 2GB file.
            max_download_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
            // Allow a 4MB/s connection to download 1GB without timing out.
            streaming_timeout: Duration::from_secs(250),
            s3: S3Config::default(),
        }
    }
}

impl Config {
    /// Loads the config from the YAML file at `path`, or returns the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache.capacity, 10 * 1024 * 1024 * 1024);
        assert_eq!(cfg.cache.policy, EvictionPolicy::Fifo);
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(300));
        assert_eq!(cfg.s3, S3Config::default());
    }

    #[test]
    fn test_partial_config() {
        // Setting individual values keeps the defaults of all others.
        let yaml = r#"
            logging:
              level: debug
            cache:
              capacity: 30
              policy: lru
            head_timeout: 2s
            s3:
              endpoint: http://localhost:9000
              bucket_regions:
                logs: eu-central-1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(
            cfg.cache,
            CacheConfig {
                capacity: 30,
                policy: EvictionPolicy::Lru
            }
        );
        assert_eq!(cfg.head_timeout, Duration::from_secs(2));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(1));
        assert_eq!(cfg.s3.region, "us-east-1");
        assert_eq!(cfg.s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(cfg.s3.bucket_regions["logs"], "eu-central-1");
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let yaml = r#"
            cache:
              capacity: 30
              cache_dir: /tmp/ignored
            something_else: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.capacity, 30);
    }

    #[test]
    fn test_empty_file() {
        let err = Config::from_reader(" \n".as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"config file empty");
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse config YAML");
        assert!(format!("{err:#}").contains("unknown variant `loud`"));
    }

    #[test]
    fn test_get_missing_file() {
        let dir = artifact_cache_test::tempdir();
        let err = Config::get(Some(&dir.path().join("missing.yml"))).unwrap_err();
        assert_eq!(err.to_string(), "failed to open configuration file");
    }
}
