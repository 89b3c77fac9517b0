use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::FetchError;

/// Where an artifact is fetched from, parsed from the opaque remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLocation {
    /// A file or directory on the local filesystem (`file:///…` or an absolute path).
    Filesystem(PathBuf),
    /// An `http://` or `https://` URL.
    Http(Url),
    /// An object in an S3 bucket (`s3://bucket/key`).
    S3 { bucket: String, key: String },
}

impl RemoteLocation {
    pub fn parse(remote_path: &str) -> Result<Self, FetchError> {
        let unsupported = || FetchError::UnsupportedLocation(remote_path.to_owned());

        if Path::new(remote_path).is_absolute() {
            return Ok(Self::Filesystem(PathBuf::from(remote_path)));
        }

        // S3 keys are taken verbatim, they are not URL-encoded.
        if let Some(rest) = remote_path.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').ok_or_else(unsupported)?;
            if bucket.is_empty() || key.is_empty() {
                return Err(unsupported());
            }
            return Ok(Self::S3 {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }

        let url = Url::parse(remote_path).map_err(|_| unsupported())?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Self::Filesystem)
                .map_err(|_| unsupported()),
            "http" | "https" => Ok(Self::Http(url)),
            _ => Err(unsupported()),
        }
    }

    /// A short name of the backend, used in logs.
    pub fn source_name(&self) -> &'static str {
        match self {
            Self::Filesystem(_) => "filesystem",
            Self::Http(_) => "http",
            Self::S3 { .. } => "s3",
        }
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem(path) => write!(f, "file://{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
            Self::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filesystem() {
        assert_eq!(
            RemoteLocation::parse("/srv/artifacts/a.zip").unwrap(),
            RemoteLocation::Filesystem("/srv/artifacts/a.zip".into())
        );
        assert_eq!(
            RemoteLocation::parse("file:///srv/artifacts/a.zip").unwrap(),
            RemoteLocation::Filesystem("/srv/artifacts/a.zip".into())
        );
    }

    #[test]
    fn test_parse_http() {
        let location = RemoteLocation::parse("https://example.com/a/b.tgz?sig=1").unwrap();
        assert_eq!(location.source_name(), "http");
        assert_eq!(location.to_string(), "https://example.com/a/b.tgz?sig=1");
    }

    #[test]
    fn test_parse_s3() {
        assert_eq!(
            RemoteLocation::parse("s3://bucket/a key/with spaces").unwrap(),
            RemoteLocation::S3 {
                bucket: "bucket".into(),
                key: "a key/with spaces".into(),
            }
        );
        for invalid in ["s3://bucket", "s3://bucket/", "s3:///key"] {
            assert!(matches!(
                RemoteLocation::parse(invalid),
                Err(FetchError::UnsupportedLocation(_))
            ));
        }
    }

    #[test]
    fn test_parse_unsupported() {
        for invalid in ["gs://bucket/key", "relative/path", "", "ftp://host/file"] {
            let err = RemoteLocation::parse(invalid).unwrap_err();
            assert!(
                matches!(&err, FetchError::UnsupportedLocation(p) if p == invalid),
                "{invalid}: {err:?}"
            );
        }
    }
}
