//! Support to download from S3 buckets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
pub use aws_sdk_s3::Error as S3Error;
use futures::TryStreamExt as _;
use tokio::fs::File;

use crate::config::S3Config;
use crate::error::FetchError;
use crate::utils::http::{DownloadTimeouts, content_length_timeout};

/// S3 clients per region.
type ClientCache = moka::future::Cache<String, Arc<Client>>;

/// Downloader implementation that supports `s3://` locations.
pub struct S3Downloader {
    config: S3Config,
    client_cache: ClientCache,
    timeouts: DownloadTimeouts,
}

impl fmt::Debug for S3Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Downloader")
            .field("region", &self.config.region)
            .field("endpoint", &self.config.endpoint)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl S3Downloader {
    pub fn new(config: S3Config, timeouts: DownloadTimeouts, s3_client_capacity: u64) -> Self {
        Self {
            config,
            client_cache: ClientCache::new(s3_client_capacity),
            timeouts,
        }
    }

    /// The region a bucket lives in, falling back to the configured default region.
    fn region_for(&self, bucket: &str) -> &str {
        self.config
            .bucket_regions
            .get(bucket)
            .unwrap_or(&self.config.region)
    }

    async fn get_s3_client(&self, region: &str) -> Arc<Client> {
        let init = Box::pin(async {
            tracing::debug!(region, "Creating S3 client");
            Arc::new(self.create_s3_client(region).await)
        });

        self.client_cache
            .entry_by_ref(region)
            .or_insert_with(init)
            .await
            .into_value()
    }

    async fn create_s3_client(&self, region: &str) -> Client {
        let mut config_loader = aws_config::from_env().region(Region::new(region.to_owned()));

        // Without static keys, the default provider chain (environment, profile, container,
        // instance metadata) is used.
        if let (Some(access_key), Some(secret_key)) =
            (&self.config.access_key, &self.config.secret_key)
        {
            config_loader = config_loader.credentials_provider(Credentials::from_keys(
                access_key,
                secret_key,
                None,
            ));
        }

        if let Some(endpoint_url) = &self.config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint_url);
        };

        let config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            // custom endpoints (minio, localstack) usually do not resolve bucket subdomains
            .force_path_style(self.config.endpoint.is_some())
            .build();
        Client::from_conf(s3_config)
    }

    /// Downloads an object stored in an S3 bucket.
    pub async fn download_source(
        &self,
        bucket: &str,
        key: &str,
        destination: &mut File,
    ) -> Result<(), FetchError> {
        tracing::debug!("Fetching from s3: {} (from {})", key, bucket);

        let client = self.get_s3_client(self.region_for(bucket)).await;
        let request = client.get_object().bucket(bucket).key(key).send();

        let timeout = self.timeouts.head;
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("Skipping response from s3://{}/{}: {}", bucket, key, err);

                // we first check for some specific errors variants, and afterwards we cast this to
                // a very generic `S3Error` that internally converts things around.
                match &err {
                    SdkError::TimeoutError(_) => {
                        return Err(FetchError::Timeout(Duration::ZERO));
                    }
                    SdkError::ServiceError(service_err) => {
                        // The errors and status codes are explained here:
                        // <https://docs.aws.amazon.com/AmazonS3/latest/API/ErrorResponses.html#ErrorCodeList>
                        let status = service_err.raw().status();
                        let code = service_err.err().code();

                        // NOTE: empty credentials lead to a `AuthorizationHeaderMalformed` error.
                        if matches!(status.as_u16(), 401 | 403)
                            || code == Some("AuthorizationHeaderMalformed")
                        {
                            let details =
                                service_err.err().message().unwrap_or_default().to_string();
                            return Err(FetchError::PermissionDenied(details));
                        }
                    }
                    _ => {}
                };

                let err = S3Error::from(err);
                return match &err {
                    S3Error::NoSuchBucket(_) | S3Error::NoSuchKey(_) | S3Error::NotFound(_) => {
                        Err(FetchError::NotFound)
                    }
                    // The `From` impl does not map every not-found response to its variant.
                    _ if matches!(err.code(), Some("NoSuchBucket" | "NoSuchKey" | "NotFound")) => {
                        Err(FetchError::NotFound)
                    }
                    _ => {
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            "S3 request failed: {:?}",
                            err.code(),
                        );
                        Err(FetchError::Download(err.to_string()))
                    }
                };
            }
        };

        let timeout = response
            .content_length
            .and_then(|cl| u64::try_from(cl).ok())
            .map(|cl| content_length_timeout(cl, self.timeouts.streaming));

        let mut body = std::pin::pin!(response.body);
        let stream = futures::stream::poll_fn(move |cx| body.as_mut().poll_next(cx))
            .map_err(|err| FetchError::download_error(&err));
        let future = super::download_stream(stream, destination);

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_| FetchError::Timeout(timeout))?,
            None => future.await,
        }
    }
}
