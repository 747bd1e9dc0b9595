//! GCS-backed data source over the JSON API.
//!
//! Object content is streamed with an `alt=media` GET, authorized by a bearer
//! token from either application default credentials or a service account
//! key.
//! See: <https://cloud.google.com/storage/docs/streaming-downloads>

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use futures_util::TryStreamExt;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, StatusCode};
use tokio::io;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::metrics::SOURCE_METRICS;
use crate::transfer::TransferState;
use crate::{
    endpoint_origin, extract_bucket_and_object, DataSource, DownloadError, ObjectClient,
    ProcessingPhase, SourceStream,
};

const GCS_SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_only"];

const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Builds the backend client for a GCS data source. Swappable so tests run
/// against canned clients instead of the real service.
#[async_trait]
pub trait GcsClientFactory: Send + Sync {
    async fn create(
        &self,
        endpoint: &Url,
        service_account_key: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>>;
}

/// Production factory: application default credentials when no key is given,
/// otherwise the service account key file.
pub struct DefaultGcsClientFactory;

#[async_trait]
impl GcsClientFactory for DefaultGcsClientFactory {
    async fn create(
        &self,
        endpoint: &Url,
        service_account_key: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        debug!("creating gcs client for endpoint {endpoint}");

        let token_provider: Arc<dyn TokenProvider> = match service_account_key {
            // GOOGLE_APPLICATION_CREDENTIALS and the other default sources
            None => gcp_auth::provider()
                .await
                .context("resolving application default credentials")?,
            Some(key_path) => Arc::new(
                CustomServiceAccount::from_file(key_path.as_std_path())
                    .with_context(|| format!("loading service account key {key_path}"))?,
            ),
        };

        // gs:// sources go to the public endpoint; http(s) sources name the
        // endpoint host themselves.
        let base_url = match endpoint.scheme() {
            "gs" => DEFAULT_GCS_ENDPOINT.to_string(),
            _ => endpoint_origin(endpoint),
        };

        Ok(Arc::new(GcsClient {
            http_client: Client::new(),
            token_provider,
            base_url,
        }))
    }
}

struct GcsClient {
    http_client: Client,
    token_provider: Arc<dyn TokenProvider>,
    base_url: String,
}

#[async_trait]
impl ObjectClient for GcsClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<SourceStream, DownloadError> {
        let encoded_key: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        let stream_uri = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.base_url, bucket, encoded_key
        );

        let token = self
            .token_provider
            .token(GCS_SCOPES)
            .await
            .map_err(|e| DownloadError::Other(anyhow::Error::new(e).context("acquiring gcs token")))?;

        let started_at = std::time::Instant::now();
        let response = self
            .http_client
            .get(&stream_uri)
            .bearer_auth(token.as_str())
            .send()
            .await;
        SOURCE_METRICS.observe_get_object(
            "gcs",
            matches!(&response, Ok(r) if r.status().is_success()),
            started_at,
        );

        let response = response
            .map_err(|e| DownloadError::Other(anyhow::Error::new(e).context("download gcs object")))?;
        if !response.status().is_success() {
            return match response.status() {
                StatusCode::NOT_FOUND => Err(DownloadError::NotFound),
                status => Err(DownloadError::Other(anyhow::anyhow!(
                    "GCS GET returned {status} for {stream_uri}"
                ))),
            };
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(io::BufReader::new(StreamReader::new(stream))))
    }
}

/// Data source backed by a Google Cloud Storage bucket.
pub struct GcsDataSource {
    client: Arc<dyn ObjectClient>,
    state: TransferState,
}

impl GcsDataSource {
    /// `endpoint` is a `gs://bucket/object...` URL or an `http(s)` URL whose
    /// path carries `bucket/object...`. Without a key path, application
    /// default credentials are used.
    pub async fn new(
        endpoint: &str,
        service_account_key: Option<&Utf8Path>,
    ) -> anyhow::Result<Self> {
        Self::with_factory(endpoint, service_account_key, &DefaultGcsClientFactory).await
    }

    /// Same as [`GcsDataSource::new`] with the client factory injected.
    pub async fn with_factory(
        endpoint: &str,
        service_account_key: Option<&Utf8Path>,
        factory: &dyn GcsClientFactory,
    ) -> anyhow::Result<Self> {
        let url =
            Url::parse(endpoint).with_context(|| format!("parsing gcs endpoint {endpoint}"))?;
        let (bucket, object) = match url.scheme() {
            // gs URLs carry the bucket as the host
            "gs" => (
                url.host_str().unwrap_or_default().to_string(),
                url.path().trim_start_matches('/').to_string(),
            ),
            _ => {
                let (bucket, object) =
                    extract_bucket_and_object(url.path().trim_start_matches('/'));
                (bucket.to_string(), object.to_string())
            }
        };
        let client = factory
            .create(&url, service_account_key)
            .await
            .with_context(|| format!("creating gcs client for {url}"))?;
        Ok(Self {
            client,
            state: TransferState::new(url, bucket, object),
        })
    }
}

#[async_trait]
impl DataSource for GcsDataSource {
    async fn info(&mut self) -> anyhow::Result<ProcessingPhase> {
        self.state.info(self.client.as_ref()).await
    }

    async fn transfer(&mut self, scratch_dir: &Utf8Path) -> anyhow::Result<ProcessingPhase> {
        self.state.transfer(scratch_dir).await
    }

    async fn transfer_file(&mut self, dest: &Utf8Path) -> anyhow::Result<ProcessingPhase> {
        self.state.transfer_file(dest).await
    }

    fn phase(&self) -> Option<ProcessingPhase> {
        self.state.phase()
    }

    fn url(&self) -> &Url {
        self.state.url()
    }

    fn close(&mut self) {
        self.state.close();
    }
}
