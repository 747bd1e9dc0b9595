//! S3-backed data source over the AWS SDK.
//!
//! The endpoint origin of the source URL is used as the bucket endpoint with
//! path-style addressing, which is what S3-compatible object stores expect.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_config::imds::credentials::ImdsCredentialsProvider;
use aws_config::meta::credentials::CredentialsProviderChain;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::cache::CredentialsCache;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Config, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use camino::Utf8Path;
use tokio::io;
use tracing::debug;
use url::Url;

use crate::metrics::SOURCE_METRICS;
use crate::transfer::TransferState;
use crate::{
    endpoint_origin, extract_bucket_and_object, DataSource, DownloadError, ObjectClient,
    ProcessingPhase, SourceStream,
};

/// Region is nominal for S3-compatible endpoints addressed by URL; AWS proper
/// still gets its region from `AWS_REGION`/`AWS_DEFAULT_REGION` through the
/// default chain.
const FALLBACK_REGION: &str = "us-east-1";

/// Builds the backend client for an S3 data source. Swappable so tests run
/// against canned clients instead of the SDK.
#[async_trait]
pub trait S3ClientFactory: Send + Sync {
    async fn create(
        &self,
        endpoint: &Url,
        access_key: &str,
        secret_key: &str,
        cert_dir: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>>;
}

/// Production factory, bound to `aws-sdk-s3`.
pub struct DefaultS3ClientFactory;

#[async_trait]
impl S3ClientFactory for DefaultS3ClientFactory {
    async fn create(
        &self,
        endpoint: &Url,
        access_key: &str,
        secret_key: &str,
        cert_dir: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        debug!("creating s3 client for endpoint {endpoint}");

        let region = RegionProviderChain::default_provider()
            .or_else(Region::new(FALLBACK_REGION))
            .region()
            .await;

        let mut config_builder = Config::builder()
            .region(region)
            .credentials_cache(CredentialsCache::lazy())
            .endpoint_url(endpoint_origin(endpoint))
            .force_path_style(true);

        config_builder = if access_key.is_empty() {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", then imds v2
            config_builder.credentials_provider(
                CredentialsProviderChain::first_try(
                    "env",
                    EnvironmentVariableCredentialsProvider::new(),
                )
                .or_else("imds", ImdsCredentialsProvider::builder().build()),
            )
        } else {
            config_builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "image-import-static",
            ))
        };

        if let Some(cert_dir) = cert_dir {
            let tls_config = rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(trust_roots(cert_dir)?)
                .with_no_client_auth();
            let connector = hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .build();
            config_builder = config_builder
                .http_connector(aws_smithy_client::hyper_ext::Adapter::builder().build(connector));
        }

        Ok(Arc::new(S3Client {
            client: Client::from_conf(config_builder.build()),
        }))
    }
}

/// The webpki baseline plus every PEM certificate found in `cert_dir`.
fn trust_roots(cert_dir: &Utf8Path) -> anyhow::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    for entry in
        std::fs::read_dir(cert_dir).with_context(|| format!("reading cert dir {cert_dir}"))?
    {
        let path = entry
            .with_context(|| format!("reading cert dir {cert_dir}"))?
            .path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("pem" | "crt" | "cer") => {}
            _ => continue,
        }
        let pem = std::fs::read(&path)
            .with_context(|| format!("reading cert {}", path.display()))?;
        for der in rustls_pemfile::certs(&mut pem.as_slice())
            .with_context(|| format!("parsing certs in {}", path.display()))?
        {
            roots
                .add(&rustls::Certificate(der))
                .with_context(|| format!("adding cert from {}", path.display()))?;
        }
    }
    Ok(roots)
}

struct S3Client {
    client: Client,
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<SourceStream, DownloadError> {
        let started_at = std::time::Instant::now();
        let get_object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;
        SOURCE_METRICS.observe_get_object("s3", get_object.is_ok(), started_at);

        match get_object {
            Ok(object_output) => Ok(Box::pin(io::BufReader::new(
                object_output.body.into_async_read(),
            ))),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                Err(DownloadError::NotFound)
            }
            Err(e) => Err(DownloadError::Other(
                anyhow::Error::new(e).context("get s3 object"),
            )),
        }
    }
}

/// Data source backed by an S3-compatible bucket.
pub struct S3DataSource {
    client: Arc<dyn ObjectClient>,
    state: TransferState,
}

impl S3DataSource {
    /// `endpoint` is an `http(s)://host/bucket/object...` URL. An empty
    /// access key falls back to the SDK's environment/IMDS credentials.
    pub async fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        cert_dir: Option<&Utf8Path>,
    ) -> anyhow::Result<Self> {
        Self::with_factory(
            endpoint,
            access_key,
            secret_key,
            cert_dir,
            &DefaultS3ClientFactory,
        )
        .await
    }

    /// Same as [`S3DataSource::new`] with the client factory injected.
    pub async fn with_factory(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        cert_dir: Option<&Utf8Path>,
        factory: &dyn S3ClientFactory,
    ) -> anyhow::Result<Self> {
        let url =
            Url::parse(endpoint).with_context(|| format!("parsing s3 endpoint {endpoint}"))?;
        let (bucket, object) = extract_bucket_and_object(url.path().trim_start_matches('/'));
        let (bucket, object) = (bucket.to_string(), object.to_string());
        let client = factory
            .create(&url, access_key, secret_key, cert_dir)
            .await
            .with_context(|| format!("creating s3 client for {url}"))?;
        Ok(Self {
            client,
            state: TransferState::new(url, bucket, object),
        })
    }
}

#[async_trait]
impl DataSource for S3DataSource {
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
