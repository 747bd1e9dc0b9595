//! Staging of virtual-machine disk images out of remote object storage for a
//! local conversion pipeline.
//!
//! [`DataSource`] is the phase-driven contract to drive heterogeneous storage
//! backends through the same sequence of connect, inspect, stream and hand
//! off, with a few implementations:
//!   * [`S3DataSource`] reads from any S3-compatible endpoint
//!   * [`GcsDataSource`] reads from Google Cloud Storage
//!
//! A caller constructs a data source from a URL and credentials, calls
//! [`DataSource::info`] to classify the object and select the transfer path,
//! then [`DataSource::transfer`] (container and compressed images, staged
//! into scratch space) or [`DataSource::transfer_file`] (raw images, written
//! straight to the destination). The returned [`ProcessingPhase`] names the
//! external step to run next; any failure lands in the terminal
//! [`ProcessingPhase::Error`].

mod config;
mod error;
mod format;
mod gcs_source;
mod metrics;
mod s3_source;
mod transfer;

use std::pin::Pin;

use async_trait::async_trait;
use camino::Utf8Path;
use tokio::io::AsyncRead;
use tracing::info;
use url::Url;

pub use self::config::{GcsSourceConfig, ImportConfig, S3SourceConfig, SourceKind};
pub use self::error::DownloadError;
pub use self::format::{detect_image_format, ImageFormat, SNIFF_BYTES};
pub use self::gcs_source::{DefaultGcsClientFactory, GcsClientFactory, GcsDataSource};
pub use self::s3_source::{DefaultS3ClientFactory, S3ClientFactory, S3DataSource};

/// Fixed name of the staging file written by [`DataSource::transfer`] inside
/// the caller's scratch directory. One transfer per scratch directory at a
/// time: a second concurrent transfer into the same directory would clobber
/// the first.
pub const SCRATCH_FILE_NAME: &str = "disk-image.tmp";

/// Outcome of the last data source operation and, implicitly, the next step
/// the orchestrator should run: `Convert` invokes format conversion over the
/// staged scratch file, `Resize` invokes the resize step over the destination
/// file, `Error` aborts the import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingPhase {
    /// Terminal: the data source failed and must not be advanced further.
    Error,
    /// `info()` found a container or compressed image; call `transfer()`.
    TransferScratch,
    /// `info()` found a raw image; call `transfer_file()`.
    TransferDataFile,
    /// `transfer()` finished; run the external conversion.
    Convert,
    /// `transfer_file()` finished; run the external resize.
    Resize,
}

/// A streaming source object body.
pub type SourceStream = Pin<Box<dyn AsyncRead + Send>>;

/// Object-storage retrieval capability: fetch an object's content as a stream
/// given bucket and key. Production implementations talk to S3 or GCS; test
/// doubles return canned streams or synthetic errors.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<SourceStream, DownloadError>;
}

/// The transfer state machine every backend variant exposes.
///
/// Operations return the next [`ProcessingPhase`] on success. On failure the
/// instance records the terminal [`ProcessingPhase::Error`] (visible through
/// [`DataSource::phase`]) and the returned error carries the detail; further
/// state-machine calls then fail fast without touching the backend.
#[async_trait]
pub trait DataSource: Send {
    /// Opens the remote object lazily, sniffs a bounded prefix and selects
    /// the transfer path. Sniffing is non-destructive: the transfer paths
    /// still see the whole object. A single attempt; any failure is final.
    async fn info(&mut self) -> anyhow::Result<ProcessingPhase>;

    /// Streams the object into [`SCRATCH_FILE_NAME`] inside `scratch_dir`.
    /// Requires a prior `info()` returning
    /// [`ProcessingPhase::TransferScratch`]; returns
    /// [`ProcessingPhase::Convert`], with [`DataSource::url`] now naming the
    /// staged file.
    async fn transfer(&mut self, scratch_dir: &Utf8Path) -> anyhow::Result<ProcessingPhase>;

    /// Streams the object directly to `dest`. Requires a prior `info()`
    /// returning [`ProcessingPhase::TransferDataFile`]; returns
    /// [`ProcessingPhase::Resize`].
    async fn transfer_file(&mut self, dest: &Utf8Path) -> anyhow::Result<ProcessingPhase>;

    /// The recorded outcome of the last operation, `None` before the first
    /// `info()`.
    fn phase(&self) -> Option<ProcessingPhase>;

    /// The current source location; after a successful `transfer()` this is
    /// the staged scratch file, for downstream tooling to pick up.
    fn url(&self) -> &Url;

    /// Releases the owned stream, if any. Idempotent, and safe to call on a
    /// data source that never opened one.
    fn close(&mut self);
}

/// Backend selected from configuration.
pub enum GenericDataSource {
    S3(S3DataSource),
    Gcs(GcsDataSource),
}

impl GenericDataSource {
    pub async fn from_config(config: &ImportConfig) -> anyhow::Result<Self> {
        match &config.source {
            SourceKind::AwsS3(s3_config) => {
                info!("using s3 source {}", s3_config.endpoint);
                Ok(GenericDataSource::S3(
                    S3DataSource::new(
                        &s3_config.endpoint,
                        &s3_config.access_key_id,
                        &s3_config.secret_access_key,
                        s3_config.cert_dir.as_deref(),
                    )
                    .await?,
                ))
            }
            SourceKind::Gcs(gcs_config) => {
                info!("using gcs source {}", gcs_config.endpoint);
                Ok(GenericDataSource::Gcs(
                    GcsDataSource::new(
                        &gcs_config.endpoint,
                        gcs_config.service_account_key.as_deref(),
                    )
                    .await?,
                ))
            }
        }
    }
}

#[async_trait]
impl DataSource for GenericDataSource {
    async fn info(&mut self) -> anyhow::Result<ProcessingPhase> {
        match self {
            GenericDataSource::S3(s3) => s3.info().await,
            GenericDataSource::Gcs(gcs) => gcs.info().await,
        }
    }

    async fn transfer(&mut self, scratch_dir: &Utf8Path) -> anyhow::Result<ProcessingPhase> {
        match self {
            GenericDataSource::S3(s3) => s3.transfer(scratch_dir).await,
            GenericDataSource::Gcs(gcs) => gcs.transfer(scratch_dir).await,
        }
    }

    async fn transfer_file(&mut self, dest: &Utf8Path) -> anyhow::Result<ProcessingPhase> {
        match self {
            GenericDataSource::S3(s3) => s3.transfer_file(dest).await,
            GenericDataSource::Gcs(gcs) => gcs.transfer_file(dest).await,
        }
    }

    fn phase(&self) -> Option<ProcessingPhase> {
        match self {
            GenericDataSource::S3(s3) => s3.phase(),
            GenericDataSource::Gcs(gcs) => gcs.phase(),
        }
    }

    fn url(&self) -> &Url {
        match self {
            GenericDataSource::S3(s3) => s3.url(),
            GenericDataSource::Gcs(gcs) => gcs.url(),
        }
    }

    fn close(&mut self) {
        match self {
            GenericDataSource::S3(s3) => s3.close(),
            GenericDataSource::Gcs(gcs) => gcs.close(),
        }
    }
}

/// Splits a `bucket/key...` style path on the first separator: the bucket is
/// the first segment, the object is everything after it, further separators
/// included. No normalization. Without a separator the whole string is the
/// bucket and the object is empty; the backend then reports the object as
/// absent when it is first fetched.
pub fn extract_bucket_and_object(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((bucket, object)) => (bucket, object),
        None => (path, ""),
    }
}

/// `scheme://host[:port]` of the URL, the part a backend client needs to
/// address the service.
pub(crate) fn endpoint_origin(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    origin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bucket_and_object_splits_on_first_separator() {
        assert_eq!(
            extract_bucket_and_object("Bucket1/Object.tmp"),
            ("Bucket1", "Object.tmp")
        );
        assert_eq!(
            extract_bucket_and_object("Bucket1/Folder1/Object.tmp"),
            ("Bucket1", "Folder1/Object.tmp")
        );
    }

    #[test]
    fn extract_bucket_and_object_without_separator() {
        assert_eq!(extract_bucket_and_object("Bucket1"), ("Bucket1", ""));
        assert_eq!(extract_bucket_and_object(""), ("", ""));
    }

    #[test]
    fn endpoint_origin_strips_the_path() {
        let url = Url::parse("https://minio.local:9000/bucket/folder/object").unwrap();
        assert_eq!(endpoint_origin(&url), "https://minio.local:9000");

        let url = Url::parse("http://region.amazon.com/bucket-1/object-1").unwrap();
        assert_eq!(endpoint_origin(&url), "http://region.amazon.com");
    }
}
