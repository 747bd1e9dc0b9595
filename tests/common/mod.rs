//! Mock clients and factories: the test seam the data source constructors
//! accept in place of the real backend SDKs.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use camino::Utf8Path;
use image_import::{DownloadError, GcsClientFactory, ObjectClient, S3ClientFactory, SourceStream};
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

/// Deterministic pseudo-random payload, large enough to span several read
/// buffers.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x9e3779b97f4a7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Payload with a QCOW2 signature in front: classified as a container image.
pub fn qcow2_image() -> Vec<u8> {
    let mut data = vec![b'Q', b'F', b'I', 0xfb];
    data.extend(payload(64 * 1024));
    data
}

/// Payload with no recognizable signature: classified as a raw image.
pub fn raw_image() -> Vec<u8> {
    payload(48 * 1024)
}

/// Client returning one canned stream per call.
pub struct MockClient {
    data: Vec<u8>,
}

impl MockClient {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ObjectClient for MockClient {
    async fn get_object(&self, _bucket: &str, _key: &str) -> Result<SourceStream, DownloadError> {
        Ok(Box::pin(std::io::Cursor::new(self.data.clone())))
    }
}

/// Client whose object does not exist.
pub struct NotFoundClient;

#[async_trait]
impl ObjectClient for NotFoundClient {
    async fn get_object(&self, _bucket: &str, _key: &str) -> Result<SourceStream, DownloadError> {
        Err(DownloadError::NotFound)
    }
}

/// Client whose streams yield `good_bytes` of the payload and then fail with
/// an I/O error, like a connection dropped mid-download.
pub struct BrokenStreamClient {
    data: Vec<u8>,
    good_bytes: usize,
}

impl BrokenStreamClient {
    pub fn new(data: Vec<u8>, good_bytes: usize) -> Self {
        Self { data, good_bytes }
    }
}

#[async_trait]
impl ObjectClient for BrokenStreamClient {
    async fn get_object(&self, _bucket: &str, _key: &str) -> Result<SourceStream, DownloadError> {
        Ok(Box::pin(BrokenReader {
            data: self.data.clone(),
            limit: self.good_bytes.min(self.data.len()),
            pos: 0,
        }))
    }
}

struct BrokenReader {
    data: Vec<u8>,
    limit: usize,
    pos: usize,
}

impl AsyncRead for BrokenReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos >= self.limit {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "source stream broke mid-read",
            )));
        }
        let start = self.pos;
        let end = self.limit.min(start + buf.remaining());
        buf.put_slice(&self.data[start..end]);
        self.pos = end;
        Poll::Ready(Ok(()))
    }
}

/// Factory handing out a fixed client.
pub struct MockFactory {
    client: Arc<dyn ObjectClient>,
}

impl MockFactory {
    pub fn new(client: impl ObjectClient + 'static) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

#[async_trait]
impl S3ClientFactory for MockFactory {
    async fn create(
        &self,
        _endpoint: &Url,
        _access_key: &str,
        _secret_key: &str,
        _cert_dir: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        Ok(Arc::clone(&self.client))
    }
}

#[async_trait]
impl GcsClientFactory for MockFactory {
    async fn create(
        &self,
        _endpoint: &Url,
        _service_account_key: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        Ok(Arc::clone(&self.client))
    }
}

/// Factory that cannot construct a client at all.
pub struct FailFactory;

#[async_trait]
impl S3ClientFactory for FailFactory {
    async fn create(
        &self,
        _endpoint: &Url,
        _access_key: &str,
        _secret_key: &str,
        _cert_dir: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        anyhow::bail!("failed to create client")
    }
}

#[async_trait]
impl GcsClientFactory for FailFactory {
    async fn create(
        &self,
        _endpoint: &Url,
        _service_account_key: Option<&Utf8Path>,
    ) -> anyhow::Result<Arc<dyn ObjectClient>> {
        anyhow::bail!("failed to create client")
    }
}
