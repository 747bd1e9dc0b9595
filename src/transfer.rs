//! The phase-driven transfer core shared by every backend variant.

use std::io::Cursor;

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use url::Url;

use crate::format::{detect_image_format, SNIFF_BYTES};
use crate::metrics::SOURCE_METRICS;
use crate::{ObjectClient, ProcessingPhase, SourceStream, SCRATCH_FILE_NAME};

/// Backend-independent state of a data source: resolved coordinates, the
/// exclusively-owned reader and the current phase.
///
/// The reader is opened lazily by [`TransferState::info`] and consumed by the
/// transfer paths; any failure degrades the state machine to the terminal
/// [`ProcessingPhase::Error`] and releases the reader.
pub(crate) struct TransferState {
    url: Url,
    bucket: String,
    object: String,
    reader: Option<SourceStream>,
    phase: Option<ProcessingPhase>,
}

impl TransferState {
    pub(crate) fn new(url: Url, bucket: String, object: String) -> Self {
        Self {
            url,
            bucket,
            object,
            reader: None,
            phase: None,
        }
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn phase(&self) -> Option<ProcessingPhase> {
        self.phase
    }

    /// Safe to call repeatedly and before any stream was opened.
    pub(crate) fn close(&mut self) {
        self.reader = None;
    }

    /// Records a failure: the phase becomes `Error` and the reader is
    /// released.
    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.phase = Some(ProcessingPhase::Error);
        self.reader = None;
        err
    }

    fn check_not_failed(&self) -> anyhow::Result<()> {
        if self.phase == Some(ProcessingPhase::Error) {
            return Err(anyhow!(
                "data source {} already failed, refusing further operations",
                self.url
            ));
        }
        Ok(())
    }

    /// Opens the object if needed, sniffs its leading bytes and selects the
    /// transfer path. The sniffed prefix is chained back in front of the
    /// remaining stream, so the transfer paths see the whole object.
    pub(crate) async fn info(
        &mut self,
        client: &dyn ObjectClient,
    ) -> anyhow::Result<ProcessingPhase> {
        self.check_not_failed()?;

        if self.reader.is_none() {
            match client.get_object(&self.bucket, &self.object).await {
                Ok(stream) => self.reader = Some(stream),
                Err(e) => {
                    // Reader stays unset: there is nothing to close.
                    self.phase = Some(ProcessingPhase::Error);
                    return Err(anyhow::Error::new(e)
                        .context(format!("opening source object {}", self.url)));
                }
            }
        }

        let mut reader = self.reader.take().expect("reader was just opened");
        let mut prefix = vec![0u8; SNIFF_BYTES];
        let mut filled = 0;
        loop {
            match reader.read(&mut prefix[filled..]).await {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == prefix.len() {
                        break;
                    }
                }
                Err(e) => {
                    return Err(self.fail(
                        anyhow::Error::new(e)
                            .context(format!("reading source object {}", self.url)),
                    ));
                }
            }
        }
        prefix.truncate(filled);

        if prefix.is_empty() {
            return Err(self.fail(anyhow!("source object {} is empty, not a disk image", self.url)));
        }

        let format = detect_image_format(&prefix);
        let phase = if format.needs_scratch() {
            ProcessingPhase::TransferScratch
        } else {
            ProcessingPhase::TransferDataFile
        };
        info!(
            "source {} classified as {}, next phase {:?}",
            self.url,
            format.as_str(),
            phase
        );

        self.reader = Some(Box::pin(Cursor::new(prefix).chain(reader)));
        self.phase = Some(phase);
        Ok(phase)
    }

    /// Streams the object into the fixed-name staging file inside
    /// `scratch_dir`. One transfer per scratch directory at a time. On
    /// failure a partially written file may remain; cleaning it up is the
    /// orchestrator's call.
    pub(crate) async fn transfer(
        &mut self,
        scratch_dir: &Utf8Path,
    ) -> anyhow::Result<ProcessingPhase> {
        self.check_not_failed()?;
        if self.phase != Some(ProcessingPhase::TransferScratch) {
            return Err(self.fail(anyhow!(
                "transfer() called in phase {:?}, expected TransferScratch",
                self.phase
            )));
        }

        let file_path = scratch_dir.join(SCRATCH_FILE_NAME);
        if let Err(e) = self.stream_to_file(&file_path, "scratch").await {
            let e = e.context(format!("transferring {} to scratch {scratch_dir}", self.url));
            return Err(self.fail(e));
        }

        // Downstream conversion picks the staged file up through the URL
        // accessor.
        let staged = file_path
            .canonicalize_utf8()
            .with_context(|| format!("resolving staged file {file_path}"))
            .and_then(|abs| {
                Url::from_file_path(abs.as_std_path())
                    .map_err(|()| anyhow!("staged file path {abs} does not form a file URL"))
            });
        match staged {
            Ok(staged_url) => {
                self.url = staged_url;
                self.phase = Some(ProcessingPhase::Convert);
                Ok(ProcessingPhase::Convert)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Streams the object directly to `dest`, skipping the scratch
    /// intermediate.
    pub(crate) async fn transfer_file(
        &mut self,
        dest: &Utf8Path,
    ) -> anyhow::Result<ProcessingPhase> {
        self.check_not_failed()?;
        if self.phase != Some(ProcessingPhase::TransferDataFile) {
            return Err(self.fail(anyhow!(
                "transfer_file() called in phase {:?}, expected TransferDataFile",
                self.phase
            )));
        }

        match self.stream_to_file(dest, "file").await {
            Ok(_) => {
                self.phase = Some(ProcessingPhase::Resize);
                Ok(ProcessingPhase::Resize)
            }
            Err(e) => {
                let e = e.context(format!("transferring {} to {dest}", self.url));
                Err(self.fail(e))
            }
        }
    }

    async fn stream_to_file(&mut self, path: &Utf8Path, target: &str) -> anyhow::Result<u64> {
        let mut reader = self
            .reader
            .take()
            .context("no open source stream, info() must run first")?;
        let mut file = File::create(path)
            .await
            .with_context(|| format!("creating {path}"))?;
        let bytes = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("streaming {} to {path}", self.url))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {path}"))?;

        SOURCE_METRICS
            .transferred_bytes
            .with_label_values(&[target])
            .inc_by(bytes);
        info!("transferred {bytes} bytes from {} to {path}", self.url);
        Ok(bytes)
    }
}
