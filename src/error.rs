#[derive(Debug)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(anyhow::Error),
    /// The object was not found in the remote storage.
    NotFound,
    /// The object was found in the remote storage, but the download failed.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => {
                write!(f, "Failed to download a remote object due to user input: {e}")
            }
            DownloadError::NotFound => write!(f, "No object found for the bucket and key given"),
            DownloadError::Other(e) => write!(f, "Failed to download a remote object: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}
