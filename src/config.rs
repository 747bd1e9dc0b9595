use std::fmt::Debug;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Declarative source selection, enough for creating a data source for that
/// storage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImportConfig {
    /// The storage connection configuration.
    #[serde(flatten)]
    pub source: SourceKind,
}

/// A kind of an object store to import from, with its connection
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceKind {
    /// S3-compatible storage, addressed by an endpoint URL whose path names
    /// the bucket and object.
    AwsS3(S3SourceConfig),
    /// Google Cloud Storage, addressed by a `gs://` or `http(s)` URL.
    Gcs(GcsSourceConfig),
}

/// S3 endpoint coordinates and access credentials.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct S3SourceConfig {
    /// `http(s)://host/bucket/object...`
    pub endpoint: String,
    /// Empty means the SDK's environment/IMDS credential chain.
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Directory with additional PEM trust roots for TLS against the
    /// endpoint.
    pub cert_dir: Option<Utf8PathBuf>,
}

impl Debug for S3SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3SourceConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("cert_dir", &self.cert_dir)
            .finish()
    }
}

/// GCS endpoint coordinates; a missing key means application default
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GcsSourceConfig {
    /// `gs://bucket/object...` or `http(s)://host/bucket/object...`
    pub endpoint: String,
    pub service_account_key: Option<Utf8PathBuf>,
}

impl ImportConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<ImportConfig> {
        Ok(toml_edit::de::from_str(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_s3_config() {
        let input = "\
endpoint = 'https://minio.local:9000/vm-images/disks/fedora.qcow2'
access_key_id = 'minio'
secret_access_key = 'letmein'
cert_dir = '/etc/import-certs'
";

        let config = ImportConfig::from_toml_str(input).unwrap();

        assert_eq!(
            config,
            ImportConfig {
                source: SourceKind::AwsS3(S3SourceConfig {
                    endpoint: "https://minio.local:9000/vm-images/disks/fedora.qcow2".into(),
                    access_key_id: "minio".into(),
                    secret_access_key: "letmein".into(),
                    cert_dir: Some(Utf8PathBuf::from("/etc/import-certs")),
                }),
            }
        );
    }

    #[test]
    fn parse_gcs_config() {
        let input = "endpoint = 'gs://vm-images/disks/fedora.img'";

        let config = ImportConfig::from_toml_str(input).unwrap();

        assert_eq!(
            config,
            ImportConfig {
                source: SourceKind::Gcs(GcsSourceConfig {
                    endpoint: "gs://vm-images/disks/fedora.img".into(),
                    service_account_key: None,
                }),
            }
        );
    }

    #[test]
    fn s3_debug_omits_secret() {
        let config = S3SourceConfig {
            endpoint: "https://minio.local/bucket/object".into(),
            access_key_id: "minio".into(),
            secret_access_key: "letmein".into(),
            cert_dir: None,
        };
        let debugged = format!("{config:?}");
        assert!(!debugged.contains("letmein"), "{debugged}");
    }
}
