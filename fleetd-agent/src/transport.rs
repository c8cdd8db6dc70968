//! File staging and log upload over HTTP.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid file id '{0}'")]
    InvalidFileId(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait FileTransport: Send + Sync {
    /// Uploads `path` as the multipart field `file`.
    async fn upload(&self, path: &Path) -> Result<(), TransportError>;

    /// Downloads every file id into `dest_dir`, returning the written paths.
    async fn download(&self, file_ids: &[String], dest_dir: &Path) -> Result<Vec<PathBuf>, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    upload_url: String,
    download_url: String,
}

impl HttpTransport {
    pub fn new(upload_url: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            upload_url: upload_url.into(),
            download_url: download_url.into(),
        }
    }

    async fn download_one(&self, file_id: &str, dest_dir: &Path) -> Result<PathBuf, TransportError> {
        let id: i64 = file_id
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidFileId(file_id.to_string()))?;

        let response = self
            .client
            .post(&self.download_url)
            .json(&json!({ "fileid": id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: self.download_url.clone(),
            });
        }

        let name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| format!("{id}_taskfile"));
        let bytes = response.bytes().await?;

        let path = dest_dir.join(name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| TransportError::Io {
                path: path.clone(),
                source,
            })?;
        info!("Downloaded file {} to {}", id, path.display());
        Ok(path)
    }
}

/// `filename` parameter of a Content-Disposition value, path components
/// stripped.
pub fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let base = value.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
        (!base.is_empty() && base != "." && base != "..").then(|| base.to_string())
    })
}

#[async_trait]
impl FileTransport for HttpTransport {
    async fn upload(&self, path: &Path) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| TransportError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "task.log".to_string());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: self.upload_url.clone(),
            });
        }
        info!("Uploaded {}", path.display());
        Ok(())
    }

    async fn download(&self, file_ids: &[String], dest_dir: &Path) -> Result<Vec<PathBuf>, TransportError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| TransportError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let mut written = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            match self.download_one(file_id, dest_dir).await {
                Ok(path) => written.push(path),
                Err(err) => warn!("Failed to download file {}: {}", file_id, err),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_comes_from_disposition() {
        assert_eq!(
            disposition_filename("attachment; filename=\"backup.sh\"").as_deref(),
            Some("backup.sh")
        );
        assert_eq!(
            disposition_filename("attachment; FILENAME=run.py").as_deref(),
            Some("run.py")
        );
        assert_eq!(
            disposition_filename("attachment; filename=\"../../etc/passwd\"").as_deref(),
            Some("passwd")
        );
        assert_eq!(disposition_filename("attachment"), None);
        assert_eq!(disposition_filename("attachment; filename=\"..\""), None);
    }

    #[tokio::test]
    async fn bad_file_id_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new("http://127.0.0.1:9/up", "http://127.0.0.1:9/down");
        let written = transport
            .download(&["not-a-number".to_string()], dir.path())
            .await
            .unwrap();
        assert!(written.is_empty());
    }
}
