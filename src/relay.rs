//! Upload of finished artifacts to a remote print server.
//!
//! Relay problems never fail a pipeline run. They are logged and handed back
//! to the caller as [`RelayReport`]s, the equivalent of a flash message.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const UPLOAD_PATH: &str = "api/files/local";
const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Remote server '{url}' is unreachable: {message}")]
    Unreachable { url: String, message: String },
    #[error("Remote server '{url}' rejected the upload with code '{status}'")]
    Rejected { url: String, status: u16 },
    #[error("Cannot read artifact '{path}': {message}")]
    Artifact { path: String, message: String },
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Remote endpoint plus the credential passed through to it.
#[derive(Clone, Serialize)]
pub struct RelayTarget {
    pub url: String,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl fmt::Debug for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTarget")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RelayTarget {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// File upload endpoint below the target's base URL.
    pub fn upload_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if base.ends_with(UPLOAD_PATH) {
            base.to_string()
        } else {
            format!("{base}/{UPLOAD_PATH}")
        }
    }
}

/// Pipeline details sent alongside the artifact.
#[derive(Debug, Clone, Serialize)]
pub struct RelayMetadata {
    pub artifact_name: String,
    pub tweak_option: String,
}

/// Outcome of one relay attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub artifact_name: String,
    pub url: String,
    pub ok: bool,
    pub status: Option<u16>,
    pub message: String,
}

#[async_trait]
pub trait ArtifactRelay: Send + Sync + 'static {
    /// Upload `artifact`; returns the response status on 2xx.
    async fn upload(&self, target: &RelayTarget, artifact: &Path, metadata: &RelayMetadata) -> Result<u16, RelayError>;

    /// Lightweight reachability check, true on a 2xx answer.
    async fn check_connection(&self, url: &str) -> bool;
}

/// Upload through `relay` and fold the result into a report.
pub async fn deliver(
    relay: &dyn ArtifactRelay,
    target: &RelayTarget,
    artifact: &Path,
    metadata: &RelayMetadata,
) -> RelayReport {
    let url = target.upload_url();
    tracing::info!("Sending file '{}' to URL '{}'", artifact.display(), url);
    match relay.upload(target, artifact, metadata).await {
        Ok(status) => {
            let message = format!(
                "Sent {} back to server {} with code '{}'",
                metadata.artifact_name, target.url, status
            );
            tracing::info!("{}", message);
            RelayReport {
                artifact_name: metadata.artifact_name.clone(),
                url,
                ok: true,
                status: Some(status),
                message,
            }
        }
        Err(e) => {
            let status = match &e {
                RelayError::Rejected { status, .. } => Some(*status),
                _ => None,
            };
            let message = format!("Problem while sending {} back to server: {}", metadata.artifact_name, e);
            tracing::warn!("{}", message);
            RelayReport {
                artifact_name: metadata.artifact_name.clone(),
                url,
                ok: false,
                status,
                message,
            }
        }
    }
}

/// [`ArtifactRelay`] over HTTP multipart uploads.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
}

impl HttpRelay {
    /// `timeout` bounds connecting and the whole request, for uploads and probes alike.
    pub fn new(timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactRelay for HttpRelay {
    async fn upload(&self, target: &RelayTarget, artifact: &Path, metadata: &RelayMetadata) -> Result<u16, RelayError> {
        let url = target.upload_url();
        let bytes = tokio::fs::read(artifact).await.map_err(|e| RelayError::Artifact {
            path: artifact.display().to_string(),
            message: e.to_string(),
        })?;
        let part = Part::bytes(bytes)
            .file_name(metadata.artifact_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| RelayError::Client(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("tweak_option", metadata.tweak_option.clone());

        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = &target.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await.map_err(|e| RelayError::Unreachable {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(RelayError::Rejected {
                url,
                status: status.as_u16(),
            })
        }
    }

    async fn check_connection(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    tracing::warn!("Connection check to '{}' answered with {}", url, response.status());
                }
                ok
            }
            Err(e) => {
                tracing::warn!("Connection check to '{}' failed: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_url() {
        let target = RelayTarget::new("http://octopi.local/", None);
        assert_eq!(target.upload_url(), "http://octopi.local/api/files/local");
        let target = RelayTarget::new("http://octopi.local:5000/api/files/local", None);
        assert_eq!(target.upload_url(), "http://octopi.local:5000/api/files/local");
    }

    #[test]
    fn test_api_key_is_redacted() {
        let target = RelayTarget::new("http://octopi.local", Some("SECRET".to_string()));
        assert!(!format!("{target:?}").contains("SECRET"));
        assert!(!serde_json::to_string(&target).unwrap().contains("SECRET"));
        assert_eq!(RelayTarget::new("http://x", Some(String::new())).api_key, None);
    }
}
