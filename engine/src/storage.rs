//! Media sources: where the bytes behind a `remote_ref` come from.
//!
//! The chat platform client lives outside this crate; these adapters cover
//! the two ways it exposes files to us (a shared local directory or an HTTP
//! file endpoint).

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{EngineError, Result};

const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn download_media(&self, remote_ref: &str) -> Result<Vec<u8>>;
}

/// Reads `<root>/<remote_ref>` from disk.
#[derive(Debug, Clone)]
pub struct LocalMediaSource {
    root: PathBuf,
}

impl LocalMediaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Only plain relative paths are accepted as refs.
fn is_safe_ref(remote_ref: &str) -> bool {
    !remote_ref.is_empty()
        && !remote_ref.contains('\0')
        && Path::new(remote_ref)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl MediaSource for LocalMediaSource {
    async fn download_media(&self, remote_ref: &str) -> Result<Vec<u8>> {
        if !is_safe_ref(remote_ref) {
            return Err(EngineError::download(remote_ref, "refusing unsafe path"));
        }

        let full_path = self.root.join(remote_ref);
        tokio::fs::read(&full_path)
            .await
            .map_err(|e| EngineError::download(remote_ref, e))
    }
}

/// Fetches `<base_url>/<remote_ref>` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMediaSource {
    base_url: String,
    http: Client,
    auth_token: Option<String>,
}

impl HttpMediaSource {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::download("<client>", e))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            auth_token,
        })
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn download_media(&self, remote_ref: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, remote_ref.trim_start_matches('/'));
        let mut request = self.http.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::download(remote_ref, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::download(remote_ref, format!("status {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::download(remote_ref, e))?;
        Ok(bytes.to_vec())
    }
}
