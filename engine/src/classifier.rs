//! Classification service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::models::CategoryScoreSet;

/// Black-box vision/text classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image_base64: &str, caption: Option<&str>) -> Result<CategoryScoreSet>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image: &'a str,
    caption: Option<&'a str>,
}

/// JSON-over-HTTP classifier.
///
/// The deadline is enforced by the scoring engine; the client timeout here
/// only bounds connections that would otherwise hang forever.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    url: String,
    http: Client,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::ClassificationUnavailable(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http,
            api_key,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image_base64: &str, caption: Option<&str>) -> Result<CategoryScoreSet> {
        let mut request = self.http.post(&self.url).json(&ClassifyRequest {
            image: image_base64,
            caption,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::ClassificationUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ClassificationUnavailable(format!(
                "unexpected status {}: {}",
                status, body
            )));
        }

        response
            .json::<CategoryScoreSet>()
            .await
            .map_err(|e| EngineError::ClassificationUnavailable(format!("bad response: {}", e)))
    }
}
