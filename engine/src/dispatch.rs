//! Hand-off of finalized verdicts to the action executor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::models::GroupVerdict;

/// Receives exactly one verdict per finalized album or lone item.
///
/// Implementations own their error handling; the coordinator never retries.
#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn on_group_verdict(&self, verdict: GroupVerdict);
}

fn log_clean(verdict: &GroupVerdict) {
    tracing::debug!(
        chat_id = verdict.chat_id,
        album = verdict.group_key.as_deref().unwrap_or("-"),
        items = verdict.all_items.len(),
        "group clean, no action"
    );
}

/// Logs verdicts only. Used when no executor is configured.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl VerdictSink for LogSink {
    async fn on_group_verdict(&self, verdict: GroupVerdict) {
        if !verdict.has_violations() {
            log_clean(&verdict);
            return;
        }
        for item in &verdict.violating_items {
            tracing::info!(
                chat_id = verdict.chat_id,
                user_id = verdict.sender.user_id,
                message_id = item.item.message_id,
                category = item.category.as_deref().unwrap_or_default(),
                reason = %item.reason_text,
                "violation (log only)"
            );
        }
    }
}

/// POSTs violating groups as JSON to the action executor.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    http: Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl VerdictSink for WebhookSink {
    async fn on_group_verdict(&self, verdict: GroupVerdict) {
        if !verdict.has_violations() {
            log_clean(&verdict);
            return;
        }

        let result = self
            .http
            .post(&self.url)
            .json(&verdict)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => tracing::info!(
                chat_id = verdict.chat_id,
                album = verdict.group_key.as_deref().unwrap_or("-"),
                violations = verdict.violating_items.len(),
                "verdict delivered to action executor"
            ),
            Err(e) => tracing::error!(
                chat_id = verdict.chat_id,
                album = verdict.group_key.as_deref().unwrap_or("-"),
                messages = ?verdict.message_ids(),
                error = %e,
                "failed to deliver verdict"
            ),
        }
    }
}

/// Forwards every verdict, clean or not, into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GroupVerdict>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GroupVerdict>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl VerdictSink for ChannelSink {
    async fn on_group_verdict(&self, verdict: GroupVerdict) {
        if self.tx.send(verdict).is_err() {
            tracing::warn!("verdict receiver dropped");
        }
    }
}
