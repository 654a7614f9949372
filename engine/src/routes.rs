//! HTTP ingress: the chat bot forwards media events here.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::coordinator::AlbumCoordinator;
use crate::models::{MediaItem, MediaKind, Sender};

/// Extension trait for logging errors and converting to StatusCode
pub trait LogErr<T> {
    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode> {
        self.map_err(|e| {
            tracing::warn!(status = status.as_u16(), error = %e, "{}", context);
            status
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: AlbumCoordinator,
}

#[derive(Debug, Deserialize)]
pub struct MediaEvent {
    pub kind: MediaKind,
    pub remote_ref: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub group_key: Option<String>,
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub tier_level: Option<u8>,
    /// Defaults to receipt time
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl MediaEvent {
    pub fn into_item(self) -> Result<MediaItem, String> {
        if self.remote_ref.trim().is_empty() {
            return Err("remote_ref is empty".to_string());
        }
        if let Some(d) = self.duration_seconds {
            if !d.is_finite() || d < 0.0 {
                return Err(format!("invalid duration {}", d));
            }
        }

        Ok(MediaItem {
            kind: self.kind,
            remote_ref: self.remote_ref,
            size_bytes: self.size_bytes,
            duration_seconds: self.duration_seconds,
            caption: self.caption.filter(|c| !c.trim().is_empty()),
            group_key: self.group_key.filter(|g| !g.is_empty()),
            chat_id: self.chat_id,
            message_id: self.message_id,
            sender: Sender {
                user_id: self.user_id,
                tier_level: self.tier_level,
            },
            submitted_at: self.sent_at.unwrap_or_else(Utc::now),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", post(ingest))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ingest(
    State(state): State<AppState>,
    Json(event): Json<MediaEvent>,
) -> Result<StatusCode, StatusCode> {
    let item = event
        .into_item()
        .log_status("rejected media event", StatusCode::UNPROCESSABLE_ENTITY)?;

    tracing::debug!(
        chat_id = item.chat_id,
        message_id = item.message_id,
        kind = %item.kind,
        album = item.group_key.as_deref().unwrap_or("-"),
        "media event accepted"
    );

    state.coordinator.spawn_submit(item);

    Ok(StatusCode::ACCEPTED)
}
