//! Per-chat media policy lookup.
//!
//! Policies are read once when an album opens; the coordinator keeps the
//! snapshot for the album's lifetime.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;

use crate::models::GuildMediaPolicy;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// `Ok(None)` means the chat never configured media moderation.
    async fn get_guild_media_policy(&self, chat_id: i64) -> anyhow::Result<Option<GuildMediaPolicy>>;
}

/// In-memory policies, optionally with a fallback for unknown chats.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticPolicyStore {
    #[serde(default)]
    default: Option<GuildMediaPolicy>,
    #[serde(default)]
    chats: HashMap<i64, GuildMediaPolicy>,
}

impl StaticPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(policy: GuildMediaPolicy) -> Self {
        Self {
            default: Some(policy),
            chats: HashMap::new(),
        }
    }

    pub fn insert(&mut self, chat_id: i64, policy: GuildMediaPolicy) {
        self.chats.insert(chat_id, policy);
    }

    /// Load `{"default": {...}, "chats": {"<chat_id>": {...}}}`.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn get_guild_media_policy(&self, chat_id: i64) -> anyhow::Result<Option<GuildMediaPolicy>> {
        Ok(self
            .chats
            .get(&chat_id)
            .or(self.default.as_ref())
            .cloned()
            .map(GuildMediaPolicy::normalized))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PolicyRow {
    enabled: bool,
    blocked_categories: Vec<String>,
    confidence_threshold: f64,
    check_photos: bool,
    check_videos: bool,
    check_gifs: bool,
    check_stickers: bool,
    tier_bypass_level: Option<i16>,
}

impl From<PolicyRow> for GuildMediaPolicy {
    fn from(row: PolicyRow) -> Self {
        GuildMediaPolicy {
            enabled: row.enabled,
            blocked_categories: row.blocked_categories,
            confidence_threshold: row.confidence_threshold,
            check_photos: row.check_photos,
            check_videos: row.check_videos,
            check_gifs: row.check_gifs,
            check_stickers: row.check_stickers,
            tier_bypass_level: row
                .tier_bypass_level
                .map(|level| u8::try_from(level.max(0)).unwrap_or(u8::MAX)),
        }
        .normalized()
    }
}

/// Postgres-backed policies, owned by the settings service.
#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn get_guild_media_policy(&self, chat_id: i64) -> anyhow::Result<Option<GuildMediaPolicy>> {
        let row: Option<PolicyRow> = sqlx::query_as(
            r#"
            SELECT enabled, blocked_categories, confidence_threshold,
                   check_photos, check_videos, check_gifs, check_stickers,
                   tier_bypass_level
            FROM guild_media_policies
            WHERE chat_id = $1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(GuildMediaPolicy::from))
    }
}
