//! Shared data models used across the engine

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category that is always blocked, independent of chat policy.
pub const ABSOLUTE_PRIORITY_CATEGORY: &str = "child_safety";

/// Activation threshold for [`ABSOLUTE_PRIORITY_CATEGORY`]. Deliberately below
/// the default configurable threshold and not overridable per chat.
pub const ABSOLUTE_PRIORITY_THRESHOLD: f64 = 0.5;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Category reported by the fail-open default score set.
pub const SAFE_CATEGORY: &str = "safe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
    Sticker,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
            MediaKind::Document => "document",
        }
    }

    /// File extension used for the downloaded scratch copy.
    pub fn scratch_extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video | MediaKind::Animation => "mp4",
            MediaKind::Sticker => "webp",
            MediaKind::Document => "bin",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who posted the media. Enough identity for the action executor to ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: i64,
    /// Reputation tier of the user in this chat, if known.
    #[serde(default)]
    pub tier_level: Option<u8>,
}

/// One submitted media object. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// Opaque handle the media source resolves to bytes
    pub remote_ref: String,
    pub size_bytes: u64,
    /// Declared duration (video, animation, animated sticker)
    pub duration_seconds: Option<f64>,
    pub caption: Option<String>,
    /// Platform album id; items sharing it are judged together
    pub group_key: Option<String>,
    pub chat_id: i64,
    pub message_id: i64,
    pub sender: Sender,
    pub submitted_at: DateTime<Utc>,
}

impl MediaItem {
    /// True when this item should go through temporal sampling rather than
    /// being judged as a single still.
    pub fn is_temporal(&self) -> bool {
        match self.kind {
            MediaKind::Video | MediaKind::Animation => true,
            MediaKind::Sticker | MediaKind::Document => self.duration_seconds.is_some(),
            MediaKind::Photo => false,
        }
    }
}

/// Per-chat media moderation policy. Snapshotted once per album.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildMediaPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Evaluated in order; the first category over threshold wins.
    #[serde(default)]
    pub blocked_categories: Vec<String>,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_true")]
    pub check_photos: bool,
    #[serde(default = "default_true")]
    pub check_videos: bool,
    #[serde(default = "default_true")]
    pub check_gifs: bool,
    #[serde(default = "default_true")]
    pub check_stickers: bool,
    /// Users at or above this tier skip media checks entirely.
    #[serde(default)]
    pub tier_bypass_level: Option<u8>,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl Default for GuildMediaPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_categories: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            check_photos: true,
            check_videos: true,
            check_gifs: true,
            check_stickers: true,
            tier_bypass_level: None,
        }
    }
}

impl GuildMediaPolicy {
    /// Clamp the threshold into [0, 1] (NaN falls back to the default) and
    /// drop duplicate categories, keeping first occurrence order.
    pub fn normalized(mut self) -> Self {
        self.confidence_threshold = if self.confidence_threshold.is_nan() {
            DEFAULT_CONFIDENCE_THRESHOLD
        } else {
            self.confidence_threshold.clamp(0.0, 1.0)
        };

        let mut seen = Vec::with_capacity(self.blocked_categories.len());
        self.blocked_categories.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(c.clone());
                true
            }
        });
        self
    }

    /// Whether the policy asks for this item's media kind to be checked.
    pub fn checks(&self, item: &MediaItem) -> bool {
        match item.kind {
            MediaKind::Photo => self.check_photos,
            MediaKind::Video => self.check_videos,
            MediaKind::Animation => self.check_gifs,
            MediaKind::Sticker => self.check_stickers,
            MediaKind::Document if item.is_temporal() => self.check_videos,
            MediaKind::Document => self.check_photos,
        }
    }

    pub fn bypasses(&self, sender: &Sender) -> bool {
        match (self.tier_bypass_level, sender.tier_level) {
            (Some(bypass), Some(tier)) => tier >= bypass,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uncertainty {
    #[default]
    Low,
    Medium,
    High,
}

/// Raw classifier output. Scores are relative-strength signals, never
/// combined across categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScoreSet {
    pub scores: HashMap<String, f64>,
    #[serde(default)]
    pub primary_category: String,
    #[serde(default)]
    pub uncertainty: Uncertainty,
}

impl CategoryScoreSet {
    /// Fail-open default used whenever the classifier cannot answer.
    pub fn safe_default() -> Self {
        Self {
            scores: HashMap::from([(SAFE_CATEGORY.to_string(), 1.0)]),
            primary_category: SAFE_CATEGORY.to_string(),
            uncertainty: Uncertainty::High,
        }
    }

    pub fn score(&self, category: &str) -> f64 {
        self.scores.get(category).copied().unwrap_or(0.0)
    }
}

/// Outcome of judging one still image or one whole item, before it is tied
/// back to its [`MediaItem`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub is_violation: bool,
    pub category: Option<String>,
    pub confidence_score: f64,
    pub reason_text: String,
    pub uncertainty: Uncertainty,
}

impl Assessment {
    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            is_violation: false,
            category: None,
            confidence_score: 0.0,
            reason_text: reason.into(),
            uncertainty: Uncertainty::Low,
        }
    }
}

/// Final judgement for one media item. Produced exactly once per item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemVerdict {
    pub item: MediaItem,
    pub is_violation: bool,
    pub category: Option<String>,
    pub confidence_score: f64,
    pub reason_text: String,
    pub uncertainty: Uncertainty,
}

impl ItemVerdict {
    pub fn new(item: MediaItem, assessment: Assessment) -> Self {
        Self {
            item,
            is_violation: assessment.is_violation,
            category: assessment.category,
            confidence_score: assessment.confidence_score,
            reason_text: assessment.reason_text,
            uncertainty: assessment.uncertainty,
        }
    }
}

/// Aggregated judgement for an album (or a lone item).
#[derive(Debug, Clone, Serialize)]
pub struct GroupVerdict {
    /// None for media submitted outside an album
    pub group_key: Option<String>,
    pub chat_id: i64,
    pub sender: Sender,
    pub violating_items: Vec<ItemVerdict>,
    pub all_items: Vec<ItemVerdict>,
}

impl GroupVerdict {
    /// Partition verdicts, keeping arrival order within both lists.
    pub fn from_items(group_key: Option<String>, all_items: Vec<ItemVerdict>) -> Option<Self> {
        let first = all_items.first()?;
        let chat_id = first.item.chat_id;
        let sender = first.item.sender.clone();
        let violating_items = all_items
            .iter()
            .filter(|v| v.is_violation)
            .cloned()
            .collect();

        Some(Self {
            group_key,
            chat_id,
            sender,
            violating_items,
            all_items,
        })
    }

    pub fn has_violations(&self) -> bool {
        !self.violating_items.is_empty()
    }

    pub fn message_ids(&self) -> Vec<i64> {
        self.all_items.iter().map(|v| v.item.message_id).collect()
    }
}
