//! Media violation detection with album-aware batching.
//!
//! Media items are downloaded into scratch space, videos are sampled frame by
//! frame, each still is scored against the chat's policy, and items that
//! belong to one album are collapsed into a single verdict before being
//! handed to the action executor.

pub mod analysis;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod ffmpeg;
pub mod logging;
pub mod models;
pub mod policy;
pub mod routes;
pub mod sampler;
pub mod scoring;
pub mod scratch;
pub mod storage;

pub use analysis::{ItemAnalyzer, MediaAnalyzer};
pub use config::{EngineConfig, MediaLimits};
pub use coordinator::{AlbumCoordinator, AlbumKey, IgnoreReason, Submission};
pub use dispatch::VerdictSink;
pub use error::{EngineError, Result};
pub use models::{
    Assessment, CategoryScoreSet, GroupVerdict, GuildMediaPolicy, ItemVerdict, MediaItem,
    MediaKind, Sender, Uncertainty,
};
pub use policy::PolicyStore;
