//! Per-item analysis: fetch, sample or score, always clean up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MediaLimits;
use crate::error::{EngineError, Result};
use crate::models::{Assessment, GuildMediaPolicy, MediaItem};
use crate::sampler::VideoSampler;
use crate::scoring::ScoringEngine;
use crate::scratch::ScratchSpace;
use crate::storage::MediaSource;

/// What the album coordinator delegates each item to.
#[async_trait]
pub trait ItemAnalyzer: Send + Sync + 'static {
    async fn analyze(&self, item: &MediaItem, policy: &GuildMediaPolicy) -> Result<Assessment>;
}

pub struct MediaAnalyzer {
    source: Arc<dyn MediaSource>,
    sampler: VideoSampler,
    scoring: ScoringEngine,
    limits: MediaLimits,
    scratch_dir: PathBuf,
}

impl MediaAnalyzer {
    pub fn new(
        source: Arc<dyn MediaSource>,
        sampler: VideoSampler,
        scoring: ScoringEngine,
        limits: MediaLimits,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            sampler,
            scoring,
            limits,
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn inspect(
        &self,
        scratch: &ScratchSpace,
        item: &MediaItem,
        policy: &GuildMediaPolicy,
    ) -> Result<Assessment> {
        let local = scratch
            .fetch_to_scratch(self.source.as_ref(), item, &self.limits)
            .await?;
        let caption = item.caption.as_deref();

        if !item.is_temporal() {
            return self.scoring.score_image(&local, caption, policy).await;
        }

        let duration = match item.duration_seconds {
            Some(d) => d,
            None => self.probe(&local).await?,
        };
        self.sampler
            .evaluate(scratch, &local, duration, &self.scoring, caption, policy)
            .await
    }

    /// Duration for videos that arrived without one. Still subject to the
    /// duration ceiling.
    async fn probe(&self, video: &Path) -> Result<f64> {
        let duration = self.sampler.extractor().probe_duration(video).await?;
        if duration > self.limits.max_duration_secs {
            return Err(EngineError::TooLong {
                duration_secs: duration,
                limit_secs: self.limits.max_duration_secs,
            });
        }
        Ok(duration)
    }
}

#[async_trait]
impl ItemAnalyzer for MediaAnalyzer {
    async fn analyze(&self, item: &MediaItem, policy: &GuildMediaPolicy) -> Result<Assessment> {
        if !policy.checks(item) {
            return Ok(Assessment::clean(format!(
                "{} checks are disabled for this chat",
                item.kind
            )));
        }

        let scratch = ScratchSpace::new(&self.scratch_dir);
        let result = self.inspect(&scratch, item, policy).await;
        scratch.release_all().await;
        result
    }
}
