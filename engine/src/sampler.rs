//! Temporal sampling of videos and animations.
//!
//! [`plan_samples`] decides which timestamps to look at. [`VideoSampler`]
//! extracts those frames concurrently, a bounded number ahead of the
//! evaluation cursor, and scores them strictly in timestamp order. The first
//! violating frame ends the walk; frames after it that have not started
//! extracting never will.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;

use crate::error::{EngineError, Result};
use crate::ffmpeg::FrameExtractor;
use crate::models::{Assessment, GuildMediaPolicy};
use crate::scoring::ScoringEngine;
use crate::scratch::ScratchSpace;

pub const MIN_FRAMES: usize = 10;
pub const MAX_FRAMES: usize = 50;

/// Frames per second by clip length; longer clips are sampled sparser.
fn sample_rate(duration_secs: f64) -> f64 {
    if duration_secs <= 5.0 {
        2.0
    } else if duration_secs <= 60.0 {
        0.5
    } else {
        0.2
    }
}

/// Number of frames to sample for a clip of `duration_secs`.
///
/// The rate-based target is clamped to [`MIN_FRAMES`, `MAX_FRAMES`], then
/// capped at one frame per whole second, never going below one.
pub fn frame_count(duration_secs: f64) -> usize {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0;
    }
    let target = (sample_rate(duration_secs) * duration_secs).ceil() as usize;
    let per_second_cap = duration_secs.floor() as usize;
    target
        .clamp(MIN_FRAMES, MAX_FRAMES)
        .min(per_second_cap)
        .max(1)
}

/// Timestamps spread evenly strictly inside `(0, duration_secs)`.
///
/// The first and last instants are skipped since encoders like to put black
/// or title frames there. Non-positive or non-finite durations plan nothing.
pub fn plan_samples(duration_secs: f64) -> Vec<f64> {
    let count = frame_count(duration_secs);
    let step = duration_secs / (count + 1) as f64;
    (1..=count).map(|i| step * i as f64).collect()
}

pub struct VideoSampler {
    extractor: Arc<dyn FrameExtractor>,
    prefetch: usize,
}

impl VideoSampler {
    pub fn new(extractor: Arc<dyn FrameExtractor>, prefetch: usize) -> Self {
        Self {
            extractor,
            prefetch: prefetch.max(1),
        }
    }

    pub fn extractor(&self) -> &dyn FrameExtractor {
        self.extractor.as_ref()
    }

    /// Judge a video by its sampled frames.
    ///
    /// Individual extraction failures are skipped. Only when no frame at all
    /// could be produced is `ExtractionFailed` returned.
    pub async fn evaluate(
        &self,
        scratch: &ScratchSpace,
        video: &Path,
        duration_secs: f64,
        scoring: &ScoringEngine,
        caption: Option<&str>,
        policy: &GuildMediaPolicy,
    ) -> Result<Assessment> {
        let timestamps = plan_samples(duration_secs);
        let planned = timestamps.len();
        if planned == 0 {
            return Err(EngineError::extraction(
                video,
                format!("no frames to sample for duration {:.2}s", duration_secs),
            ));
        }

        let extractor = self.extractor.as_ref();
        let mut frames = stream::iter(timestamps.into_iter().enumerate())
            .map(|(index, ts)| async move {
                (index, ts, scratch.extract_frame(extractor, video, ts).await)
            })
            .buffered(self.prefetch);

        let mut evaluated = 0usize;
        let mut failed = 0usize;
        let mut highest: Option<Assessment> = None;

        while let Some((index, ts, extracted)) = frames.next().await {
            let frame = match extracted {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(frame = index + 1, timestamp = ts, error = %e, "skipping frame");
                    failed += 1;
                    continue;
                }
            };

            let scored = scoring.score_image(&frame, caption, policy).await;
            scratch.release(&frame).await;
            let mut assessment = match scored {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(frame = index + 1, timestamp = ts, error = %e, "unreadable frame");
                    failed += 1;
                    continue;
                }
            };
            evaluated += 1;

            if assessment.is_violation {
                tracing::info!(
                    frame = index + 1,
                    planned,
                    timestamp = ts,
                    category = assessment.category.as_deref().unwrap_or_default(),
                    "violating frame, stopping sampling"
                );
                assessment.reason_text = format!(
                    "frame {}/{} at {:.2}s: {}",
                    index + 1,
                    planned,
                    ts,
                    assessment.reason_text
                );
                return Ok(assessment);
            }

            if highest
                .as_ref()
                .is_none_or(|h| assessment.confidence_score > h.confidence_score)
            {
                highest = Some(assessment);
            }
        }

        let Some(mut summary) = highest else {
            return Err(EngineError::extraction(
                video,
                format!("none of {} planned frames could be evaluated", planned),
            ));
        };
        summary.reason_text = format!(
            "{} of {} sampled frames clean ({} failed); highest: {}",
            evaluated, planned, failed, summary.reason_text
        );
        Ok(summary)
    }
}
