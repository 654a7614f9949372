//! Violation scoring: turn one still image into a pass/fail assessment.
//!
//! Classification failures fail open. A timed-out or erroring classifier
//! yields the `{safe: 1.0}` default and the image is treated as clean. This
//! is a product decision (false negatives over blocking chats on every
//! outage), so there is no retry here either.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use image::{DynamicImage, ImageReader};

use crate::classifier::Classifier;
use crate::error::Result;
use crate::models::{
    ABSOLUTE_PRIORITY_CATEGORY, ABSOLUTE_PRIORITY_THRESHOLD, Assessment, CategoryScoreSet,
    GuildMediaPolicy,
};

/// Longest side sent to the classifier
const MAX_IMAGE_SIDE: u32 = 1024;

pub struct ScoringEngine {
    classifier: Arc<dyn Classifier>,
    timeout: Duration,
}

impl ScoringEngine {
    pub fn new(classifier: Arc<dyn Classifier>, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    /// Classify the image at `path` and judge it against `policy`.
    ///
    /// Only a local read failure is returned as an error.
    pub async fn score_image(
        &self,
        path: &Path,
        caption: Option<&str>,
        policy: &GuildMediaPolicy,
    ) -> Result<Assessment> {
        let data = tokio::fs::read(path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(prepare_image(&data));
        drop(data);

        match self.classify_or_default(&encoded, caption).await {
            Ok(scores) => Ok(evaluate(&scores, policy)),
            Err(reason) => Ok(fail_open(policy, &reason)),
        }
    }

    /// Run the classifier under the deadline. `Err` carries the reason the
    /// fail-open default was substituted.
    pub(crate) async fn classify_or_default(
        &self,
        image_base64: &str,
        caption: Option<&str>,
    ) -> std::result::Result<CategoryScoreSet, String> {
        match tokio::time::timeout(self.timeout, self.classifier.classify(image_base64, caption)).await
        {
            Ok(Ok(scores)) => Ok(scores),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "classifier failed, failing open");
                Err(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "classifier timed out, failing open");
                Err(format!("timed out after {}ms", self.timeout.as_millis()))
            }
        }
    }
}

/// Reduce a score set to a verdict.
///
/// Order matters: the absolute-priority category is checked first and
/// ignores the policy entirely, then blocked categories in policy order.
/// Each category is compared on its own; scores are never combined.
pub fn evaluate(scores: &CategoryScoreSet, policy: &GuildMediaPolicy) -> Assessment {
    let priority_score = scores.score(ABSOLUTE_PRIORITY_CATEGORY);
    if priority_score >= ABSOLUTE_PRIORITY_THRESHOLD {
        return Assessment {
            is_violation: true,
            category: Some(ABSOLUTE_PRIORITY_CATEGORY.to_string()),
            confidence_score: priority_score,
            reason_text: format!(
                "{} scored {:.2} (absolute priority, threshold {:.2})",
                ABSOLUTE_PRIORITY_CATEGORY, priority_score, ABSOLUTE_PRIORITY_THRESHOLD
            ),
            uncertainty: scores.uncertainty,
        };
    }

    let threshold = policy.confidence_threshold;
    let mut highest = 0.0_f64;
    for category in &policy.blocked_categories {
        let score = scores.score(category);
        if score >= threshold {
            return Assessment {
                is_violation: true,
                category: Some(category.clone()),
                confidence_score: score,
                reason_text: format!("{} scored {:.2} (threshold {:.2})", category, score, threshold),
                uncertainty: scores.uncertainty,
            };
        }
        highest = highest.max(score);
    }

    let primary = if scores.primary_category.is_empty() {
        "unknown"
    } else {
        scores.primary_category.as_str()
    };
    Assessment {
        is_violation: false,
        category: None,
        confidence_score: highest,
        reason_text: format!("no blocked category reached {:.2} (primary: {})", threshold, primary),
        uncertainty: scores.uncertainty,
    }
}

/// Judge the `{safe: 1.0}` default set in place of a missing classifier
/// answer. A policy that blocks the safe category itself still gets a clean
/// result; an outage never produces a violation.
fn fail_open(policy: &GuildMediaPolicy, reason: &str) -> Assessment {
    let defaults = CategoryScoreSet::safe_default();
    let mut assessment = evaluate(&defaults, policy);
    if assessment.is_violation {
        assessment = Assessment::clean(String::new());
        assessment.uncertainty = defaults.uncertainty;
    }
    assessment.reason_text = format!("classification unavailable, treated as safe: {}", reason);
    assessment
}

/// Downscale large decodable images to JPEG; anything else passes through.
fn prepare_image(data: &[u8]) -> Vec<u8> {
    let decoded = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.decode().ok());

    let Some(img) = decoded else {
        return data.to_vec();
    };
    if img.width() <= MAX_IMAGE_SIDE && img.height() <= MAX_IMAGE_SIDE {
        return data.to_vec();
    }

    let resized = img.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, image::imageops::FilterType::Triangle);
    drop(img);

    let mut output = Cursor::new(Vec::new());
    match DynamicImage::ImageRgb8(resized.to_rgb8()).write_to(&mut output, image::ImageFormat::Jpeg) {
        Ok(()) => output.into_inner(),
        Err(e) => {
            tracing::debug!(error = %e, "re-encode failed, sending original bytes");
            data.to_vec()
        }
    }
}
