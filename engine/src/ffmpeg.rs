//! Still-frame extraction and duration probing via ffmpeg/ffprobe.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{EngineError, Result};

/// Width frames are scaled to before classification; height keeps aspect.
const FRAME_WIDTH: u32 = 640;
const FRAME_QUALITY: u8 = 4;

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Write a single still of `video` at `timestamp_secs` to `output`.
    async fn extract_frame(&self, video: &Path, timestamp_secs: f64, output: &Path) -> Result<()>;

    /// Container duration in seconds, for items that did not declare one.
    async fn probe_duration(&self, video: &Path) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    threads: usize,
}

impl FfmpegExtractor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| EngineError::extraction(path, "path is not valid UTF-8"))
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract_frame(&self, video: &Path, timestamp_secs: f64, output: &Path) -> Result<()> {
        let threads = self.threads.to_string();
        let seek = format!("{:.3}", timestamp_secs.max(0.0));

        // -ss before -i seeks on keyframes, which is plenty for sampling
        let result = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-threads", &threads])
            .args(["-ss", &seek])
            .args(["-i", path_arg(video)?])
            .args(["-an", "-sn"])
            .args(["-frames:v", "1"])
            .args(["-vf", &format!("scale='min({},iw)':-2", FRAME_WIDTH)])
            .args(["-q:v", &FRAME_QUALITY.to_string()])
            .args(["-y", path_arg(output)?])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::extraction(video, format!("failed to spawn ffmpeg: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(EngineError::extraction(
                video,
                format!("ffmpeg failed at {}s: {}", seek, stderr.trim()),
            ));
        }

        // ffmpeg exits 0 without writing anything when seeking past the end
        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(EngineError::extraction(
                video,
                format!("no frame produced at {}s", seek),
            )),
        }
    }

    async fn probe_duration(&self, video: &Path) -> Result<f64> {
        let probe = Command::new("ffprobe")
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path_arg(video)?)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::extraction(video, format!("failed to spawn ffprobe: {}", e)))?;

        parse_duration(&String::from_utf8_lossy(&probe.stdout))
            .ok_or_else(|| EngineError::extraction(video, "ffprobe reported no duration"))
    }
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("0.000000"), None);
        assert_eq!(parse_duration(""), None);
    }
}
