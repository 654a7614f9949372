//! Scratch-file lifecycle for media under analysis.
//!
//! A [`ScratchSpace`] tracks every path it hands out. Paths are removed by
//! [`ScratchSpace::release`] / [`ScratchSpace::release_all`], and anything
//! still tracked when the space is dropped (early return, `?`, panic) is
//! removed synchronously in `Drop`. Each path is removed at most once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::MediaLimits;
use crate::error::{EngineError, Result};
use crate::ffmpeg::FrameExtractor;
use crate::models::MediaItem;
use crate::storage::MediaSource;

impl MediaLimits {
    /// Reject items by their declared metadata, before any download.
    pub fn admit(&self, item: &MediaItem) -> Result<()> {
        if item.size_bytes > self.max_size_bytes {
            return Err(EngineError::TooLarge {
                size_bytes: item.size_bytes,
                limit_bytes: self.max_size_bytes,
            });
        }
        if let Some(duration_secs) = item.duration_seconds {
            if duration_secs > self.max_duration_secs {
                return Err(EngineError::TooLong {
                    duration_secs,
                    limit_secs: self.max_duration_secs,
                });
            }
        }
        Ok(())
    }
}

pub struct ScratchSpace {
    dir: PathBuf,
    tracked: Mutex<Vec<PathBuf>>,
}

impl ScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tracked: Mutex::new(Vec::new()),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a collision-free path and start tracking it.
    pub fn allocate(&self, extension: &str) -> PathBuf {
        let path = self
            .dir
            .join(format!("mg_{:016x}.{}", rand::random::<u64>(), extension));
        self.tracked().push(path.clone());
        path
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.tracked().clone()
    }

    /// Download an item's bytes into scratch space.
    ///
    /// The admission guard runs first so oversized or overlong media never
    /// costs a transfer. The downloaded length is checked again since the
    /// declared size can lie.
    pub async fn fetch_to_scratch(
        &self,
        source: &dyn MediaSource,
        item: &MediaItem,
        limits: &MediaLimits,
    ) -> Result<PathBuf> {
        limits.admit(item)?;

        let data = source.download_media(&item.remote_ref).await?;
        if data.len() as u64 > limits.max_size_bytes {
            return Err(EngineError::TooLarge {
                size_bytes: data.len() as u64,
                limit_bytes: limits.max_size_bytes,
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.allocate(item.kind.scratch_extension());
        tokio::fs::write(&path, &data).await?;
        // data dropped here, only the scratch copy remains

        Ok(path)
    }

    /// Produce a still image of `video` at `timestamp_secs`.
    pub async fn extract_frame(
        &self,
        extractor: &dyn FrameExtractor,
        video: &Path,
        timestamp_secs: f64,
    ) -> Result<PathBuf> {
        let path = self.allocate("jpg");
        match extractor.extract_frame(video, timestamp_secs, &path).await {
            Ok(()) => Ok(path),
            Err(e) => {
                self.release(&path).await;
                Err(e)
            }
        }
    }

    /// Remove one path now. No-op if it was already released.
    pub async fn release(&self, path: &Path) {
        let was_tracked = {
            let mut tracked = self.tracked();
            let before = tracked.len();
            tracked.retain(|p| p != path);
            tracked.len() != before
        };
        if was_tracked {
            remove_quietly(path).await;
        }
    }

    pub async fn release_all(&self) {
        let paths = std::mem::take(&mut *self.tracked());
        for path in paths {
            remove_quietly(&path).await;
        }
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut *self.tracked());
        if paths.is_empty() {
            return;
        }
        tracing::debug!(count = paths.len(), "releasing scratch files on drop");
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file");
                }
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        // Frames whose extraction failed early never hit the disk
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file");
        }
    }
}
