//! Segment-file buffer.
//!
//! The encoder closes one `segment_<timestamp>.ts` file per interval, so file
//! name order is time order. The store only lists, sweeps and purges; it
//! never writes segments itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, instrument, trace, warn};

use replay_ipc::{BufferStatus, RecorderConfig};
use replay_pipeline::{MIN_SEGMENT_SECONDS, SEGMENT_PREFIX};

use crate::error::BufferError;
use crate::retention::RetentionPolicy;
use crate::{BufferResult, SEGMENT_EXTENSION};

/// One closed or in-progress segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,

    /// Last-modified time, used for age checks.
    pub created_at: SystemTime,

    pub size_bytes: u64,
}

impl SegmentFile {
    /// Age relative to `now`. Future timestamps count as zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }
}

/// Directory of encoder segments under a retention policy.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    policy: RetentionPolicy,
    segment_seconds: u32,
    extra_segments: u32,
}

impl SegmentStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        policy: RetentionPolicy,
        segment_seconds: u32,
        extra_segments: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            policy,
            segment_seconds: segment_seconds.max(MIN_SEGMENT_SECONDS),
            extra_segments,
        }
    }

    pub fn from_config(dir: impl Into<PathBuf>, config: &RecorderConfig) -> Self {
        Self::new(
            dir,
            RetentionPolicy::from_config(config),
            config.segment_seconds,
            config.extra_segments,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn segment_seconds(&self) -> u32 {
        self.segment_seconds
    }

    /// Create the directory and delete segments left by a previous session.
    #[instrument(name = "segments_prepare", skip(self), fields(dir = %self.dir.display()))]
    pub fn prepare(&self) -> BufferResult<usize> {
        fs::create_dir_all(&self.dir).map_err(|e| BufferError::io(&self.dir, e))?;
        let purged = self.purge()?;
        if purged > 0 {
            info!(purged, "Purged stale segments");
        }
        Ok(purged)
    }

    /// Delete every segment in the directory.
    pub fn purge(&self) -> BufferResult<usize> {
        let segments = self.list()?;
        Ok(segments.iter().filter(|s| remove_segment(&s.path)).count())
    }

    /// All segments, oldest first.
    pub fn list(&self) -> BufferResult<Vec<SegmentFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BufferError::io(&self.dir, e)),
        };

        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BufferError::io(&self.dir, e))?;
            let path = entry.path();
            if !is_segment(&path) {
                continue;
            }
            // A segment can vanish between listing and stat.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            segments.push(SegmentFile {
                path,
                created_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size_bytes: metadata.len(),
            });
        }

        segments.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(segments)
    }

    /// Delete segments older than the window plus margin.
    #[instrument(name = "segments_sweep", skip(self, now))]
    pub fn sweep(&self, now: SystemTime) -> BufferResult<usize> {
        let removed = self
            .list()?
            .iter()
            .filter(|s| self.policy.is_stale(s.age(now)))
            .filter(|s| remove_segment(&s.path))
            .count();
        if removed > 0 {
            debug!(removed, "Swept stale segments");
        }
        Ok(removed)
    }

    /// Number of trailing segments that cover the window plus extras.
    pub fn segments_needed(&self) -> usize {
        let window = self.policy.window.as_secs();
        let per_segment = u64::from(self.segment_seconds);
        (window.div_ceil(per_segment) + u64::from(self.extra_segments)) as usize
    }

    /// The newest segments covering the window, oldest first.
    pub fn select_trailing(&self) -> BufferResult<Vec<SegmentFile>> {
        let mut segments = self.list()?;
        let needed = self.segments_needed();
        if segments.len() > needed {
            segments.drain(..segments.len() - needed);
        }
        Ok(segments)
    }

    pub fn stats(&self) -> BufferResult<BufferStatus> {
        let segments = self.list()?;
        let bytes = segments.iter().map(|s| s.size_bytes).sum();
        let span_seconds = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => {
                last.created_at
                    .duration_since(first.created_at)
                    .unwrap_or_default()
                    .as_secs_f64()
                    + f64::from(self.segment_seconds)
            }
            _ => 0.0,
        };
        Ok(BufferStatus {
            entries: segments.len(),
            bytes,
            span_seconds,
        })
    }
}

fn is_segment(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SEGMENT_PREFIX));
    name_matches && path.extension().is_some_and(|e| e == SEGMENT_EXTENSION)
}

fn remove_segment(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            trace!(path = %path.display(), "Removed segment");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), "Failed to remove segment: {}", e);
            false
        }
    }
}

/// Background thread sweeping a [`SegmentStore`] on a fixed interval.
///
/// Stopping (or dropping) the sweeper cancels the timer and joins the thread.
pub struct Sweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(store: Arc<SegmentStore>, interval: Duration) -> BufferResult<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("segment-sweeper".to_string())
            .spawn(move || {
                debug!(?interval, "Segment sweeper started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = store.sweep(SystemTime::now()) {
                                warn!("Segment sweep failed: {}", e);
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Segment sweeper stopped");
            })
            .map_err(BufferError::Spawn)?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Cancel the timer and wait for the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Segment sweeper panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
