//! Extraction protocols for the memory and disk buffers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, instrument, warn};

use replay_buffer::{SegmentFile, Snapshot};

use crate::error::ExtractError;
use crate::remux::Remuxer;
use crate::scratch::{unique_path, ScratchDir, ScratchFile};
use crate::{ExtractResult, ARTIFACT_EXTENSION, ARTIFACT_PREFIX};

/// Buffered content captured at trigger time.
#[derive(Debug, Clone)]
pub enum ExtractSource {
    /// Chunk snapshot of the memory buffer.
    Memory(Snapshot),

    /// Trailing segment files of the disk buffer, oldest first.
    Disk(Vec<SegmentFile>),
}

impl ExtractSource {
    /// Bytes available to extract from.
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Memory(snapshot) => snapshot.bytes(),
            Self::Disk(segments) => segments.iter().map(|s| s.size_bytes).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Memory(snapshot) => snapshot.is_empty(),
            Self::Disk(segments) => segments.is_empty(),
        }
    }
}

/// Everything one extraction needs.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub source: ExtractSource,

    /// Trailing duration to keep.
    pub window: Duration,

    /// Directory the artifact is written to.
    pub output_dir: PathBuf,

    /// Below this many buffered bytes the request is refused.
    pub min_buffer_bytes: u64,

    /// Artifacts smaller than this are treated as corrupt.
    pub min_artifact_bytes: u64,

    /// Wall-clock trigger time, used only for the artifact name.
    pub requested_at: DateTime<Local>,
}

/// File name for an artifact triggered at `time`.
pub fn output_file_name(time: DateTime<Local>) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}.{ARTIFACT_EXTENSION}",
        time.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Runs extraction requests against a [`Remuxer`].
pub struct ReplayExtractor {
    remuxer: Arc<dyn Remuxer>,
    work_root: PathBuf,
}

impl ReplayExtractor {
    /// `work_root` holds temporary containers and per-extraction work
    /// directories.
    pub fn new(remuxer: Arc<dyn Remuxer>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            remuxer,
            work_root: work_root.into(),
        }
    }

    /// Produce the artifact. Temporary files are gone when this returns,
    /// whatever the outcome.
    #[instrument(name = "extract_replay", skip(self, request), fields(window = ?request.window))]
    pub fn extract(&self, request: ExtractRequest) -> ExtractResult<PathBuf> {
        let started = Instant::now();

        let bytes = request.source.bytes();
        if request.source.is_empty() || bytes < request.min_buffer_bytes {
            return Err(ExtractError::InsufficientBuffer {
                bytes,
                required: request.min_buffer_bytes,
            });
        }

        fs::create_dir_all(&self.work_root).map_err(|e| ExtractError::io(&self.work_root, e))?;
        fs::create_dir_all(&request.output_dir)
            .map_err(|e| ExtractError::io(&request.output_dir, e))?;
        let output = available_output_path(&request.output_dir, request.requested_at);

        let result = match &request.source {
            ExtractSource::Memory(snapshot) => {
                self.extract_snapshot(snapshot, request.window, &output)
            }
            ExtractSource::Disk(segments) => {
                self.extract_segments(segments, request.window, &output)
            }
        };

        if let Err(e) = result {
            remove_partial(&output);
            return Err(e);
        }

        let size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if size < request.min_artifact_bytes {
            remove_partial(&output);
            return Err(ExtractError::CorruptOutput {
                path: output,
                bytes: size,
                required: request.min_artifact_bytes,
            });
        }

        info!(
            path = %output.display(),
            bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replay saved"
        );
        Ok(output)
    }

    fn extract_snapshot(&self, snapshot: &Snapshot, window: Duration, output: &Path) -> ExtractResult<()> {
        let container = ScratchFile::new(unique_path(&self.work_root, "replay-buffer", Some("ts")));

        let file = File::create(container.path()).map_err(|e| ExtractError::io(container.path(), e))?;
        let mut writer = BufWriter::new(file);
        let written = snapshot
            .write_to(&mut writer)
            .map_err(|e| ExtractError::io(container.path(), std::io::Error::other(e)))?;
        writer
            .into_inner()
            .map_err(|e| ExtractError::io(container.path(), e.into_error()))?
            .sync_all()
            .map_err(|e| ExtractError::io(container.path(), e))?;

        debug!(
            chunks = snapshot.len(),
            bytes = written,
            span_secs = snapshot.span().as_secs_f64(),
            "Snapshot written"
        );

        self.remuxer.trim_tail(container.path(), window, output)
    }

    fn extract_segments(
        &self,
        segments: &[SegmentFile],
        window: Duration,
        output: &Path,
    ) -> ExtractResult<()> {
        let work = ScratchDir::create(unique_path(&self.work_root, "replay-work", None))
            .map_err(|e| ExtractError::io(&self.work_root, e))?;

        // Staged copies survive the sweeper deleting the originals.
        let mut staged = Vec::with_capacity(segments.len());
        let mut staged_bytes = 0;
        for (index, segment) in segments.iter().enumerate() {
            let target = work.path().join(format!("part_{index:04}.ts"));
            match stage(&segment.path, &target) {
                Ok(size) => {
                    staged_bytes += size;
                    staged.push(target);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %segment.path.display(), "Segment vanished before staging");
                }
                Err(e) => return Err(ExtractError::io(&segment.path, e)),
            }
        }

        if staged.is_empty() {
            return Err(ExtractError::InsufficientBuffer {
                bytes: 0,
                required: 1,
            });
        }
        debug!(segments = staged.len(), bytes = staged_bytes, "Segments staged");

        let list = work.path().join("concat.txt");
        write_concat_list(&list, &staged)?;

        let joined = work.path().join("joined.ts");
        self.remuxer.concat(&list, &joined)?;
        self.remuxer.trim_tail(&joined, window, output)
    }
}

/// Hard link when possible, copy otherwise. Returns the staged size.
fn stage(source: &Path, target: &Path) -> std::io::Result<u64> {
    match fs::hard_link(source, target) {
        Ok(()) => Ok(fs::metadata(target)?.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(_) => fs::copy(source, target),
    }
}

fn write_concat_list(list: &Path, files: &[PathBuf]) -> ExtractResult<()> {
    let mut out = BufWriter::new(File::create(list).map_err(|e| ExtractError::io(list, e))?);
    for file in files {
        let escaped = file.to_string_lossy().replace('\'', "'\\''");
        writeln!(out, "file '{escaped}'").map_err(|e| ExtractError::io(list, e))?;
    }
    out.flush().map_err(|e| ExtractError::io(list, e))
}

fn available_output_path(dir: &Path, time: DateTime<Local>) -> PathBuf {
    let candidate = dir.join(output_file_name(time));
    if !candidate.exists() {
        return candidate;
    }
    let stem = format!("{ARTIFACT_PREFIX}{}", time.format("%Y-%m-%d_%H-%M-%S"));
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.{ARTIFACT_EXTENSION}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed incomplete replay"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove incomplete replay: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use replay_buffer::{MemoryBuffer, RetentionPolicy};
    use std::sync::Mutex;

    /// Copies bytes instead of remuxing, and records what it was asked.
    #[derive(Default)]
    struct CopyRemuxer {
        calls: Mutex<Vec<String>>,
        fail_trim: bool,
        truncate: bool,
    }

    impl Remuxer for CopyRemuxer {
        fn trim_tail(&self, input: &Path, duration: Duration, output: &Path) -> ExtractResult<()> {
            self.calls.lock().unwrap().push(format!("trim {}s", duration.as_secs()));
            assert!(input.exists(), "trim input must exist while trimming");
            if self.fail_trim {
                fs::write(output, b"partial").unwrap();
                return Err(ExtractError::ProcessFailed {
                    step: "trim",
                    code: Some(1),
                    detail: "boom".to_string(),
                });
            }
            if self.truncate {
                fs::write(output, b"tiny").unwrap();
            } else {
                fs::copy(input, output).unwrap();
            }
            Ok(())
        }

        fn concat(&self, list: &Path, output: &Path) -> ExtractResult<()> {
            self.calls.lock().unwrap().push("concat".to_string());
            let mut joined = Vec::new();
            for line in fs::read_to_string(list).unwrap().lines() {
                let path = line.trim_start_matches("file '").trim_end_matches('\'');
                joined.extend(fs::read(path).unwrap());
            }
            fs::write(output, joined).unwrap();
            Ok(())
        }
    }

    fn snapshot(chunks: usize, chunk_size: usize) -> Snapshot {
        let mut buffer = MemoryBuffer::new(RetentionPolicy::default());
        let now = Instant::now();
        for i in 0..chunks {
            buffer.append(Bytes::from(vec![i as u8; chunk_size]), now);
        }
        buffer.snapshot()
    }

    fn request(source: ExtractSource, output_dir: &Path) -> ExtractRequest {
        ExtractRequest {
            source,
            window: Duration::from_secs(30),
            output_dir: output_dir.to_path_buf(),
            min_buffer_bytes: 1024,
            min_artifact_bytes: 512,
            requested_at: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        }
    }

    fn dir_is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[test]
    fn test_output_file_name() {
        let time = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(output_file_name(time), "Replay_2024-03-09_14-05-07.mp4");
    }

    #[test]
    fn test_memory_extraction_writes_artifact_and_cleans_up() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(CopyRemuxer::default());
        let extractor = ReplayExtractor::new(remuxer.clone(), work.path());

        let path = extractor
            .extract(request(ExtractSource::Memory(snapshot(4, 1024)), out.path()))
            .unwrap();

        assert_eq!(path, out.path().join("Replay_2024-03-09_14-05-07.mp4"));
        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(data[0], 0);
        assert_eq!(data[3072], 3);
        assert!(dir_is_empty(work.path()));
        assert_eq!(*remuxer.calls.lock().unwrap(), ["trim 30s"]);
    }

    #[test]
    fn test_empty_buffer_is_insufficient() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let extractor = ReplayExtractor::new(Arc::new(CopyRemuxer::default()), work.path());

        let err = extractor
            .extract(request(ExtractSource::Memory(Snapshot::default()), out.path()))
            .unwrap_err();

        assert!(matches!(err, ExtractError::InsufficientBuffer { bytes: 0, required: 1024 }));
        assert!(dir_is_empty(out.path()));
    }

    #[test]
    fn test_small_buffer_is_insufficient() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let extractor = ReplayExtractor::new(Arc::new(CopyRemuxer::default()), work.path());

        let err = extractor
            .extract(request(ExtractSource::Memory(snapshot(2, 100)), out.path()))
            .unwrap_err();

        assert!(matches!(err, ExtractError::InsufficientBuffer { bytes: 200, .. }));
    }

    #[test]
    fn test_trim_failure_removes_temp_and_partial_output() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let remuxer = CopyRemuxer {
            fail_trim: true,
            ..Default::default()
        };
        let extractor = ReplayExtractor::new(Arc::new(remuxer), work.path());

        let err = extractor
            .extract(request(ExtractSource::Memory(snapshot(4, 1024)), out.path()))
            .unwrap_err();

        assert!(matches!(err, ExtractError::ProcessFailed { step: "trim", .. }));
        assert!(dir_is_empty(work.path()));
        assert!(dir_is_empty(out.path()));
    }

    #[test]
    fn test_undersized_output_is_corrupt() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let remuxer = CopyRemuxer {
            truncate: true,
            ..Default::default()
        };
        let extractor = ReplayExtractor::new(Arc::new(remuxer), work.path());

        let err = extractor
            .extract(request(ExtractSource::Memory(snapshot(4, 1024)), out.path()))
            .unwrap_err();

        assert!(matches!(err, ExtractError::CorruptOutput { bytes: 4, required: 512, .. }));
        assert!(dir_is_empty(out.path()));
        assert!(dir_is_empty(work.path()));
    }

    #[test]
    fn test_name_collision_gets_suffix() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let extractor = ReplayExtractor::new(Arc::new(CopyRemuxer::default()), work.path());

        let first = extractor
            .extract(request(ExtractSource::Memory(snapshot(4, 1024)), out.path()))
            .unwrap();
        let second = extractor
            .extract(request(ExtractSource::Memory(snapshot(4, 1024)), out.path()))
            .unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("Replay_2024-03-09_14-05-07_1.mp4"));
    }

    #[test]
    fn test_disk_extraction_concats_in_order_then_trims() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let segments_dir = tempfile::tempdir().unwrap();

        let segments: Vec<_> = (0..3u8)
            .map(|i| {
                let path = segments_dir.path().join(format!("segment_20240101_12000{i}.ts"));
                fs::write(&path, vec![i; 1024]).unwrap();
                SegmentFile {
                    path,
                    created_at: std::time::SystemTime::now(),
                    size_bytes: 1024,
                }
            })
            .collect();

        let remuxer = Arc::new(CopyRemuxer::default());
        let extractor = ReplayExtractor::new(remuxer.clone(), work.path());
        let path = extractor
            .extract(request(ExtractSource::Disk(segments.clone()), out.path()))
            .unwrap();

        let data = fs::read(path).unwrap();
        assert_eq!(data.len(), 3072);
        assert_eq!((data[0], data[1024], data[2048]), (0, 1, 2));
        assert_eq!(*remuxer.calls.lock().unwrap(), ["concat", "trim 30s"]);
        assert!(dir_is_empty(work.path()));
        // Originals belong to the buffer and are left alone.
        assert!(segments.iter().all(|s| s.path.exists()));
    }

    #[test]
    fn test_disk_extraction_skips_swept_segments() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let segments_dir = tempfile::tempdir().unwrap();

        let present = segments_dir.path().join("segment_20240101_120002.ts");
        fs::write(&present, vec![7u8; 2048]).unwrap();
        let segments = vec![
            SegmentFile {
                path: segments_dir.path().join("segment_20240101_120000.ts"),
                created_at: std::time::SystemTime::now(),
                size_bytes: 2048,
            },
            SegmentFile {
                path: present,
                created_at: std::time::SystemTime::now(),
                size_bytes: 2048,
            },
        ];

        let extractor = ReplayExtractor::new(Arc::new(CopyRemuxer::default()), work.path());
        let path = extractor
            .extract(request(ExtractSource::Disk(segments), out.path()))
            .unwrap();

        assert_eq!(fs::read(path).unwrap().len(), 2048);
    }
}
