//! Resources owned by one running pipeline.
//!
//! A [`Session`] is built in phases: buffer, encoder process, buffer worker,
//! audio relay. Every resource rolls itself back on drop, so a failure in a
//! later phase releases whatever the earlier phases acquired.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, instrument};

use replay_audio::AudioRelay;
use replay_buffer::{
    BufferIngest, MemoryBuffer, RetentionPolicy, SegmentStore, SharedBuffer, Sweeper,
    SWEEP_INTERVAL,
};
use replay_extract::{ExtractError, ExtractSource};
use replay_ipc::{AudioDevice, BufferMode, BufferStatus, PipelineState, RecorderConfig};
use replay_pipeline::{
    plan, CaptureBackend, OutputRoute, OutputSink, PipelineProcess, PipelineSupervisor,
    SILENCE_PRIME,
};

use crate::EngineResult;

/// Where the encoder's output accumulates.
enum ActiveBuffer {
    Memory {
        buffer: SharedBuffer,
        // Detached on drop; exits when the encoder's stdout closes.
        _ingest: BufferIngest,
    },
    Disk {
        store: Arc<SegmentStore>,
        sweeper: Sweeper,
    },
}

/// Paths the recorder keeps its working data under.
#[derive(Debug, Clone)]
pub struct ScratchPaths {
    root: PathBuf,
}

impl ScratchPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache directory, falling back to the temp directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(crate::APP_DIR_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Segment files of the disk buffer.
    pub fn segments(&self) -> PathBuf {
        self.root.join("segments")
    }

    /// Temporary containers and extraction work directories.
    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }
}

impl Default for ScratchPaths {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

/// One running pipeline with its buffer.
pub(crate) struct Session {
    process: PipelineProcess,
    buffer: ActiveBuffer,
    audio_enabled: bool,
    started_at_ms: i64,
}

impl Session {
    /// Start the encoder and wire its output into a fresh buffer.
    #[instrument(name = "session_launch", skip_all, fields(mode = ?config.buffer_mode))]
    pub(crate) fn launch(
        supervisor: &PipelineSupervisor,
        config: &RecorderConfig,
        devices: &[AudioDevice],
        paths: &ScratchPaths,
        relay: &AudioRelay,
    ) -> EngineResult<Self> {
        let backend = CaptureBackend::current();

        let (process, buffer, audio) = match config.buffer_mode {
            BufferMode::Memory => {
                let invocation = plan(config, devices, backend, OutputSink::Stream);
                let buffer = MemoryBuffer::shared(RetentionPolicy::from_config(config));
                let (tx, rx) = crossbeam_channel::unbounded();
                let ingest = BufferIngest::spawn(Arc::clone(&buffer), rx)?;
                let process = supervisor.spawn(&invocation, OutputRoute::Forward(tx))?;
                (
                    process,
                    ActiveBuffer::Memory {
                        buffer,
                        _ingest: ingest,
                    },
                    invocation.audio,
                )
            }
            BufferMode::Disk => {
                let store = Arc::new(SegmentStore::from_config(paths.segments(), config));
                store.prepare()?;
                let sink = OutputSink::Segments {
                    dir: store.dir().to_path_buf(),
                    segment_seconds: store.segment_seconds(),
                };
                let invocation = plan(config, devices, backend, sink);
                let process = supervisor.spawn(&invocation, OutputRoute::Discard)?;
                let sweeper = Sweeper::spawn(Arc::clone(&store), SWEEP_INTERVAL)?;
                (process, ActiveBuffer::Disk { store, sweeper }, invocation.audio)
            }
        };

        let audio_enabled = audio.uses_side_channel();
        if audio_enabled {
            let input = process.input();
            if input.prime_silence(SILENCE_PRIME).is_err() {
                debug!("Pipeline input closed before priming");
            }
            relay.start(input);
        }

        info!(
            pid = process.pid(),
            generation = process.generation(),
            ?audio,
            "Session started"
        );

        Ok(Self {
            process,
            buffer,
            audio_enabled,
            started_at_ms: unix_millis(SystemTime::now()),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.process.generation()
    }

    /// The `Active` state describing this session.
    pub(crate) fn active_state(&self) -> PipelineState {
        PipelineState::Active {
            pid: self.process.pid(),
            started_at_ms: self.started_at_ms,
            audio_enabled: self.audio_enabled,
        }
    }

    /// Capture what an extraction needs, without blocking the buffer.
    pub(crate) fn extract_source(&self) -> Result<ExtractSource, ExtractError> {
        match &self.buffer {
            ActiveBuffer::Memory { buffer, .. } => Ok(ExtractSource::Memory(buffer.lock().snapshot())),
            ActiveBuffer::Disk { store, .. } => store
                .select_trailing()
                .map(ExtractSource::Disk)
                .map_err(|e| ExtractError::Io {
                    path: store.dir().to_path_buf(),
                    source: std::io::Error::other(e),
                }),
        }
    }

    /// Apply a new retention policy to the live buffer.
    pub(crate) fn set_policy(&self, policy: RetentionPolicy) {
        if let ActiveBuffer::Memory { buffer, .. } = &self.buffer {
            buffer.lock().set_policy(policy);
        }
    }

    pub(crate) fn stats(&self) -> BufferStatus {
        match &self.buffer {
            ActiveBuffer::Memory { buffer, .. } => buffer.lock().stats(),
            ActiveBuffer::Disk { store, .. } => store.stats().unwrap_or_default(),
        }
    }

    /// Close input, signal the encoder, and cancel the sweeper.
    ///
    /// Returns without waiting for the process; its exit arrives on the
    /// supervisor's channel.
    pub(crate) fn shutdown(mut self, grace: Duration) {
        debug!(
            pid = self.process.pid(),
            uptime_secs = self.process.started_at().elapsed().as_secs_f64(),
            "Shutting down session"
        );
        self.process.shutdown(grace);
        if let ActiveBuffer::Disk { sweeper, .. } = self.buffer {
            sweeper.stop();
        }
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
