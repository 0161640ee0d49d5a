//! Forwarding of externally captured samples into the encoder's stdin.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, trace};

use replay_pipeline::PipelineInput;

/// Counters for forwarded and dropped batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Relay from the host's audio capture to the running encoder.
///
/// Only the supervisor calls [`start`](Self::start) and
/// [`stop`](Self::stop). Samples pushed while stopped are ignored, and a
/// closed input channel drops the batch without reporting an error.
#[derive(Debug, Default)]
pub struct AudioRelay {
    target: RwLock<Option<PipelineInput>>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl AudioRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin forwarding into `input`.
    pub fn start(&self, input: PipelineInput) {
        debug!("Audio relay started");
        *self.target.write() = Some(input);
    }

    /// Stop forwarding. Later pushes are ignored.
    pub fn stop(&self) {
        if self.target.write().take().is_some() {
            debug!("Audio relay stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.target.read().is_some()
    }

    /// Forward interleaved f32 samples. Returns true if the batch was queued.
    pub fn push(&self, samples: &[f32]) -> bool {
        if samples.is_empty() || !self.is_active() {
            return false;
        }
        self.push_bytes(encode_samples(samples))
    }

    /// Forward an already encoded f32le batch.
    pub fn push_bytes(&self, data: Bytes) -> bool {
        let target = self.target.read();
        let Some(input) = target.as_ref() else {
            return false;
        };

        match input.try_write(data) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                // Expected while the pipeline is shutting down.
                trace!("Pipeline input not writable, dropping audio batch");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Encode samples as little-endian f32, soft-clipping out-of-range values.
pub fn encode_samples(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 4);
    for &sample in samples {
        buf.put_f32_le(soft_clip(sample));
    }
    buf.freeze()
}

/// Soft clipping to avoid harsh digital clipping.
fn soft_clip(sample: f32) -> f32 {
    if sample.is_nan() {
        0.0
    } else if sample > 1.0 {
        1.0 - (-sample + 1.0).exp() * 0.5
    } else if sample < -1.0 {
        -1.0 + (sample + 1.0).exp() * 0.5
    } else {
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_samples_little_endian() {
        let bytes = encode_samples(&[0.5, -0.25]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-0.25f32).to_le_bytes());
    }

    #[test]
    fn test_soft_clip_bounds() {
        assert_eq!(soft_clip(0.3), 0.3);
        assert!(soft_clip(4.0) <= 1.0);
        assert!(soft_clip(4.0) > 0.5);
        assert!(soft_clip(-4.0) >= -1.0);
        assert_eq!(soft_clip(f32::NAN), 0.0);
    }

    #[test]
    fn test_inactive_relay_ignores_samples() {
        let relay = AudioRelay::new();
        assert!(!relay.is_active());
        assert!(!relay.push(&[0.1, 0.2]));
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use replay_pipeline::{AudioPlan, Invocation, OutputRoute, OutputSink, PipelineSupervisor};
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        fn cat_invocation(dir: &tempfile::TempDir) -> Invocation {
            let path = dir.path().join("fake-ffmpeg.sh");
            std::fs::write(&path, "#!/bin/sh\nexec cat\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            Invocation {
                program: path.to_string_lossy().into_owned(),
                args: Vec::new(),
                audio: AudioPlan::System,
                sink: OutputSink::Stream,
            }
        }

        #[test]
        fn test_relay_forwards_until_input_closes() {
            let dir = tempfile::tempdir().unwrap();
            let (supervisor, exits) = PipelineSupervisor::new().unwrap();
            let (tx, rx) = crossbeam_channel::unbounded();
            let mut process = supervisor
                .spawn(&cat_invocation(&dir), OutputRoute::Forward(tx))
                .unwrap();

            let relay = AudioRelay::new();
            relay.start(process.input());
            assert!(relay.push(&[0.25; 16]));

            let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(&received[..4], &0.25f32.to_le_bytes());

            process.shutdown(Duration::from_secs(2));
            exits.recv_timeout(Duration::from_secs(5)).unwrap();

            // Closed channel: dropped silently while still started.
            assert!(!relay.push(&[0.25; 16]));
            assert_eq!(relay.stats().dropped, 1);

            relay.stop();
            assert!(!relay.push(&[0.25; 16]));
            assert_eq!(relay.stats().forwarded, 1);
        }
    }
}
