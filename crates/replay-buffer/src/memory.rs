//! In-memory rolling buffer.
//!
//! The encoder's stdout arrives as [`Bytes`] batches on a channel; the
//! [`BufferIngest`] thread timestamps each batch on arrival, appends it, and
//! evicts stale chunks in the same critical section. Extraction takes a
//! [`Snapshot`], which clones the `Bytes` handles and never copies payload.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, trace};

use replay_ipc::BufferStatus;

use crate::error::BufferError;
use crate::retention::RetentionPolicy;
use crate::{BufferResult, MIN_RETAINED_CHUNKS};

/// Buffer shared between the ingest thread and extraction.
pub type SharedBuffer = Arc<Mutex<MemoryBuffer>>;

/// One batch of encoder output.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonic arrival time.
    pub timestamp: Instant,

    /// Encoded bytes.
    pub payload: Bytes,
}

impl Chunk {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Time-ordered chunk queue with head eviction.
#[derive(Debug)]
pub struct MemoryBuffer {
    chunks: VecDeque<Chunk>,
    total_bytes: u64,
    policy: RetentionPolicy,
}

impl MemoryBuffer {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            policy,
        }
    }

    /// Wrap a new buffer for sharing.
    pub fn shared(policy: RetentionPolicy) -> SharedBuffer {
        Arc::new(Mutex::new(Self::new(policy)))
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Replace the policy. Takes effect at the next eviction.
    pub fn set_policy(&mut self, policy: RetentionPolicy) {
        self.policy = policy;
    }

    /// Append a payload received at `now`.
    ///
    /// Timestamps never go backwards: a `now` earlier than the newest chunk
    /// is clamped to it.
    pub fn append(&mut self, payload: Bytes, now: Instant) {
        if payload.is_empty() {
            return;
        }
        let timestamp = match self.chunks.back() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.total_bytes += payload.len() as u64;
        self.chunks.push_back(Chunk { timestamp, payload });
    }

    /// Drop chunks from the head while the oldest is stale or the byte cap is
    /// exceeded, keeping at least [`MIN_RETAINED_CHUNKS`]. Returns the number
    /// of chunks dropped.
    pub fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while self.chunks.len() > MIN_RETAINED_CHUNKS {
            let Some(oldest) = self.chunks.front() else {
                break;
            };
            let age = now.saturating_duration_since(oldest.timestamp);
            if !self.policy.is_stale(age) && !self.policy.is_over_cap(self.total_bytes) {
                break;
            }
            if let Some(chunk) = self.chunks.pop_front() {
                self.total_bytes -= chunk.size() as u64;
                evicted += 1;
            }
        }
        evicted
    }

    /// Capture the current sequence without copying payloads.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            chunks: self.chunks.iter().map(|c| c.payload.clone()).collect(),
            bytes: self.total_bytes,
            span: self.span(),
        }
    }

    /// Time between the oldest and newest chunk.
    pub fn span(&self) -> Duration {
        match (self.chunks.front(), self.chunks.back()) {
            (Some(first), Some(last)) => last.timestamp.duration_since(first.timestamp),
            _ => Duration::ZERO,
        }
    }

    /// Age of the oldest chunk at `now`.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.chunks
            .front()
            .map(|c| now.saturating_duration_since(c.timestamp))
    }

    pub fn stats(&self) -> BufferStatus {
        BufferStatus {
            entries: self.chunks.len(),
            bytes: self.total_bytes,
            span_seconds: self.span().as_secs_f64(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

/// Immutable view of the buffer at one instant.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    chunks: Vec<Bytes>,
    bytes: u64,
    span: Duration,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total payload bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Time covered by the snapshot.
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Write every payload in order. Returns the number of bytes written.
    ///
    /// Writes are synchronous, so each chunk is accepted by the writer before
    /// the next one is handed over.
    pub fn write_to<W: Write>(&self, mut writer: W) -> BufferResult<u64> {
        let mut written = 0u64;
        for payload in &self.chunks {
            writer.write_all(payload)?;
            written += payload.len() as u64;
        }
        writer.flush()?;
        Ok(written)
    }
}

/// Thread that moves encoder output into a [`MemoryBuffer`].
///
/// Runs until every sender of its channel is dropped, which happens when the
/// encoder's stdout reaches end of file.
pub struct BufferIngest {
    handle: Option<JoinHandle<()>>,
}

impl BufferIngest {
    pub fn spawn(buffer: SharedBuffer, rx: Receiver<Bytes>) -> BufferResult<Self> {
        let handle = std::thread::Builder::new()
            .name("buffer-ingest".to_string())
            .spawn(move || ingest_loop(buffer, rx))
            .map_err(BufferError::Spawn)?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Check if the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the channel to drain and the thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Buffer ingest thread panicked");
            }
        }
    }
}

fn ingest_loop(buffer: SharedBuffer, rx: Receiver<Bytes>) {
    debug!("Buffer ingest started");
    for payload in rx.iter() {
        let now = Instant::now();
        let mut buffer = buffer.lock();
        buffer.append(payload, now);
        let evicted = buffer.evict(now);
        if evicted > 0 {
            trace!(
                evicted,
                chunks = buffer.len(),
                bytes = buffer.total_bytes(),
                "Evicted stale chunks"
            );
        }
    }
    debug!("Buffer ingest finished");
}
