//! Typed control messages for the instant replay recorder.
//!
//! This crate defines the message types exchanged between the recorder core
//! and whatever host drives it (tray UI, CLI, hotkey listener), plus the
//! persisted configuration record they share.

mod commands;
mod events;
mod state;
mod types;

pub use commands::RecorderCommand;
pub use events::{Notification, RecorderEvent, ReplayFailure};
pub use state::{PipelineState, StopReason};
pub use types::{AudioDevice, AudioDeviceType, BufferMode, BufferStatus, RecorderConfig};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (host → recorder).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (recorder → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<RecorderCommand>, Receiver<RecorderCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<RecorderEvent>, Receiver<RecorderEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
