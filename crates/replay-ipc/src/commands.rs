//! Commands sent from the host to the recorder.

use serde::{Deserialize, Serialize};

use crate::types::{AudioDevice, RecorderConfig};

/// Commands that a host can send to the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecorderCommand {
    /// Start the capture pipeline.
    Start,

    /// Stop the capture pipeline.
    Stop,

    /// Save the trailing window of the buffer as a replay file.
    SaveReplay,

    /// Replace the configuration. Restarts the pipeline when audio devices change.
    UpdateConfig(Box<RecorderConfig>),

    /// Publish the audio devices detected by the host.
    SetAudioDevices(Vec<AudioDevice>),

    /// Request the list of known audio devices.
    GetAudioDevices,

    /// Request current recorder state.
    GetState,

    /// Stop everything and end the command loop.
    Shutdown,
}
