//! Audio device enumeration seam.
//!
//! Enumeration itself belongs to the host UI. The recorder only needs a
//! current list to resolve the configured selectors against.

use parking_lot::RwLock;
use tracing::debug;

use replay_ipc::{AudioDevice, AudioDeviceType};

use crate::error::AudioError;
use crate::AudioResult;

/// Source of the currently available audio devices.
pub trait DeviceEnumerator: Send + Sync {
    /// Enumerate input and output devices.
    fn enumerate(&self) -> AudioResult<Vec<AudioDevice>>;

    /// Find a device by its ID.
    fn find_device_by_id(&self, id: &str) -> AudioResult<AudioDevice> {
        self.enumerate()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
    }

    /// Get the default device of a type, if any.
    fn default_device(&self, device_type: AudioDeviceType) -> AudioResult<Option<AudioDevice>> {
        Ok(self
            .enumerate()?
            .into_iter()
            .find(|d| d.device_type == device_type && d.is_default))
    }
}

/// Device list published by the host.
#[derive(Debug, Default)]
pub struct StaticDeviceList {
    devices: RwLock<Vec<AudioDevice>>,
}

impl StaticDeviceList {
    pub fn new(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Replace the published list.
    pub fn set(&self, devices: Vec<AudioDevice>) {
        debug!(count = devices.len(), "Audio device list updated");
        *self.devices.write() = devices;
    }
}

impl DeviceEnumerator for StaticDeviceList {
    fn enumerate(&self) -> AudioResult<Vec<AudioDevice>> {
        Ok(self.devices.read().clone())
    }
}
