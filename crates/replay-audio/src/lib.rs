//! Secondary audio forwarding.
//!
//! System audio is captured outside this process and handed to the
//! [`AudioRelay`] as interleaved f32 stereo at 48 kHz. The relay forwards it
//! to the encoder's stdin while the supervisor says it should.

mod device;
mod error;
mod relay;

pub use device::{DeviceEnumerator, StaticDeviceList};
pub use error::AudioError;
pub use relay::{encode_samples, AudioRelay, RelayStats};

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
