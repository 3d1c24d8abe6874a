//! Live audio device I/O
//!
//! The engine talks to devices through two traits:
//!
//! - [`AudioHost`]: opens/closes the stream and lists devices
//! - [`AudioCallback`]: called by the device for every period
//!
//! [`CpalHost`] implements the host with CPAL on every platform. Enable the
//! `jack` feature to make the native JACK host available on Linux.

mod backend;
mod config;
mod cpal_backend;
mod device;
mod error;

pub use backend::{AudioCallback, AudioHost, LatencyInfo, StreamInfo, StreamRequest};
pub use config::{AudioConfig, BufferSize, DeviceId, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
pub use cpal_backend::CpalHost;
pub use device::{device_list_json, enumerate_devices, AudioDevice};
pub use error::{AudioError, AudioResult};
