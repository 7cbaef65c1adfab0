//! Capture-path collaborators.
//!
//! The core never touches audio hardware directly. It drives a
//! [`CaptureSession`] (one per first-stage engine), opens [`CaptureDevice`]s
//! for each client session, and gets both from a [`CaptureBackend`].
//!
//! # Callback contract
//!
//! A capture session delivers asynchronous detection and end-of-stream events
//! through the [`EventCallback`] registered by its engine. The callback runs
//! on a thread owned by the backend and must return quickly; the engine only
//! parses, records and signals there.

pub mod device;

pub use device::{CaptureDevice, CaptureProfile, DeviceId};

use std::sync::Arc;

use crate::config::ModuleType;
use crate::error::Result;

/// Endpoint id of the primary capture stream of a session.
pub const CAPTURE_ENDPOINT: u32 = 0;

/// Asynchronous event from the capture session: `(event_id, payload)`.
pub type EventCallback = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Control surface of one DSP capture session.
pub trait CaptureSession: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn prepare(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    /// Reads up to `buf.len()` bytes of captured audio.
    fn read(&self, endpoint: u32, buf: &mut [u8]) -> Result<usize>;

    /// Preferred read size in bytes for [`CaptureSession::read`].
    fn buffer_size(&self) -> usize;

    /// Allocates a shared hardware buffer of `frames` frames.
    fn create_mapped_buffer(&self, frames: u32) -> Result<Arc<dyn MappedBuffer>>;

    /// Total frames written into the mapped buffer since it was created.
    fn mapped_write_position(&self) -> Result<u64>;

    fn set_parameter(&self, tag_id: u32, param_id: u32, payload: &[u8]) -> Result<()>;

    /// DSP module instance id for a module tag.
    fn module_instance_id(&self, tag_id: u32) -> Result<u32>;

    fn register_event_callback(&self, callback: EventCallback);
}

/// Memory shared with the DSP, written circularly by the hardware.
pub trait MappedBuffer: Send + Sync {
    fn size_bytes(&self) -> usize;

    /// Copies `out.len()` bytes starting at `offset`. The caller handles
    /// wrap-around.
    fn copy_out(&self, offset: usize, out: &mut [u8]);
}

/// Factory for the hardware-facing collaborators.
pub trait CaptureBackend: Send + Sync {
    fn create_session(&self, module: ModuleType) -> Result<Arc<dyn CaptureSession>>;

    fn create_device(&self, id: DeviceId) -> Result<Arc<dyn CaptureDevice>>;

    /// Device a new session captures from.
    fn default_device(&self) -> DeviceId;

    /// Capture profile currently selected for `device`, which changes with
    /// concurrent capture activity.
    fn capture_profile(&self, device: DeviceId) -> CaptureProfile;
}
