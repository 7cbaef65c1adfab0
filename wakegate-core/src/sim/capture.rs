//! Loopback capture collaborators.
//!
//! [`LoopbackCapture`] records every parameter push, serves queued PCM (or
//! silence) to reads, acknowledges engine resets with an end-of-stream event
//! and lets tests inject detection payloads on the calling thread.
//! [`LoopbackBackend`] hands out one capture per module type plus
//! [`LoopbackDevice`]s, and can simulate a subsystem restart or a capture
//! profile switch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::audio::{
    CaptureBackend, CaptureDevice, CaptureProfile, CaptureSession, DeviceId, EventCallback,
    MappedBuffer,
};
use crate::buffering::format::AudioFormat;
use crate::config::{ModuleConfig, ModuleType};
use crate::dispatch::{EVENT_DETECTION, EVENT_END_OF_STREAM};
use crate::error::{Result, WakegateError};

/// Bytes returned per read: 20 ms of 16 kHz mono 16-bit audio.
const READ_SIZE: usize = 640;

/// One recorded `set_parameter` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedParam {
    pub tag_id: u32,
    pub param_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct LoopbackMappedBuffer {
    data: Mutex<Vec<u8>>,
}

impl MappedBuffer for LoopbackMappedBuffer {
    fn size_bytes(&self) -> usize {
        self.data.lock().len()
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.lock();
        let end = (offset + out.len()).min(data.len());
        let n = end.saturating_sub(offset);
        out[..n].copy_from_slice(&data[offset..end]);
    }
}

#[derive(Default)]
struct State {
    open: bool,
    started: bool,
    offline: bool,
    params: Vec<RecordedParam>,
    audio: VecDeque<u8>,
    callback: Option<EventCallback>,
    instance_ids: HashMap<u32, u32>,
    mapped: Option<Arc<LoopbackMappedBuffer>>,
    mapped_frames: u64,
}

impl State {
    /// Next `out.len()` bytes of queued audio, padded with silence.
    fn fill(&mut self, out: &mut [u8]) {
        for b in out.iter_mut() {
            *b = self.audio.pop_front().unwrap_or(0);
        }
    }
}

/// In-memory [`CaptureSession`].
pub struct LoopbackCapture {
    engine_reset_param: u32,
    format: AudioFormat,
    state: Mutex<State>,
}

impl LoopbackCapture {
    pub fn new() -> Arc<Self> {
        Self::for_module(&ModuleConfig::default(), AudioFormat::default())
    }

    pub fn for_module(module: &ModuleConfig, format: AudioFormat) -> Arc<Self> {
        Arc::new(Self {
            engine_reset_param: module.engine_reset.param_id,
            format,
            state: Mutex::new(State::default()),
        })
    }

    /// Every parameter pushed so far, oldest first.
    pub fn params(&self) -> Vec<RecordedParam> {
        self.state.lock().params.clone()
    }

    pub fn last_param(&self, param_id: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .params
            .iter()
            .rev()
            .find(|p| p.param_id == param_id)
            .map(|p| p.payload.clone())
    }

    pub fn clear_params(&self) {
        self.state.lock().params.clear();
    }

    /// Queues PCM for subsequent reads.
    pub fn push_audio(&self, pcm: &[u8]) {
        self.state.lock().audio.extend(pcm.iter().copied());
    }

    /// Delivers a detection payload through the registered callback on the
    /// calling thread.
    pub fn inject_detection(&self, payload: &[u8]) {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => callback(EVENT_DETECTION, payload),
            None => debug!("detection injected before a callback was registered"),
        }
    }

    /// While offline every operation fails with a subsystem restart.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            state.open = false;
            state.started = false;
            state.mapped = None;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn check_online(state: &State) -> Result<()> {
        if state.offline {
            Err(WakegateError::SubsystemRestart)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for LoopbackCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackCapture")
            .field("open", &state.open)
            .field("started", &state.started)
            .field("offline", &state.offline)
            .field("params", &state.params.len())
            .finish()
    }
}

impl CaptureSession for LoopbackCapture {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.open = false;
        state.started = false;
        state.mapped = None;
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        if !state.open {
            return Err(WakegateError::Capture("prepare on closed session".into()));
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if !state.open {
            return Err(WakegateError::Capture("start on closed session".into()));
        }
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.started = false;
        Ok(())
    }

    fn read(&self, _endpoint: u32, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if !state.started {
            return Err(WakegateError::Capture("read on stopped session".into()));
        }
        state.fill(buf);
        Ok(buf.len())
    }

    fn buffer_size(&self) -> usize {
        READ_SIZE
    }

    fn create_mapped_buffer(&self, frames: u32) -> Result<Arc<dyn MappedBuffer>> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let bytes = self.format.frames_to_bytes(u64::from(frames));
        let buffer = Arc::new(LoopbackMappedBuffer {
            data: Mutex::new(vec![0; bytes]),
        });
        state.mapped = Some(Arc::clone(&buffer));
        state.mapped_frames = 0;
        Ok(buffer)
    }

    /// Each call lets the "hardware" write one more read-size of audio.
    fn mapped_write_position(&self) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let Some(mapped) = state.mapped.clone() else {
            return Err(WakegateError::Capture("no mapped buffer".into()));
        };
        if state.started {
            let frame = self.format.frame_bytes().max(1);
            let mut chunk = vec![0u8; READ_SIZE];
            state.fill(&mut chunk);
            let mut data = mapped.data.lock();
            let size = data.len().max(1);
            let mut offset = self.format.frames_to_bytes(state.mapped_frames) % size;
            for b in chunk {
                data[offset] = b;
                offset = (offset + 1) % size;
            }
            state.mapped_frames += (READ_SIZE / frame) as u64;
        }
        Ok(state.mapped_frames)
    }

    fn set_parameter(&self, tag_id: u32, param_id: u32, payload: &[u8]) -> Result<()> {
        let callback = {
            let mut state = self.state.lock();
            Self::check_online(&state)?;
            if !state.open {
                return Err(WakegateError::Capture(format!(
                    "parameter {param_id:#x} pushed to closed session"
                )));
            }
            trace!(tag_id, param_id, size = payload.len(), "loopback parameter");
            state.params.push(RecordedParam {
                tag_id,
                param_id,
                payload: payload.to_vec(),
            });
            if param_id == self.engine_reset_param {
                state.callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(EVENT_END_OF_STREAM, &[]);
        }
        Ok(())
    }

    fn module_instance_id(&self, tag_id: u32) -> Result<u32> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let next = 0x4000 + state.instance_ids.len() as u32;
        Ok(*state.instance_ids.entry(tag_id).or_insert(next))
    }

    fn register_event_callback(&self, callback: EventCallback) {
        self.state.lock().callback = Some(callback);
    }
}

/// In-memory [`CaptureDevice`] that counts its transitions.
#[derive(Debug)]
pub struct LoopbackDevice {
    id: DeviceId,
    open: AtomicBool,
    started: AtomicBool,
    opens: AtomicUsize,
}

impl LoopbackDevice {
    pub fn new(id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            open: AtomicBool::new(false),
            started: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl CaptureDevice for LoopbackDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(WakegateError::Capture(format!("{} not open", self.id)));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

/// [`CaptureBackend`] over loopback sessions and devices.
pub struct LoopbackBackend {
    format: AudioFormat,
    captures: Mutex<HashMap<ModuleType, Arc<LoopbackCapture>>>,
    devices: Mutex<HashMap<DeviceId, Arc<LoopbackDevice>>>,
    default_device: Mutex<DeviceId>,
    low_power: AtomicBool,
    offline: AtomicBool,
    created: AtomicUsize,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::with_format(AudioFormat::default())
    }

    pub fn with_format(format: AudioFormat) -> Self {
        Self {
            format,
            captures: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            default_device: Mutex::new(DeviceId(1)),
            low_power: AtomicBool::new(true),
            offline: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    /// Most recent capture session created for `module`.
    pub fn capture(&self, module: ModuleType) -> Option<Arc<LoopbackCapture>> {
        self.captures.lock().get(&module).cloned()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<LoopbackDevice>> {
        self.devices.lock().get(&id).cloned()
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn set_default_device(&self, id: DeviceId) {
        *self.default_device.lock() = id;
    }

    /// Switches every device between the low-power and the regular profile.
    pub fn set_low_power(&self, low_power: bool) {
        self.low_power.store(low_power, Ordering::Release);
    }

    /// Takes every capture session down (or brings it back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
        for capture in self.captures.lock().values() {
            capture.set_offline(offline);
        }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LoopbackBackend {
    fn create_session(&self, module: ModuleType) -> Result<Arc<dyn CaptureSession>> {
        let capture = LoopbackCapture::for_module(&ModuleConfig::for_type(module), self.format);
        if self.offline.load(Ordering::Acquire) {
            capture.set_offline(true);
        }
        self.captures.lock().insert(module, Arc::clone(&capture));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(capture)
    }

    fn create_device(&self, id: DeviceId) -> Result<Arc<dyn CaptureDevice>> {
        let device = LoopbackDevice::new(id);
        self.devices.lock().insert(id, Arc::clone(&device));
        Ok(device)
    }

    fn default_device(&self) -> DeviceId {
        *self.default_device.lock()
    }

    fn capture_profile(&self, device: DeviceId) -> CaptureProfile {
        let low_power = self.low_power.load(Ordering::Acquire);
        CaptureProfile {
            name: if low_power { "lpi-mic" } else { "regular-mic" }.to_string(),
            device,
            format: self.format,
            low_power,
        }
    }
}
