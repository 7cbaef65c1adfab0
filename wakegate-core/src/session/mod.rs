//! Client-facing sound-trigger sessions.
//!
//! A [`SoundTriggerSession`] owns one client's sound model, its recognition
//! config, its capture device and the engines it is attached to. It is the
//! [`EngineClient`] those engines call back into.
//!
//! ## States
//!
//! ```text
//!            load                start
//!   Idle ─────────► Loaded ─────────────► Active ◄───────────────┐
//!    ▲                 ▲  ◄─── stop ───────┘ │                    │
//!    └──── unload ─────┘                     │ first-stage hit    │ start / reject
//!                      ▲                     ▼                    │
//!                      │           Detected or Buffering ─────────┘
//!                      └──── stop / deferred stop ──┘
//!
//!   any state ── subsystem restart ──► Ssr ── back online ──► restored state
//! ```
//!
//! ## Threading
//!
//! Every operation takes the session's core mutex. Engines call
//! [`EngineClient::state`], [`EngineClient::buffering_request`] and
//! [`EngineClient::model_id`] while holding their own lock, so those read
//! lock-free copies and never touch the core. Engines only call
//! `set_engine_detection_state` with their own lock released.
//!
//! Engines removed from a session are dropped after the core lock is
//! released: dropping joins their threads, which may be waiting on it.

pub mod config;
mod machine;
mod timer;

pub use config::{
    RecognitionConfig, SecondStageModel, SecondStageThreshold, SoundModel, DEFAULT_HIST_MS,
    DEFAULT_PRE_ROLL_MS, RECOGNITION_MODE_KEYPHRASE, RECOGNITION_MODE_USER_ID,
};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::audio::{CaptureDevice, CaptureProfile, DeviceId};
use crate::buffering::RingBufferReader;
use crate::config::ModuleType;
use crate::engine::first_stage::DetectionReport;
use crate::engine::{
    BufferingRequest, DetectionType, DiagnosticsSnapshot, EngineClient, FirstStageEngine,
    SecondStageEngine, SessionId,
};
use crate::error::{Result, WakegateError};
use crate::ipc::events::{RecognitionEvent, SessionStatusEvent};
use crate::platform::PlatformContext;

use timer::DeferredStop;

/// Capacity of the recognition and status broadcast channels.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Loaded,
    Active,
    /// First-stage (and any second-stage) detection delivered, no capture.
    Detected,
    /// Audio is buffered for verifiers or for the client to read.
    Buffering,
    /// The audio subsystem is down; calls only update the state to restore.
    Ssr,
}

impl SessionState {
    /// Engines are running on this session's behalf.
    pub fn is_recognizing(self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Detected | SessionState::Buffering
        )
    }
}

/// Engines a loaded session is attached to.
struct Engines {
    module: ModuleType,
    first_stage: Arc<FirstStageEngine>,
    verifiers: Vec<SecondStageEngine>,
    /// Client-side reader for post-keyword audio.
    reader: RingBufferReader,
}

struct Core {
    model: Option<SoundModel>,
    rec_config: Option<RecognitionConfig>,
    engines: Option<Engines>,
    /// Awaiting release once the core lock is dropped.
    retired: Vec<Engines>,

    device_id: Option<DeviceId>,
    device: Option<Arc<dyn CaptureDevice>>,
    device_open: bool,
    device_connected: bool,
    profile: Option<CaptureProfile>,

    /// Client asked for recognition and has not been notified since.
    started: bool,
    paused: bool,
    /// State to rebuild once the subsystem is back.
    ssr_restore: SessionState,

    /// Detection bits reported so far in this round.
    detection_state: u32,
    /// Bits that must all be present before the client is notified.
    notification_state: u32,
    rejection_notified: bool,
    pending_stop: bool,
    report: Option<DetectionReport>,
}

impl Core {
    fn new() -> Self {
        Self {
            model: None,
            rec_config: None,
            engines: None,
            retired: Vec::new(),
            device_id: None,
            device: None,
            device_open: false,
            device_connected: true,
            profile: None,
            started: false,
            paused: false,
            ssr_restore: SessionState::Idle,
            detection_state: 0,
            notification_state: 0,
            rejection_notified: false,
            pending_stop: false,
            report: None,
        }
    }

    fn client_capture(&self) -> bool {
        self.rec_config.as_ref().is_some_and(|c| c.capture_requested)
    }
}

pub(crate) struct SessionInner {
    id: SessionId,
    ctx: Arc<PlatformContext>,
    me: Weak<SessionInner>,
    state: RwLock<SessionState>,
    buffering: RwLock<BufferingRequest>,
    model_id: AtomicU32,
    core: Mutex<Core>,
    recognition_tx: broadcast::Sender<RecognitionEvent>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    seq: AtomicU64,
    timer: DeferredStop,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev == next {
            return;
        }
        info!(session = %self.id, from = ?prev, to = ?next, "session state changed");
        let _ = self.status_tx.send(SessionStatusEvent {
            session: self.id,
            from: prev,
            to: next,
        });
    }

    fn client(&self) -> Result<Arc<dyn EngineClient>> {
        let me: Arc<dyn EngineClient> = self
            .me
            .upgrade()
            .ok_or_else(|| WakegateError::invalid_state("client", "session dropped"))?;
        Ok(me)
    }

    /// Runs `op` under the core lock, then releases engines it retired.
    fn with_core<T>(&self, op: impl FnOnce(&SessionInner, &mut Core) -> Result<T>) -> Result<T> {
        let mut core = self.core.lock();
        let result = op(self, &mut core);
        let retired = std::mem::take(&mut core.retired);
        drop(core);

        let modules: Vec<ModuleType> = retired.iter().map(|e| e.module).collect();
        drop(retired);
        for module in modules {
            self.ctx.registry.release_if_unreferenced(module);
        }
        result
    }

    pub(crate) fn on_ssr_offline(&self) {
        if let Err(e) = self.with_core(|s, core| s.ssr_offline(core)) {
            tracing::warn!(session = %self.id, error = %e, "subsystem-down handling failed");
        }
    }

    pub(crate) fn on_ssr_online(&self) {
        if let Err(e) = self.with_core(|s, core| s.ssr_online(core)) {
            tracing::error!(session = %self.id, error = %e, "failed to restore session after subsystem restart");
        }
    }

    pub(crate) fn on_device_connected(&self, device: DeviceId) -> Result<()> {
        self.with_core(|s, core| s.device_connected(core, device))
    }

    pub(crate) fn on_device_disconnected(&self, device: DeviceId) -> Result<()> {
        self.with_core(|s, core| s.device_disconnected(core, device))
    }

    pub(crate) fn on_concurrent_stream(&self, active: bool) -> Result<()> {
        self.with_core(|s, core| s.concurrent_stream(core, active))
    }

    fn on_deferred_stop(&self) {
        if let Err(e) = self.with_core(|s, core| s.deferred_stop(core)) {
            tracing::warn!(session = %self.id, error = %e, "deferred stop failed");
        }
    }
}

impl EngineClient for SessionInner {
    fn id(&self) -> SessionId {
        self.id
    }

    fn model_id(&self) -> u32 {
        self.model_id.load(Ordering::Acquire)
    }

    fn state(&self) -> SessionState {
        SessionInner::state(self)
    }

    fn buffering_request(&self) -> BufferingRequest {
        *self.buffering.read()
    }

    fn set_engine_detection_state(&self, detection: DetectionType) -> Result<()> {
        self.with_core(|s, core| s.engine_detection(core, detection))
    }
}

/// One client's handle on the detection core.
///
/// Dropping the handle stops recognition and unloads the model.
pub struct SoundTriggerSession {
    inner: Arc<SessionInner>,
}

impl SoundTriggerSession {
    pub(crate) fn open(ctx: Arc<PlatformContext>) -> Result<Self> {
        let id = SessionId::next();
        let delay = Duration::from_millis(ctx.config.deferred_stop_delay_ms);
        let (recognition_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        let inner = Arc::new_cyclic(|me| SessionInner {
            id,
            ctx,
            me: me.clone(),
            state: RwLock::new(SessionState::Idle),
            buffering: RwLock::new(BufferingRequest::default()),
            model_id: AtomicU32::new(0),
            core: Mutex::new(Core::new()),
            recognition_tx,
            status_tx,
            seq: AtomicU64::new(0),
            timer: DeferredStop::new(delay),
        });

        let weak = Arc::downgrade(&inner);
        inner.timer.spawn(format!("wakegate-{id}-stop"), move || {
            if let Some(session) = weak.upgrade() {
                session.on_deferred_stop();
            }
        })?;

        debug!(session = %id, "session opened");
        Ok(Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn load_sound_model(&self, model: SoundModel) -> Result<()> {
        self.inner.with_core(|s, core| s.load(core, model))
    }

    pub fn unload_sound_model(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.unload(core))
    }

    pub fn send_recognition_config(&self, config: RecognitionConfig) -> Result<()> {
        self.inner.with_core(|s, core| s.send_config(core, config))
    }

    pub fn start_recognition(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.start(core))
    }

    pub fn stop_recognition(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.stop(core))
    }

    /// Reads post-keyword audio. Only valid while buffering for the client.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.with_core(|s, core| s.read(core, buf))
    }

    /// Client is done reading; engines stop after the deferred-stop delay
    /// unless recognition is restarted first.
    pub fn stop_buffering(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.stop_buffering(core))
    }

    /// Suspends recognition without forgetting that the client started it.
    pub fn pause(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.pause(core))
    }

    pub fn resume(&self) -> Result<()> {
        self.inner.with_core(|s, core| s.resume(core))
    }

    pub fn device_connected(&self, device: DeviceId) -> Result<()> {
        self.inner.on_device_connected(device)
    }

    pub fn device_disconnected(&self, device: DeviceId) -> Result<()> {
        self.inner.on_device_disconnected(device)
    }

    /// Re-evaluates the capture profile after another stream started or
    /// stopped on the shared input path.
    pub fn concurrent_stream(&self, active: bool) -> Result<()> {
        self.inner.on_concurrent_stream(active)
    }

    pub fn subscribe_recognition(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.inner.recognition_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Counters of the first-stage engine this session is attached to.
    pub fn first_stage_diagnostics(&self) -> Option<DiagnosticsSnapshot> {
        let core = self.inner.core.lock();
        core.engines
            .as_ref()
            .map(|e| e.first_stage.diagnostics_snapshot())
    }

    /// Capture profile the session was loaded against.
    pub fn capture_profile(&self) -> Option<CaptureProfile> {
        self.inner.core.lock().profile.clone()
    }
}

impl Drop for SoundTriggerSession {
    fn drop(&mut self) {
        if let Err(e) = self.inner.with_core(|s, core| s.close(core)) {
            tracing::warn!(session = %self.inner.id, error = %e, "session close failed");
        }
        debug!(session = %self.inner.id, "session closed");
    }
}

impl std::fmt::Debug for SoundTriggerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundTriggerSession")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}
