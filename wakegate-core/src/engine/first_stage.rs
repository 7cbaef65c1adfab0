//! DSP-resident first-stage keyword engine.
//!
//! One instance exists per module type and is shared by every session loaded
//! on that module. It owns:
//!
//! - the capture session and everything pushed through it (model, wakeup and
//!   buffering configuration, engine reset)
//! - the [`CompositeModel`] (merged mode) or the per-model registrations
//!   (multi-model mode)
//! - the [`RingBuffer`] the buffering loop writes into after a detection
//! - the event-processing thread
//!
//! ## Threading
//!
//! ```text
//!  capture callback ──► on_capture_event ──┐  (parse, reset buffer, route,
//!                                          │   state = Detected, notify)
//!                                          ▼
//!  processing thread ◄──── cv ──── Core { wake, detection, ... }
//!        │
//!        ├─ no capture ─► client.set_engine_detection_state ─► ENGINE_RESET
//!        └─ capture ────► start_buffering loop ─► ring buffer ─► readers
//! ```
//!
//! `core` is the state-transition lock. The processing thread holds it while
//! buffering and releases it around client calls and sleeps, so a stop or
//! restart can always get in. Client calls are never made with `core` held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use super::params::{
    encode_deregister, encode_model_wakeup, encode_register, wrap_param, BufferingConfig,
    ParamClass, WakeupConfig,
};
use super::{
    DetectionEngine, DetectionType, DiagnosticsSnapshot, EngineClient, EngineDiagnostics,
    EngineKind, EngineState, SessionId,
};
use crate::audio::{CaptureSession, MappedBuffer, CAPTURE_ENDPOINT};
use crate::buffering::format::AudioFormat;
use crate::buffering::{RingBuffer, RingBufferReader};
use crate::config::{ModuleConfig, ModuleType};
use crate::dispatch::{
    ftrt_bytes, keyword_window, parse_detection_payload, route_detection, DetectionEvent,
    KeywordWindow, EVENT_DETECTION, EVENT_END_OF_STREAM,
};
use crate::error::{recover_subsystem_restart, Result, WakegateError};
use crate::model::{enables_for, CompositeModel, ModelLibHandle, MAX_CONF_LEVEL};
use crate::session::SessionState;

/// Bounded wait for the end-of-stream marker after ENGINE_RESET.
const EOS_TIMEOUT: Duration = Duration::from_millis(100);

/// Polls of a stalled mapped write position before buffering gives up.
const MAX_MAPPED_POSITION_RETRIES: usize = 5;

/// Detection as seen by the session that owns it.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub event: DetectionEvent,
    /// `None` when the keyword indices were unusable.
    pub window: Option<KeywordWindow>,
    /// Confidence levels in the owning session's own slot layout.
    pub confidence_levels: Vec<u32>,
    pub detected_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct PendingDetection {
    event: DetectionEvent,
    window: Option<KeywordWindow>,
    owner: SessionId,
}

struct Attached {
    id: SessionId,
    client: Weak<dyn EngineClient>,
}

/// Per-model registration in multi-model mode.
#[derive(Debug, Clone)]
struct ModelSlot {
    session: SessionId,
    model_id: u32,
    conf_levels: Vec<u8>,
    mode: u32,
    buffering: BufferingConfig,
}

#[derive(Clone)]
struct MappedState {
    buffer: Arc<dyn MappedBuffer>,
    /// Frames already consumed when the current detection window opened.
    write_position: u64,
}

struct Core {
    clients: Vec<Attached>,
    composite: CompositeModel,
    models: Vec<ModelSlot>,
    /// Models whose wakeup config must be re-pushed on the next start.
    updated_models: Vec<u32>,
    recognition_mode: u32,
    buffering: BufferingConfig,
    capture_requested: bool,
    custom_payload: Option<Vec<u8>>,
    module_instance_ids: HashMap<u32, u32>,
    detection: Option<PendingDetection>,
    detection_time: Option<Instant>,
    wake: bool,
    mapped: Option<MappedState>,
}

impl Core {
    fn client(&self, id: SessionId) -> Option<Arc<dyn EngineClient>> {
        self.clients
            .iter()
            .find(|a| a.id == id)
            .and_then(|a| a.client.upgrade())
    }

    fn client_state(&self, id: SessionId) -> Option<SessionState> {
        self.client(id).map(|c| c.state())
    }

    fn is_attached(&self, id: SessionId) -> bool {
        self.clients.iter().any(|a| a.id == id)
    }

    fn attached_ids(&self) -> Vec<SessionId> {
        self.clients.iter().map(|a| a.id).collect()
    }

    fn others_attached(&self, id: SessionId) -> bool {
        self.clients.iter().any(|a| a.id != id)
    }

    fn others_active(&self, id: SessionId) -> bool {
        self.clients
            .iter()
            .filter(|a| a.id != id)
            .filter_map(|a| a.client.upgrade())
            .any(|c| c.state().is_recognizing())
    }

    fn first_active_other(&self, id: SessionId) -> Option<SessionId> {
        self.clients
            .iter()
            .filter(|a| a.id != id)
            .find(|a| {
                a.client
                    .upgrade()
                    .is_some_and(|c| c.state().is_recognizing())
            })
            .map(|a| a.id)
    }

    /// Sessions whose thresholds belong in the composite: every session
    /// still recognizing, including one mid-detection.
    fn active_ids(&self) -> Vec<SessionId> {
        self.clients
            .iter()
            .filter(|a| {
                a.client
                    .upgrade()
                    .is_some_and(|c| c.state().is_recognizing())
            })
            .map(|a| a.id)
            .collect()
    }

    fn slot(&self, model_id: u32) -> Option<&ModelSlot> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    fn slot_for_session_mut(&mut self, id: SessionId) -> Option<&mut ModelSlot> {
        self.models.iter_mut().find(|m| m.session == id)
    }

    fn model_id_of(&self, id: SessionId) -> Option<u32> {
        self.models
            .iter()
            .find(|m| m.session == id)
            .map(|m| m.model_id)
    }

    fn model_owners(&self) -> Vec<(u32, SessionId)> {
        self.models.iter().map(|m| (m.model_id, m.session)).collect()
    }

    /// Max history/pre-roll and any capture request over `include` plus every
    /// other session in `Active`, leaving out `exclude`.
    fn aggregate_buffering(
        &self,
        include: Option<SessionId>,
        exclude: Option<SessionId>,
    ) -> Option<(BufferingConfig, bool)> {
        let mut any = false;
        let mut buffering = BufferingConfig::default();
        let mut capture = false;
        for attached in &self.clients {
            if Some(attached.id) == exclude {
                continue;
            }
            let Some(client) = attached.client.upgrade() else {
                continue;
            };
            if Some(attached.id) != include && client.state() != SessionState::Active {
                continue;
            }
            let request = client.buffering_request();
            buffering.hist_ms = buffering.hist_ms.max(request.hist_ms);
            buffering.pre_roll_ms = buffering.pre_roll_ms.max(request.pre_roll_ms);
            capture |= request.capture_requested;
            any = true;
        }
        any.then_some((buffering, capture))
    }

    fn merged_wakeup(&self) -> WakeupConfig {
        let levels = self
            .composite
            .resident()
            .map(|m| m.conf_levels().to_vec())
            .unwrap_or_default();
        WakeupConfig {
            mode: self.recognition_mode as u16,
            custom_payload_size: 0,
            num_active_models: levels.len() as u8,
            enables: enables_for(&levels),
            conf_levels: levels,
        }
    }
}

struct Inner {
    module: ModuleConfig,
    format: AudioFormat,
    capture: Arc<dyn CaptureSession>,
    core: Mutex<Core>,
    cv: Condvar,
    state: Mutex<EngineState>,
    exit_buffering: AtomicBool,
    exit_thread: AtomicBool,
    buffer: Arc<RingBuffer>,
    eos: Mutex<bool>,
    eos_cv: Condvar,
    diagnostics: EngineDiagnostics,
    kw_transfer_latency_ms: AtomicU64,
}

/// Shared first-stage engine for one module type.
pub struct FirstStageEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FirstStageEngine {
    /// Creates the engine, registers for capture events and starts the
    /// processing thread.
    pub fn new(
        module: ModuleConfig,
        format: AudioFormat,
        capture: Arc<dyn CaptureSession>,
        model_lib: ModelLibHandle,
    ) -> Result<Self> {
        let capacity = format.ms_to_bytes(u64::from(module.ring_buffer_ms));
        let inner = Arc::new(Inner {
            format,
            capture: Arc::clone(&capture),
            core: Mutex::new(Core {
                clients: Vec::new(),
                composite: CompositeModel::new(model_lib),
                models: Vec::new(),
                updated_models: Vec::new(),
                recognition_mode: 0,
                buffering: BufferingConfig::default(),
                capture_requested: false,
                custom_payload: None,
                module_instance_ids: HashMap::new(),
                detection: None,
                detection_time: None,
                wake: false,
                mapped: None,
            }),
            cv: Condvar::new(),
            state: Mutex::new(EngineState::Idle),
            exit_buffering: AtomicBool::new(false),
            exit_thread: AtomicBool::new(false),
            buffer: Arc::new(RingBuffer::new(capacity)),
            eos: Mutex::new(false),
            eos_cv: Condvar::new(),
            diagnostics: EngineDiagnostics::default(),
            kw_transfer_latency_ms: AtomicU64::new(0),
            module,
        });

        let weak = Arc::downgrade(&inner);
        capture.register_event_callback(Arc::new(move |event_id: u32, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_capture_event(event_id, payload);
            }
        }));

        let thread_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("wakegate-{:?}-events", inner.module.module_type).to_lowercase())
            .spawn(move || thread_inner.run_processing())?;

        info!(
            module = ?inner.module.module_type,
            mode = ?inner.module.mode,
            ring_buffer_bytes = capacity,
            "first-stage engine created"
        );
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn module_type(&self) -> ModuleType {
        self.inner.module.module_type
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.format
    }

    pub fn buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.inner.buffer)
    }

    /// New disabled reader on the engine's ring buffer.
    pub fn new_reader(&self) -> RingBufferReader {
        self.inner.buffer.new_reader()
    }

    pub fn attached_count(&self) -> usize {
        self.inner.core.lock().clients.len()
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.inner.core.lock().is_attached(id)
    }

    /// Keyword transfer latency of the last buffered detection.
    pub fn kw_transfer_latency(&self) -> Duration {
        Duration::from_millis(self.inner.kw_transfer_latency_ms.load(Ordering::Relaxed))
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    pub fn reset_diagnostics(&self) {
        self.inner.diagnostics.reset();
    }

    /// Current composite confidence array (merged mode).
    pub fn composite_conf_levels(&self) -> Vec<u8> {
        self.inner
            .core
            .lock()
            .composite
            .resident()
            .map(|m| m.conf_levels().to_vec())
            .unwrap_or_default()
    }

    /// The pending detection, if `id` owns it.
    pub fn detection_report(&self, id: SessionId) -> Option<DetectionReport> {
        let core = self.inner.core.lock();
        let pending = core.detection.as_ref().filter(|d| d.owner == id)?;
        let confidence_levels = if self.inner.module.is_multi_model() || pending.event.is_multi_model() {
            pending.event.confidence_levels.clone()
        } else {
            core.composite
                .session_levels(id, &pending.event.confidence_levels)
        };
        Some(DetectionReport {
            event: pending.event.clone(),
            window: pending.window,
            confidence_levels,
            detected_at: core.detection_time,
        })
    }

    /// Stores `id`'s thresholds. Merged mode folds them into the composite
    /// array; they take effect there only while `id` is recognizing or alone.
    pub fn update_conf_levels(&self, id: SessionId, recognition_mode: u32, levels: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();

        if inner.module.custom_wakeup {
            debug!(session = %id, size = levels.len(), "custom wakeup payload stored");
            core.custom_payload = Some(levels.to_vec());
            return Ok(());
        }

        if inner.module.is_multi_model() {
            let active = inner.state().is_active();
            let slot = core
                .slot_for_session_mut(id)
                .ok_or_else(|| WakegateError::InvalidArgument(format!("no model registered for {id}")))?;
            slot.conf_levels = levels.to_vec();
            slot.mode = recognition_mode;
            let model_id = slot.model_id;
            if active && !core.updated_models.contains(&model_id) {
                core.updated_models.push(model_id);
            }
            debug!(session = %id, model_id, ?levels, "model confidence levels updated");
            return Ok(());
        }

        core.composite.set_session_conf_levels(id, levels)?;
        let apply = !core.others_attached(id)
            || core.client_state(id).is_some_and(SessionState::is_recognizing);
        core.composite.reconcile_conf_levels(id, apply)?;
        core.recognition_mode = if core.others_attached(id) {
            core.recognition_mode | recognition_mode
        } else {
            recognition_mode
        };
        debug!(session = %id, applied = apply, ?levels, "confidence levels updated");
        Ok(())
    }

    /// Records `id`'s history and pre-roll request; with several sessions the
    /// engine keeps the maximum.
    pub fn update_buf_config(&self, id: SessionId, hist_ms: u32, pre_roll_ms: u32) {
        let mut core = self.inner.core.lock();
        let requested = BufferingConfig { hist_ms, pre_roll_ms };
        if let Some(slot) = core.slot_for_session_mut(id) {
            slot.buffering = requested;
        }
        if core.others_attached(id) {
            core.buffering.hist_ms = core.buffering.hist_ms.max(hist_ms);
            core.buffering.pre_roll_ms = core.buffering.pre_roll_ms.max(pre_roll_ms);
        } else {
            core.buffering = requested;
        }
        debug!(
            session = %id,
            hist_ms = core.buffering.hist_ms,
            pre_roll_ms = core.buffering.pre_roll_ms,
            "buffering config updated"
        );
    }
}

impl DetectionEngine for FirstStageEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::FirstStage
    }

    fn load_sound_model(&self, client: &Arc<dyn EngineClient>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(WakegateError::InvalidModel("empty sound model".into()));
        }
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();
        let id = client.id();
        if core.is_attached(id) {
            return Err(WakegateError::invalid_state("load_sound_model", inner.state()));
        }

        let result = if core.others_attached(id) {
            inner.multi_stream_load(&mut core, client, data)
        } else {
            inner.first_load(&mut core, client, data)
        };
        if result.is_ok() {
            core.clients.push(Attached {
                id,
                client: Arc::downgrade(client),
            });
            info!(session = %id, attached = core.clients.len(), "sound model loaded");
        }
        result
    }

    fn unload_sound_model(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();
        if !core.is_attached(id) {
            debug!(session = %id, "unload for detached session ignored");
            return Ok(());
        }

        let result = if core.others_attached(id) {
            inner.multi_stream_unload(&mut core, id)
        } else {
            if let Err(e) = inner.capture.close() {
                error!(error = %e, "failed to close capture session");
            }
            core.mapped = None;
            if let Err(e) = core.composite.delete_model(id) {
                error!(error = %e, "failed to delete model from composite");
            }
            core.models.clear();
            core.updated_models.clear();
            core.custom_payload = None;
            core.detection = None;
            core.clients.retain(|a| a.id != id);
            inner.set_state(EngineState::Idle);
            Ok(())
        };
        if result.is_ok() {
            info!(session = %id, attached = core.clients.len(), "sound model unloaded");
        }
        recover_subsystem_restart(result)
    }

    fn start_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();
        if !core.is_attached(id) {
            return Err(WakegateError::invalid_state("start_recognition", "session not attached"));
        }

        if inner.state().is_active() {
            if let Err(e) = inner.stop_l(&mut core) {
                warn!(error = %e, "stop before start failed");
            }
        }
        if let Some((buffering, capture)) = core.aggregate_buffering(Some(id), None) {
            core.buffering = buffering;
            core.capture_requested = capture;
        }
        if !inner.module.is_multi_model() && !inner.module.custom_wakeup {
            core.composite.reconcile_conf_levels(id, true)?;
        }

        let result = inner.start_l(&mut core, id);
        if let Err(e) = &result {
            error!(session = %id, error = %e, "failed to start recognition");
        }
        result
    }

    fn stop_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();

        if !inner.state().is_active() {
            debug!(session = %id, "engine not active, nothing to stop");
            return Ok(());
        }
        let result = inner.stop_and_resume_others(&mut core, id);
        recover_subsystem_restart(result)
    }

    fn restart_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        inner.exit_buffering.store(true, Ordering::Release);
        let mut core = inner.core.lock();
        let result = inner.restart_l(&mut core, id);
        recover_subsystem_restart(result)
    }
}

impl Drop for FirstStageEngine {
    fn drop(&mut self) {
        self.inner.exit_buffering.store(true, Ordering::Release);
        self.inner.exit_thread.store(true, Ordering::Release);
        {
            let _core = self.inner.core.lock();
            self.inner.cv.notify_one();
        }
        if let Some(worker) = self.worker.lock().take() {
            // Dropped from inside a client notification.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("first-stage processing thread panicked");
            }
        }
        debug!(module = ?self.inner.module.module_type, "first-stage engine dropped");
    }
}

impl std::fmt::Debug for FirstStageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstStageEngine")
            .field("module", &self.inner.module.module_type)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock();
        if *state != next {
            info!(module = ?self.module.module_type, from = ?*state, to = ?next, "engine state");
            *state = next;
        }
    }

    /// Pushes one parameter, resolving and caching the module instance id.
    fn push_param(&self, core: &mut Core, class: ParamClass, data: &[u8]) -> Result<()> {
        let ids = class.ids(&self.module);
        if !ids.is_supported() {
            debug!(?class, "parameter not supported by module, skipped");
            return Ok(());
        }
        let miid = match core.module_instance_ids.get(&ids.tag_id) {
            Some(miid) => *miid,
            None => {
                let miid = self.capture.module_instance_id(ids.tag_id)?;
                core.module_instance_ids.insert(ids.tag_id, miid);
                miid
            }
        };
        let payload = wrap_param(miid, ids.param_id, data);
        trace!(?class, miid, size = payload.len(), "pushing parameter");
        self.capture.set_parameter(ids.tag_id, ids.param_id, &payload)
    }

    fn push_resident_model(&self, core: &mut Core) -> Result<()> {
        let data = core
            .composite
            .resident()
            .map(|m| m.data().to_vec())
            .ok_or_else(|| WakegateError::invalid_state("load", "no resident model"))?;
        self.push_param(core, ParamClass::LoadSoundModel, &data)
    }

    fn open_session(&self) -> Result<()> {
        self.capture.open().map_err(|e| match e {
            WakegateError::SubsystemRestart => e,
            other => WakegateError::SessionOpenFailed(other.to_string()),
        })
    }

    fn first_load(&self, core: &mut Core, client: &Arc<dyn EngineClient>, data: &[u8]) -> Result<()> {
        let id = client.id();
        self.open_session()?;

        let pushed = if self.module.is_multi_model() {
            let model_id = client.model_id();
            core.models.push(ModelSlot {
                session: id,
                model_id,
                conf_levels: Vec::new(),
                mode: 0,
                buffering: BufferingConfig::default(),
            });
            self.push_param(core, ParamClass::LoadSoundModel, &encode_register(model_id, data))
        } else {
            match core.composite.add_model(id, data) {
                Ok(()) => self.push_resident_model(core),
                Err(e) => Err(e),
            }
        };

        if let Err(e) = pushed {
            error!(session = %id, error = %e, "failed to load sound model");
            if let Err(close) = self.capture.close() {
                warn!(error = %close, "failed to close capture session");
            }
            core.models.retain(|m| m.session != id);
            if core.composite.contains(id) {
                let _ = core.composite.delete_model(id);
            }
            return Err(e);
        }
        self.set_state(EngineState::Loaded);
        Ok(())
    }

    /// Adds a model while other sessions are attached. The merge runs first so
    /// a failed merge leaves the loaded composite untouched.
    fn multi_stream_load(&self, core: &mut Core, client: &Arc<dyn EngineClient>, data: &[u8]) -> Result<()> {
        let id = client.id();
        let restore = self.state().is_active();
        let resume_with = core.attached_ids().first().copied();
        if restore {
            self.stop_l(core)?;
        }

        let loaded = if self.module.is_multi_model() {
            let model_id = client.model_id();
            if core.slot(model_id).is_some() {
                return Err(WakegateError::InvalidArgument(format!(
                    "model id {model_id} already registered"
                )));
            }
            core.models.push(ModelSlot {
                session: id,
                model_id,
                conf_levels: Vec::new(),
                mode: 0,
                buffering: BufferingConfig::default(),
            });
            let pushed = self.push_param(core, ParamClass::LoadSoundModel, &encode_register(model_id, data));
            if pushed.is_err() {
                core.models.retain(|m| m.session != id);
            }
            pushed
        } else {
            if let Err(e) = core.composite.add_model(id, data) {
                error!(session = %id, error = %e, "merge failed, keeping previous composite");
                if restore {
                    if let Some(resume) = resume_with {
                        self.start_l(core, resume)?;
                    }
                }
                return Err(e);
            }
            self.reload_composite(core)
        };

        if let Err(e) = loaded {
            error!(session = %id, error = %e, "failed to load merged sound model");
            return Err(e);
        }
        self.set_state(EngineState::Loaded);

        if restore {
            if let Some(resume) = resume_with {
                self.start_l(core, resume)?;
            }
        }
        Ok(())
    }

    /// Closes the session, re-applies active thresholds to the new resident
    /// model, and loads it into a freshly opened session.
    fn reload_composite(&self, core: &mut Core) -> Result<()> {
        if let Err(e) = self.capture.close() {
            warn!(error = %e, "failed to close capture session");
        }
        core.mapped = None;
        self.set_state(EngineState::Idle);

        let active = core.active_ids();
        core.composite.apply_active_conf_levels(&active)?;

        self.open_session()?;
        if let Err(e) = self.push_resident_model(core) {
            if let Err(close) = self.capture.close() {
                warn!(error = %close, "failed to close capture session");
            }
            return Err(e);
        }
        Ok(())
    }

    fn multi_stream_unload(&self, core: &mut Core, id: SessionId) -> Result<()> {
        let restore = self.state().is_active();
        if restore {
            self.stop_l(core)?;
        }

        if self.module.is_multi_model() {
            if let Some(model_id) = core.model_id_of(id) {
                if let Err(e) = self.push_param(core, ParamClass::UnloadSoundModel, &encode_deregister(model_id)) {
                    error!(model_id, error = %e, "failed to deregister model");
                }
                core.updated_models.retain(|m| *m != model_id);
            }
            core.models.retain(|m| m.session != id);
        } else {
            if let Err(e) = core.composite.delete_model(id) {
                error!(session = %id, error = %e, "demerge failed, keeping previous composite");
                if restore {
                    if let Some(resume) = core.first_active_other(id) {
                        self.start_l(core, resume)?;
                    }
                }
                return Err(e);
            }
            core.clients.retain(|a| a.id != id);
            self.reload_composite(core)?;
            self.set_state(EngineState::Loaded);
        }
        core.clients.retain(|a| a.id != id);
        if core.detection.as_ref().is_some_and(|d| d.owner == id) {
            core.detection = None;
        }

        if restore {
            if let Some(resume) = core.first_active_other(id) {
                self.start_l(core, resume)?;
            }
        }
        Ok(())
    }

    /// Stops the engine for `id`; if other sessions still recognize, their
    /// configuration is re-derived and the engine restarted for them.
    fn stop_and_resume_others(&self, core: &mut Core, id: SessionId) -> Result<()> {
        self.stop_l(core)?;
        let Some(next) = core.first_active_other(id) else {
            return Ok(());
        };
        info!(session = %id, "other sessions still active, restarting engine");
        self.update_engine_config_on_stop(core, id)?;
        if self.module.is_multi_model() {
            if let Some(slot) = core.slot_for_session_mut(id) {
                slot.conf_levels.fill(MAX_CONF_LEVEL);
                let model_id = slot.model_id;
                if !core.updated_models.contains(&model_id) {
                    core.updated_models.push(model_id);
                }
            }
        }
        self.start_l(core, next)
    }

    fn push_configs(&self, core: &mut Core, id: SessionId) -> Result<()> {
        if self.module.is_multi_model() {
            let mut models = std::mem::take(&mut core.updated_models);
            if let Some(own) = core.model_id_of(id) {
                if !models.contains(&own) {
                    models.push(own);
                }
            }
            for model_id in models {
                let Some(slot) = core.slot(model_id).cloned() else {
                    continue;
                };
                let wakeup = encode_model_wakeup(model_id, slot.mode, &slot.conf_levels);
                self.push_param(core, ParamClass::WakeupConfig, &wakeup)?;
                let buffering = slot.buffering.encode(Some(model_id));
                self.push_param(core, ParamClass::BufferingConfig, &buffering)?;
            }
            return Ok(());
        }

        if !self.module.custom_wakeup {
            let wakeup = core.merged_wakeup().encode();
            self.push_param(core, ParamClass::WakeupConfig, &wakeup)?;
        } else if self.module.custom_config.is_supported() {
            if let Some(payload) = core.custom_payload.take() {
                self.push_param(core, ParamClass::CustomConfig, &payload)?;
            }
        }
        let buffering = core.buffering.encode(None);
        self.push_param(core, ParamClass::BufferingConfig, &buffering)
    }

    fn start_l(&self, core: &mut Core, id: SessionId) -> Result<()> {
        core.detection = None;
        self.push_configs(core, id)?;

        let start_failed = |e: WakegateError| match e {
            WakegateError::SubsystemRestart => e,
            other => WakegateError::SessionStartFailed(other.to_string()),
        };
        self.capture.prepare().map_err(start_failed)?;

        if self.module.mapped_buffer_ms != 0 && core.mapped.is_none() {
            let bytes = self.format.ms_to_bytes(u64::from(self.module.mapped_buffer_ms));
            let frames = (bytes / self.format.frame_bytes().max(1)) as u32;
            let buffer = self.capture.create_mapped_buffer(frames).map_err(start_failed)?;
            debug!(size = buffer.size_bytes(), "mapped buffer created");
            core.mapped = Some(MappedState {
                buffer,
                write_position: 0,
            });
        }

        self.capture.start().map_err(start_failed)?;

        if let Some(mapped) = core.mapped.as_mut() {
            mapped.write_position = self.capture.mapped_write_position()?;
        }
        self.exit_buffering.store(false, Ordering::Release);
        self.set_state(EngineState::Active);
        Ok(())
    }

    /// Engine reset closes the DSP detection gate; a plain stop only flushes.
    fn stop_l(&self, core: &mut Core) -> Result<()> {
        self.buffer.reset();
        if let Err(e) = self.push_param(core, ParamClass::EngineReset, &[]) {
            warn!(error = %e, "failed to reset detection engine");
        }
        let stopped = self.capture.stop();
        if let Err(e) = &stopped {
            error!(error = %e, "failed to stop capture session");
        }
        self.set_state(EngineState::Loaded);
        stopped
    }

    fn restart_l(&self, core: &mut Core, id: SessionId) -> Result<()> {
        if !self.state().is_active() {
            info!(session = %id, "engine not active, restart skipped");
            return Ok(());
        }
        self.update_engine_config_on_restart(core, id)?;
        self.buffer.reset();
        core.detection = None;

        *self.eos.lock() = false;
        if let Err(e) = self.push_param(core, ParamClass::EngineReset, &[]) {
            warn!(error = %e, "failed to reset detection engine");
        }
        let deadline = Instant::now() + EOS_TIMEOUT;
        {
            let mut eos = self.eos.lock();
            while !*eos {
                if self.eos_cv.wait_until(&mut eos, deadline).timed_out() {
                    debug!("no end-of-stream marker after engine reset");
                    break;
                }
            }
        }

        if let Some(mapped) = core.mapped.as_mut() {
            match self.capture.mapped_write_position() {
                Ok(position) => mapped.write_position = position,
                Err(e) => warn!(error = %e, "failed to read mapped write position"),
            }
        }

        self.exit_buffering.store(false, Ordering::Release);
        self.set_state(EngineState::Active);
        self.diagnostics.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Re-derives buffering from the sessions that stay active and disables
    /// the stopping session's thresholds in the composite.
    fn update_engine_config_on_stop(&self, core: &mut Core, id: SessionId) -> Result<()> {
        if !core.others_attached(id) {
            return Ok(());
        }
        let others: Vec<SessionId> = core.active_ids().into_iter().filter(|s| *s != id).collect();
        match others.first() {
            None => {
                debug!("no other session active, buffering config cleared");
                core.buffering = BufferingConfig::default();
                core.capture_requested = false;
                return Ok(());
            }
            Some(first) => {
                if let Some((buffering, capture)) = core.aggregate_buffering(Some(*first), Some(id)) {
                    core.buffering = buffering;
                    core.capture_requested = capture;
                }
            }
        }
        if !self.module.is_multi_model() && !self.module.custom_wakeup {
            core.composite.reconcile_conf_levels(id, false)?;
        }
        Ok(())
    }

    /// A restart on behalf of a session that has since stopped keeps that
    /// session's slots disabled and its buffering request out.
    fn update_engine_config_on_restart(&self, core: &mut Core, id: SessionId) -> Result<()> {
        let recognizing = core.client_state(id).is_some_and(SessionState::is_recognizing);
        let aggregate = if recognizing {
            core.aggregate_buffering(Some(id), None)
        } else {
            core.aggregate_buffering(None, Some(id))
        };
        if let Some((buffering, capture)) = aggregate {
            core.buffering = buffering;
            core.capture_requested = capture;
        }
        if !self.module.is_multi_model() && !self.module.custom_wakeup && core.composite.contains(id) {
            let apply = recognizing || !core.others_attached(id);
            core.composite.reconcile_conf_levels(id, apply)?;
        }
        Ok(())
    }

    fn on_capture_event(&self, event_id: u32, payload: &[u8]) {
        match event_id {
            EVENT_END_OF_STREAM => {
                let mut eos = self.eos.lock();
                *eos = true;
                self.eos_cv.notify_all();
                return;
            }
            EVENT_DETECTION => {}
            other => {
                debug!(event_id = other, "capture event ignored");
                return;
            }
        }
        self.diagnostics.callbacks.fetch_add(1, Ordering::Relaxed);
        if payload.is_empty() {
            warn!("empty detection payload");
            return;
        }

        // A co-resident model can still fire while another detection is
        // being buffered; those events never wait on the core lock.
        if !matches!(self.state(), EngineState::Active | EngineState::Loaded) {
            self.diagnostics.ignored_callbacks.fetch_add(1, Ordering::Relaxed);
            debug!(state = ?self.state(), "detection while engine busy, ignored");
            return;
        }

        let mut core = self.core.lock();
        match self.state() {
            EngineState::Active => {
                core.detection_time = Some(Instant::now());
                self.handle_detection(&mut core, payload);
            }
            EngineState::Loaded => {
                self.diagnostics.ignored_callbacks.fetch_add(1, Ordering::Relaxed);
                debug!("detection during stop, resetting engine");
                if let Err(e) = self.push_param(&mut core, ParamClass::EngineReset, &[]) {
                    warn!(error = %e, "failed to reset detection engine");
                }
            }
            state => {
                self.diagnostics.ignored_callbacks.fetch_add(1, Ordering::Relaxed);
                debug!(?state, "detection raced a state change, ignored");
            }
        }
    }

    fn handle_detection(&self, core: &mut Core, payload: &[u8]) {
        // Keyword indices recorded below are relative to a clean buffer.
        self.buffer.reset();

        let event = match parse_detection_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                self.diagnostics.parse_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "failed to parse detection payload");
                return;
            }
        };
        let routed = {
            let view: &Core = core;
            let attached = view.attached_ids();
            let owners = view.model_owners();
            route_detection(&event, &attached, &view.composite, &owners, |id| {
                view.client_state(id) == Some(SessionState::Active)
            })
        };
        let route = match routed {
            Ok(Some(route)) => route,
            Ok(None) => {
                self.diagnostics.ignored_callbacks.fetch_add(1, Ordering::Relaxed);
                debug!(levels = ?event.confidence_levels, "no active session owns detection");
                if let Err(e) = self.push_param(core, ParamClass::EngineReset, &[]) {
                    warn!(error = %e, "failed to reset detection engine");
                }
                return;
            }
            Err(e) => {
                self.diagnostics.parse_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "detection could not be routed");
                if let Err(e) = self.push_param(core, ParamClass::EngineReset, &[]) {
                    warn!(error = %e, "failed to reset detection engine");
                }
                return;
            }
        };
        let owner = route.owner;
        let event = match route.model {
            Some(model) => event.for_model(&model),
            None => event,
        };

        let window = match keyword_window(&event, &self.format) {
            Ok(window) => Some(window),
            Err(e) => {
                warn!(error = %e, "detection has no usable keyword window");
                None
            }
        };
        let (start, end) = window.map_or((0, 0), |w| (w.start, w.end));
        self.buffer.update_indices(start, end);

        info!(
            session = %owner,
            model_id = route.model.map(|m| m.model_id),
            levels = ?event.confidence_levels,
            kw_start = start,
            kw_end = end,
            "keyword detected, signalling processing thread"
        );
        core.detection = Some(PendingDetection { event, window, owner });
        core.wake = true;
        self.diagnostics.detections.fetch_add(1, Ordering::Relaxed);
        self.set_state(EngineState::Detected);
        self.cv.notify_one();
    }

    fn run_processing(&self) {
        debug!(module = ?self.module.module_type, "processing thread started");
        let mut core = self.core.lock();
        loop {
            while !core.wake && !self.exit_thread.load(Ordering::Acquire) {
                self.cv.wait(&mut core);
            }
            if self.exit_thread.load(Ordering::Acquire) {
                break;
            }
            core.wake = false;

            if self.state() != EngineState::Detected {
                debug!("engine stopped or restarted after detection");
                continue;
            }
            let Some(pending) = core.detection.clone() else {
                continue;
            };
            let owner = pending.owner;
            let Some(client) = core.client(owner) else {
                debug!(session = %owner, "detected session is gone");
                continue;
            };

            if core.capture_requested {
                if let Err(e) = self.start_buffering(&mut core, &client, &pending) {
                    warn!(session = %owner, error = %e, "buffering failed, restarting recognition");
                    if let Err(e) = self.restart_l(&mut core, owner) {
                        error!(error = %e, "restart after buffering failure failed");
                    }
                }
            } else {
                let notified = MutexGuard::unlocked(&mut core, || {
                    client.set_engine_detection_state(DetectionType::FirstStage)
                });
                match notified {
                    Ok(()) => {
                        self.diagnostics.notifications.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.push_param(&mut core, ParamClass::EngineReset, &[]) {
                            warn!(error = %e, "failed to reset detection engine");
                        }
                    }
                    Err(e) => {
                        warn!(session = %owner, error = %e, "session refused detection");
                        if let Err(e) = self.restart_l(&mut core, owner) {
                            error!(error = %e, "restart after refused detection failed");
                        }
                    }
                }
            }

            if matches!(self.state(), EngineState::Detected | EngineState::Buffering)
                && core.others_active(owner)
            {
                self.set_state(EngineState::Active);
            }
        }
        debug!(module = ?self.module.module_type, "processing thread exiting");
    }

    /// Streams captured audio into the ring buffer after a detection. The
    /// session is notified once the FTRT backlog is buffered; streaming then
    /// continues until a stop, restart or state change.
    fn start_buffering(
        &self,
        core: &mut MutexGuard<'_, Core>,
        client: &Arc<dyn EngineClient>,
        pending: &PendingDetection,
    ) -> Result<()> {
        self.set_state(EngineState::Buffering);
        let owner = pending.owner;

        let chunk = match self.capture.buffer_size() {
            0 => self.format.ms_to_bytes(u64::from(self.module.read_chunk_ms)),
            n => n,
        };
        let sleep = Duration::from_millis(self.format.bytes_to_ms(chunk).max(1));
        let ftrt = ftrt_bytes(&pending.event, &self.format);

        let mut bytes_to_drop = 0usize;
        if self.module.is_multi_model() {
            if let Some(slot) = core.model_id_of(owner).and_then(|m| core.slot(m)) {
                let extra = core.buffering.pre_roll_ms.saturating_sub(slot.buffering.pre_roll_ms);
                bytes_to_drop = self.format.ms_to_bytes(u64::from(extra));
            }
        }

        let mapped = core.mapped.clone();
        let mut mapped_offset = mapped.as_ref().map_or(0, |m| {
            let size = m.buffer.size_bytes().max(1);
            self.format.frames_to_bytes(m.write_position) % size
        });

        let mut buf = vec![0u8; chunk];
        let mut total = 0usize;
        let mut notified = false;
        let mut retries = 0usize;
        let begin = Instant::now();
        debug!(session = %owner, ftrt, chunk, "buffering started");

        while !self.exit_buffering.load(Ordering::Acquire) {
            // A restart may have completed while the lock was released.
            if self.state() != EngineState::Buffering {
                debug!("engine stopped or restarted, buffering ends");
                break;
            }

            let mut n = 0usize;
            if let Some(mapped) = mapped.as_ref() {
                let size = mapped.buffer.size_bytes();
                let position = self.capture.mapped_write_position()?;
                if position < mapped.write_position {
                    return Err(WakegateError::Capture(format!(
                        "mapped write position {position} behind window start {}",
                        mapped.write_position
                    )));
                }
                let written = self.format.frames_to_bytes(position - mapped.write_position);
                if written <= total {
                    retries += 1;
                    if retries > MAX_MAPPED_POSITION_RETRIES {
                        return Err(WakegateError::Capture("mapped write position stalled".into()));
                    }
                    MutexGuard::unlocked(core, || thread::sleep(sleep));
                    continue;
                }
                retries = 0;
                let to_read = written - total;
                if to_read > size {
                    return Err(WakegateError::Capture(format!(
                        "{to_read} bytes pending exceed mapped buffer of {size}"
                    )));
                }
                buf.resize(to_read, 0);
                let first = to_read.min(size - mapped_offset);
                mapped.buffer.copy_out(mapped_offset, &mut buf[..first]);
                if first < to_read {
                    mapped.buffer.copy_out(0, &mut buf[first..to_read]);
                }
                mapped_offset = (mapped_offset + to_read) % size;
                n = to_read;
                total += n;
            } else if self.buffer.free_size() >= chunk {
                // Land exactly on the FTRT boundary.
                let want = if total < ftrt && ftrt - total < chunk {
                    ftrt - total
                } else {
                    chunk
                };
                n = self.capture.read(CAPTURE_ENDPOINT, &mut buf[..want])?;
                total += n;
            }

            if n > 0 {
                let mut data = &buf[..n];
                if bytes_to_drop > 0 {
                    let dropped = bytes_to_drop.min(n);
                    bytes_to_drop -= dropped;
                    data = &data[dropped..];
                }
                if !data.is_empty() {
                    let written = self.buffer.write(data);
                    if written < data.len() {
                        trace!(requested = data.len(), written, "ring buffer full");
                    }
                    self.diagnostics
                        .bytes_buffered
                        .fetch_add(written, Ordering::Relaxed);
                }
            }

            if total >= ftrt {
                if !notified {
                    let latency = begin.elapsed();
                    self.kw_transfer_latency_ms
                        .store(latency.as_millis() as u64, Ordering::Relaxed);
                    let since_detection = core.detection_time.map(|t| t.elapsed());
                    info!(
                        session = %owner,
                        total,
                        ftrt,
                        kw_transfer_ms = latency.as_millis() as u64,
                        processing_ms = since_detection.map(|d| d.as_millis() as u64),
                        "FTRT data buffered"
                    );
                    let result = MutexGuard::unlocked(core, || {
                        client.set_engine_detection_state(DetectionType::FirstStage)
                    });
                    if let Err(e) = result {
                        warn!(session = %owner, error = %e, "session refused detection");
                        return Err(e);
                    }
                    self.diagnostics.notifications.fetch_add(1, Ordering::Relaxed);
                    notified = true;
                }
                MutexGuard::unlocked(core, || thread::sleep(sleep));
            } else if n == 0 {
                MutexGuard::unlocked(core, || thread::sleep(sleep));
            }
        }
        debug!(session = %owner, total, "buffering stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DetectionPayloadWriter, ModelDetection};
    use crate::engine::BufferingRequest;
    use crate::engine::params::unwrap_param;
    use crate::sim::{JsonModelLib, LoopbackCapture};
    use parking_lot::RwLock;

    struct FakeClient {
        id: SessionId,
        state: RwLock<SessionState>,
        request: BufferingRequest,
        detections: Mutex<Vec<DetectionType>>,
        /// Runs once, inside the next notification, before it is judged.
        on_detection: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FakeClient {
        fn new(id: u64, capture: bool) -> Arc<Self> {
            Arc::new(Self {
                id: SessionId(id),
                state: RwLock::new(SessionState::Loaded),
                request: BufferingRequest {
                    hist_ms: 1_000,
                    pre_roll_ms: 200,
                    capture_requested: capture,
                },
                detections: Mutex::new(Vec::new()),
                on_detection: Mutex::new(None),
            })
        }

        fn set_state(&self, state: SessionState) {
            *self.state.write() = state;
        }
    }

    impl EngineClient for FakeClient {
        fn id(&self) -> SessionId {
            self.id
        }

        fn model_id(&self) -> u32 {
            self.id.0 as u32
        }

        fn state(&self) -> SessionState {
            *self.state.read()
        }

        fn buffering_request(&self) -> BufferingRequest {
            self.request
        }

        fn set_engine_detection_state(&self, detection: DetectionType) -> Result<()> {
            let hook = self.on_detection.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            if self.state() != SessionState::Active {
                return Err(WakegateError::invalid_state("detection", self.state()));
            }
            self.detections.lock().push(detection);
            self.set_state(SessionState::Detected);
            Ok(())
        }
    }

    fn engine(capture: &Arc<LoopbackCapture>, module: ModuleConfig) -> FirstStageEngine {
        FirstStageEngine::new(
            module,
            AudioFormat::default(),
            capture.clone(),
            ModelLibHandle::new(JsonModelLib),
        )
        .unwrap()
    }

    fn dyn_client(c: &Arc<FakeClient>) -> Arc<dyn EngineClient> {
        c.clone()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn detection(levels: &[u32]) -> Vec<u8> {
        DetectionPayloadWriter::new()
            .confidence_levels(levels)
            .keyword_position(1_000_000, 1_300_000)
            .timestamp(1_500_000)
            .ftrt(1_000_000)
            .build(0)
    }

    #[test]
    fn load_start_stop_cycle_pushes_params() {
        let capture = LoopbackCapture::new();
        let module = ModuleConfig::default();
        let engine = engine(&capture, module.clone());
        let client = FakeClient::new(1, false);
        let model = JsonModelLib::encode(&["word"], &[], &[]);

        engine.load_sound_model(&dyn_client(&client), &model).unwrap();
        assert_eq!(engine.state(), EngineState::Loaded);
        engine.update_conf_levels(client.id, 1, &[50]).unwrap();
        engine.start_recognition(client.id).unwrap();
        assert_eq!(engine.state(), EngineState::Active);

        let params = capture.params();
        let load = params
            .iter()
            .find(|p| p.param_id == module.load_sound_model.param_id)
            .unwrap();
        let (_, _, data) = unwrap_param(&load.payload).unwrap();
        assert_eq!(data, &model[..]);
        let wakeup = capture.last_param(module.wakeup_config.param_id).unwrap();
        let (_, _, data) = unwrap_param(&wakeup).unwrap();
        assert_eq!(data, &[1, 0, 0, 0, 1, 0, 50, 1]);

        engine.stop_recognition(client.id).unwrap();
        assert_eq!(engine.state(), EngineState::Loaded);
        assert!(capture.last_param(module.engine_reset.param_id).is_some());
        engine.unload_sound_model(client.id).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.attached_count(), 0);
    }

    #[test]
    fn detection_without_capture_notifies_and_resets() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, false);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        engine.update_conf_levels(client.id, 1, &[50]).unwrap();
        engine.start_recognition(client.id).unwrap();
        client.set_state(SessionState::Active);

        capture.inject_detection(&detection(&[80]));
        wait_until(|| !client.detections.lock().is_empty());
        assert_eq!(client.detections.lock()[0], DetectionType::FirstStage);

        let report = engine.detection_report(client.id).unwrap();
        assert_eq!(report.confidence_levels, vec![80]);
        let window = report.window.unwrap();
        assert_eq!((window.start, window.end), (16_000, 25_600));
        assert_eq!(engine.diagnostics_snapshot().detections, 1);
    }

    #[test]
    fn capture_requested_buffers_ftrt_before_notifying() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, true);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        engine.start_recognition(client.id).unwrap();
        client.set_state(SessionState::Active);
        let reader = engine.new_reader();

        capture.inject_detection(&detection(&[80]));
        wait_until(|| !client.detections.lock().is_empty());
        assert!(reader.unread_size() >= 32_000);
        assert_eq!(engine.buffer().indices(), (16_000, 25_600));

        engine.restart_recognition(client.id).unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        assert_eq!(engine.diagnostics_snapshot().restarts, 1);
    }

    #[test]
    fn detection_while_loaded_is_ignored() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, false);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        capture.inject_detection(&detection(&[80]));
        thread::sleep(Duration::from_millis(20));
        assert!(client.detections.lock().is_empty());
        assert_eq!(engine.diagnostics_snapshot().ignored_callbacks, 1);
    }

    #[test]
    fn malformed_payload_is_counted_and_dropped() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, false);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        engine.start_recognition(client.id).unwrap();
        client.set_state(SessionState::Active);

        capture.inject_detection(&[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(engine.diagnostics_snapshot().parse_failures, 1);
        assert_eq!(engine.state(), EngineState::Active);
    }

    #[test]
    fn second_session_merges_and_stop_disables_its_slots() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let a = FakeClient::new(1, false);
        let b = FakeClient::new(2, false);
        engine
            .load_sound_model(&dyn_client(&a), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        engine.update_conf_levels(a.id, 1, &[60]).unwrap();
        engine.start_recognition(a.id).unwrap();
        a.set_state(SessionState::Active);

        engine
            .load_sound_model(&dyn_client(&b), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        assert_eq!(engine.composite_conf_levels(), vec![60, 100]);

        engine.update_conf_levels(b.id, 1, &[70]).unwrap();
        engine.start_recognition(b.id).unwrap();
        b.set_state(SessionState::Active);
        assert_eq!(engine.composite_conf_levels(), vec![60, 70]);

        b.set_state(SessionState::Loaded);
        engine.stop_recognition(b.id).unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        assert_eq!(engine.composite_conf_levels(), vec![60, 100]);

        engine.unload_sound_model(b.id).unwrap();
        assert_eq!(engine.attached_count(), 1);
        assert_eq!(engine.composite_conf_levels(), vec![60]);
        assert_eq!(engine.state(), EngineState::Active);
    }

    #[test]
    fn multi_model_registers_each_model() {
        let capture = LoopbackCapture::new();
        let module = ModuleConfig::for_type(ModuleType::Pdk);
        let engine = engine(&capture, module.clone());
        let a = FakeClient::new(7, false);
        let b = FakeClient::new(9, false);
        engine.load_sound_model(&dyn_client(&a), b"model-a").unwrap();
        engine.load_sound_model(&dyn_client(&b), b"model-b").unwrap();

        let loads: Vec<_> = capture
            .params()
            .into_iter()
            .filter(|p| p.param_id == module.load_sound_model.param_id)
            .collect();
        assert_eq!(loads.len(), 2);
        let (_, _, data) = unwrap_param(&loads[1].payload).unwrap();
        assert_eq!(&data[..4], &9u32.to_le_bytes());

        engine.update_conf_levels(b.id, 1, &[40]).unwrap();
        engine.start_recognition(b.id).unwrap();
        let wakeup = capture.last_param(module.wakeup_config.param_id).unwrap();
        let (_, _, data) = unwrap_param(&wakeup).unwrap();
        assert_eq!(&data[..4], &9u32.to_le_bytes());

        engine.unload_sound_model(a.id).unwrap();
        let unload = capture.last_param(module.unload_sound_model.param_id).unwrap();
        let (_, _, data) = unwrap_param(&unload).unwrap();
        assert_eq!(data, &7u32.to_le_bytes());
    }

    #[test]
    fn owner_stopped_during_notification_keeps_its_slots_disabled() {
        let capture = LoopbackCapture::new();
        let engine = Arc::new(engine(&capture, ModuleConfig::default()));
        let a = FakeClient::new(1, false);
        let b = FakeClient::new(2, false);
        engine
            .load_sound_model(&dyn_client(&a), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        engine.update_conf_levels(a.id, 1, &[60]).unwrap();
        engine.start_recognition(a.id).unwrap();
        a.set_state(SessionState::Active);
        engine
            .load_sound_model(&dyn_client(&b), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();
        engine.update_conf_levels(b.id, 1, &[70]).unwrap();
        engine.start_recognition(b.id).unwrap();
        b.set_state(SessionState::Active);
        assert_eq!(engine.composite_conf_levels(), vec![60, 70]);

        // The client stops between the detection and its notification, so
        // the notification is refused and the engine restarts for it.
        let stopper = {
            let engine = Arc::clone(&engine);
            let a = Arc::clone(&a);
            move || {
                a.set_state(SessionState::Loaded);
                engine.stop_recognition(a.id).unwrap();
            }
        };
        *a.on_detection.lock() = Some(Box::new(stopper));

        capture.inject_detection(&detection(&[85, 0]));
        wait_until(|| engine.diagnostics_snapshot().restarts == 1);
        assert!(a.detections.lock().is_empty());
        assert_eq!(engine.state(), EngineState::Active);
        assert_eq!(engine.composite_conf_levels(), vec![100, 70]);
    }

    #[test]
    fn detected_session_keeps_its_thresholds_across_a_merge() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let a = FakeClient::new(1, false);
        let b = FakeClient::new(2, false);
        engine
            .load_sound_model(&dyn_client(&a), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        engine.update_conf_levels(a.id, 1, &[60]).unwrap();
        engine.start_recognition(a.id).unwrap();
        a.set_state(SessionState::Detected);

        engine
            .load_sound_model(&dyn_client(&b), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();
        assert_eq!(engine.composite_conf_levels(), vec![60, 100]);
    }

    #[test]
    fn multi_model_detection_goes_to_the_active_owner() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::for_type(ModuleType::Pdk));
        let idle = FakeClient::new(7, false);
        let active = FakeClient::new(9, false);
        engine.load_sound_model(&dyn_client(&idle), b"model-a").unwrap();
        engine.load_sound_model(&dyn_client(&active), b"model-b").unwrap();
        engine.update_conf_levels(active.id, 1, &[40]).unwrap();
        engine.start_recognition(active.id).unwrap();
        active.set_state(SessionState::Active);

        let stale = ModelDetection {
            model_id: 7,
            keyword_id: 0,
            best_channel: 0,
            best_confidence: 95,
            kw_start_us: 100_000,
            kw_end_us: 400_000,
            timestamp_us: 600_000,
        };
        let hit = ModelDetection {
            model_id: 9,
            keyword_id: 0,
            best_channel: 1,
            best_confidence: 75,
            kw_start_us: 1_000_000,
            kw_end_us: 1_300_000,
            timestamp_us: 1_500_000,
        };
        let payload = DetectionPayloadWriter::new()
            .multi_model(&[stale, hit])
            .ftrt(1_000_000)
            .build(0);

        capture.inject_detection(&payload);
        wait_until(|| !active.detections.lock().is_empty());
        assert!(idle.detections.lock().is_empty());
        assert!(engine.detection_report(idle.id).is_none());

        let report = engine.detection_report(active.id).unwrap();
        assert_eq!(report.confidence_levels, vec![75]);
        assert_eq!(report.event.models, vec![hit]);
        assert_eq!(report.event.timestamp_us, 1_500_000);
        let window = report.window.unwrap();
        assert_eq!((window.start, window.end), (16_000, 25_600));
    }

    #[test]
    fn mapped_ftrt_reaches_readers_in_order_across_the_wrap() {
        let capture = LoopbackCapture::new();
        let module = ModuleConfig {
            // 2240 bytes: not a multiple of the 640-byte write size.
            mapped_buffer_ms: 70,
            ..ModuleConfig::default()
        };
        let engine = engine(&capture, module);
        let client = FakeClient::new(1, true);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        engine.start_recognition(client.id).unwrap();
        client.set_state(SessionState::Active);
        let reader = engine.new_reader();

        // 200 ms of FTRT audio, several laps of the mapped buffer.
        let ftrt: Vec<u8> = (0..6_400u32).map(|i| (i % 251) as u8).collect();
        capture.push_audio(&ftrt);
        let payload = DetectionPayloadWriter::new()
            .confidence_levels(&[80])
            .keyword_position(1_350_000, 1_450_000)
            .timestamp(1_500_000)
            .ftrt(200_000)
            .build(0);
        capture.inject_detection(&payload);
        wait_until(|| !client.detections.lock().is_empty());

        let mut out = vec![0u8; ftrt.len()];
        let mut filled = 0;
        while filled < out.len() {
            let n = reader.read(&mut out[filled..]).unwrap();
            assert!(n > 0, "reader ran dry after {filled} bytes");
            filled += n;
        }
        assert_eq!(out, ftrt);
    }

    #[test]
    fn subsystem_restart_is_passed_back_on_start_and_absorbed_on_stop() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, false);
        engine
            .load_sound_model(&dyn_client(&client), &JsonModelLib::encode(&["word"], &[], &[]))
            .unwrap();
        capture.set_offline(true);
        assert!(matches!(
            engine.start_recognition(client.id),
            Err(WakegateError::SubsystemRestart)
        ));
        assert_eq!(engine.state(), EngineState::Loaded);
        assert!(engine.stop_recognition(client.id).is_ok());
        assert!(engine.unload_sound_model(client.id).is_ok());
    }

    #[test]
    fn load_during_subsystem_restart_leaves_nothing_attached() {
        let capture = LoopbackCapture::new();
        let engine = engine(&capture, ModuleConfig::default());
        let client = FakeClient::new(1, false);
        let model = JsonModelLib::encode(&["word"], &[], &[]);
        capture.set_offline(true);
        assert!(matches!(
            engine.load_sound_model(&dyn_client(&client), &model),
            Err(WakegateError::SubsystemRestart)
        ));
        assert!(!engine.is_attached(client.id));

        capture.set_offline(false);
        engine.load_sound_model(&dyn_client(&client), &model).unwrap();
        assert!(engine.is_attached(client.id));
        assert_eq!(engine.state(), EngineState::Loaded);
    }
}
