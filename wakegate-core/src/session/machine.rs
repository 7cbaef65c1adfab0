//! Session state transitions. Every function here runs under the session's
//! core lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::config::{RecognitionConfig, SecondStageModel, SoundModel};
use super::{Core, Engines, SessionInner, SessionState};
use crate::audio::DeviceId;
use crate::engine::second_stage::DEFAULT_THRESHOLD;
use crate::engine::{
    BufferingRequest, DetectionEngine, DetectionType, EngineClient, FirstStageEngine,
    SecondStageEngine,
};
use crate::error::{Result, WakegateError};
use crate::ipc::events::{RecognitionEvent, RecognitionStatus, SecondStageScore};

/// Ring-buffer headroom kept beyond history and pre-roll for a slow reader.
const READ_MARGIN_MS: u32 = 500;

impl SessionInner {
    // -----------------------------------------------------------------------
    // Client operations
    // -----------------------------------------------------------------------

    pub(super) fn load(&self, core: &mut Core, model: SoundModel) -> Result<()> {
        model.validate()?;
        match self.state() {
            SessionState::Idle => {}
            SessionState::Ssr if core.ssr_restore == SessionState::Idle => {
                info!(session = %self.id, "subsystem down, model load queued");
                core.model = Some(model);
                core.ssr_restore = SessionState::Loaded;
                return Ok(());
            }
            state => return Err(WakegateError::invalid_state("load_sound_model", state)),
        }

        if let Err(e) = self.load_engines(core, &model) {
            self.park_on_restart(core, Err(e), SessionState::Loaded)?;
            core.model = Some(model);
            return Ok(());
        }
        core.model = Some(model);
        self.set_state(SessionState::Loaded);
        Ok(())
    }

    pub(super) fn unload(&self, core: &mut Core) -> Result<()> {
        let state = self.state();
        match state {
            SessionState::Idle => {
                return Err(WakegateError::invalid_state("unload_sound_model", state));
            }
            SessionState::Ssr => core.ssr_restore = SessionState::Idle,
            _ => {
                if state.is_recognizing() {
                    if let Err(e) = self.stop_engines(core) {
                        warn!(session = %self.id, error = %e, "stop before unload failed");
                    }
                }
                self.unload_engines(core);
                self.set_state(SessionState::Idle);
            }
        }
        core.model = None;
        core.rec_config = None;
        core.started = false;
        *self.buffering.write() = BufferingRequest::default();
        Ok(())
    }

    pub(super) fn send_config(&self, core: &mut Core, config: RecognitionConfig) -> Result<()> {
        let state = self.state();
        match state {
            SessionState::Idle => Err(WakegateError::invalid_state("send_recognition_config", state)),
            SessionState::Ssr => {
                if core.ssr_restore == SessionState::Idle {
                    return Err(WakegateError::invalid_state("send_recognition_config", state));
                }
                core.rec_config = Some(config);
                Ok(())
            }
            SessionState::Loaded => self.apply_config(core, config),
            _ if core.rec_config.as_ref() == Some(&config) => {
                debug!(session = %self.id, "recognition config unchanged");
                Ok(())
            }
            SessionState::Active => {
                self.stop_engines(core)?;
                self.apply_config(core, config)?;
                self.start_engines(core)
            }
            SessionState::Detected | SessionState::Buffering => {
                self.stop_engines(core)?;
                self.apply_config(core, config)
            }
        }
    }

    pub(super) fn start(&self, core: &mut Core) -> Result<()> {
        let state = self.state();
        match state {
            SessionState::Idle => Err(WakegateError::invalid_state("start_recognition", state)),
            SessionState::Ssr => match core.ssr_restore {
                SessionState::Active => Ok(()),
                SessionState::Loaded if core.rec_config.is_none() => {
                    Err(WakegateError::NoRecognitionConfig)
                }
                SessionState::Loaded => {
                    core.ssr_restore = SessionState::Active;
                    core.started = true;
                    Ok(())
                }
                _ => Err(WakegateError::invalid_state("start_recognition", state)),
            },
            SessionState::Loaded => {
                if core.rec_config.is_none() {
                    return Err(WakegateError::NoRecognitionConfig);
                }
                if core.paused || !core.device_connected {
                    info!(
                        session = %self.id,
                        paused = core.paused,
                        device_connected = core.device_connected,
                        "start deferred"
                    );
                    core.started = true;
                    return Ok(());
                }
                self.start_engines(core)?;
                core.started = true;
                Ok(())
            }
            SessionState::Active => Ok(()),
            SessionState::Detected | SessionState::Buffering => {
                self.restart_engines(core)?;
                core.started = true;
                Ok(())
            }
        }
    }

    pub(super) fn stop(&self, core: &mut Core) -> Result<()> {
        let state = self.state();
        core.started = false;
        match state {
            SessionState::Idle => Err(WakegateError::invalid_state("stop_recognition", state)),
            SessionState::Ssr => {
                if core.ssr_restore == SessionState::Active {
                    core.ssr_restore = SessionState::Loaded;
                }
                Ok(())
            }
            SessionState::Loaded => Ok(()),
            _ => self.stop_engines(core),
        }
    }

    pub(super) fn read(&self, core: &mut Core, buf: &mut [u8]) -> Result<usize> {
        let state = self.state();
        match state {
            SessionState::Buffering if core.client_capture() => {
                let engines = core
                    .engines
                    .as_ref()
                    .ok_or_else(|| WakegateError::invalid_state("read", state))?;
                engines.reader.read(buf)
            }
            SessionState::Ssr => Err(WakegateError::SubsystemRestart),
            _ => Err(WakegateError::invalid_state("read", state)),
        }
    }

    pub(super) fn stop_buffering(&self, core: &mut Core) -> Result<()> {
        if self.state() != SessionState::Buffering {
            debug!(session = %self.id, "not buffering, stop_buffering ignored");
            return Ok(());
        }
        if let Some(engines) = core.engines.as_ref() {
            engines.reader.disable();
        }
        self.post_deferred_stop(core);
        Ok(())
    }

    pub(super) fn pause(&self, core: &mut Core) -> Result<()> {
        core.paused = true;
        if self.state().is_recognizing() {
            self.stop_engines(core)?;
        }
        debug!(session = %self.id, started = core.started, "session paused");
        Ok(())
    }

    pub(super) fn resume(&self, core: &mut Core) -> Result<()> {
        if !core.paused {
            return Ok(());
        }
        core.paused = false;
        match self.state() {
            SessionState::Ssr => {
                if core.started && core.ssr_restore == SessionState::Loaded {
                    core.ssr_restore = SessionState::Active;
                }
                Ok(())
            }
            SessionState::Loaded if core.started && core.device_connected => {
                if let Some(config) = core.rec_config.clone() {
                    self.apply_config(core, config)?;
                }
                self.start_engines(core)
            }
            _ => Ok(()),
        }
    }

    /// Drops everything the session holds. Used when the handle goes away.
    pub(super) fn close(&self, core: &mut Core) -> Result<()> {
        self.cancel_deferred_stop(core);
        if self.state().is_recognizing() {
            if let Err(e) = self.stop_engines(core) {
                warn!(session = %self.id, error = %e, "stop on close failed");
            }
        }
        self.unload_engines(core);
        core.model = None;
        core.rec_config = None;
        core.started = false;
        self.set_state(SessionState::Idle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Engine callbacks
    // -----------------------------------------------------------------------

    pub(super) fn engine_detection(&self, core: &mut Core, detection: DetectionType) -> Result<()> {
        let state = self.state();
        if detection == DetectionType::FirstStage {
            if state != SessionState::Active {
                return Err(WakegateError::invalid_state("first-stage detection", state));
            }
            return self.on_first_stage(core);
        }
        if state != SessionState::Buffering {
            return Err(WakegateError::invalid_state("second-stage detection", state));
        }
        if detection.is_reject() {
            self.on_second_stage_reject(core, detection)
        } else {
            self.on_second_stage_success(core, detection)
        }
    }

    fn on_first_stage(&self, core: &mut Core) -> Result<()> {
        let capture = core.client_capture();
        let (report, expected) = {
            let engines = core
                .engines
                .as_ref()
                .ok_or_else(|| WakegateError::invalid_state("first-stage detection", "no engines"))?;
            let report = engines.first_stage.detection_report(self.id);
            if report.is_none() {
                warn!(session = %self.id, "first-stage detection without a report");
            }
            if capture {
                engines.reader.enable();
            }

            let mut expected = 0;
            if !engines.verifiers.is_empty() {
                expected = DetectionType::FirstStage.bits();
                for verifier in &engines.verifiers {
                    expected |= verifier.verifier_kind().success().bits();
                }
                self.set_state(SessionState::Buffering);
                for verifier in &engines.verifiers {
                    verifier.set_detected(true);
                }
            }
            (report, expected)
        };
        core.report = report;

        if expected != 0 {
            core.detection_state = DetectionType::FirstStage.bits();
            core.notification_state = expected;
            debug!(session = %self.id, expected, "waiting for second-stage verdicts");
            return Ok(());
        }

        if capture {
            self.set_state(SessionState::Buffering);
            self.notify(core, RecognitionStatus::Success);
        } else {
            self.set_state(SessionState::Detected);
            self.notify(core, RecognitionStatus::Success);
            self.post_deferred_stop(core);
        }
        Ok(())
    }

    fn on_second_stage_success(&self, core: &mut Core, detection: DetectionType) -> Result<()> {
        core.detection_state |= detection.bits();
        if core.detection_state & core.notification_state != core.notification_state {
            debug!(
                session = %self.id,
                ?detection,
                detection_state = core.detection_state,
                "waiting for remaining verifiers"
            );
            return Ok(());
        }

        info!(session = %self.id, "every stage confirmed the keyword");
        let capture = core.client_capture();
        if !capture {
            self.set_state(SessionState::Detected);
        }
        self.notify(core, RecognitionStatus::Success);
        if !capture {
            self.post_deferred_stop(core);
        }
        Ok(())
    }

    fn on_second_stage_reject(&self, core: &mut Core, detection: DetectionType) -> Result<()> {
        if core.rejection_notified {
            debug!(session = %self.id, ?detection, "rejection already delivered");
            return Ok(());
        }
        if let Some(engines) = core.engines.as_ref() {
            for verifier in &engines.verifiers {
                if verifier.verifier_kind().reject() != detection {
                    verifier.set_detected(false);
                }
            }
        }
        info!(session = %self.id, ?detection, "second stage rejected the keyword");

        if !self.ctx.config.notify_second_stage_failure {
            return self.restart_engines(core);
        }

        core.rejection_notified = true;
        self.notify(core, RecognitionStatus::Failure);
        if !core.client_capture() {
            self.set_state(SessionState::Detected);
            self.post_deferred_stop(core);
        }
        Ok(())
    }

    fn notify(&self, core: &mut Core, status: RecognitionStatus) {
        let report = core.report.as_ref();
        let (kw_start_index, kw_end_index) = report
            .and_then(|r| r.window)
            .map(|w| (w.start, w.end))
            .unwrap_or((0, 0));
        let second_stage = core
            .engines
            .as_ref()
            .map(|e| {
                e.verifiers
                    .iter()
                    .filter_map(|v| v.last_outcome())
                    .map(|o| SecondStageScore {
                        kind: o.kind,
                        detected: o.detected,
                        confidence: o.confidence,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let event = RecognitionEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            session: self.id,
            status,
            capture_available: status == RecognitionStatus::Success && core.client_capture(),
            confidence_levels: report.map(|r| r.confidence_levels.clone()).unwrap_or_default(),
            kw_start_index,
            kw_end_index,
            timestamp_us: report.map(|r| r.event.timestamp_us).unwrap_or_default(),
            second_stage,
            processing_ms: report
                .and_then(|r| r.detected_at)
                .map(|at| at.elapsed().as_millis() as u64),
        };

        // The client has to start again to get another notification.
        core.started = false;
        info!(
            session = %self.id,
            seq = event.seq,
            ?status,
            kw_start = kw_start_index,
            kw_end = kw_end_index,
            "notifying client"
        );
        if self.recognition_tx.send(event).is_err() {
            debug!(session = %self.id, "no recognition subscribers");
        }
    }

    // -----------------------------------------------------------------------
    // Deferred stop
    // -----------------------------------------------------------------------

    fn post_deferred_stop(&self, core: &mut Core) {
        core.pending_stop = true;
        self.timer.arm();
    }

    fn cancel_deferred_stop(&self, core: &mut Core) {
        if core.pending_stop {
            core.pending_stop = false;
            self.timer.cancel();
        }
    }

    pub(super) fn deferred_stop(&self, core: &mut Core) -> Result<()> {
        if !core.pending_stop {
            return Ok(());
        }
        core.pending_stop = false;
        match self.state() {
            SessionState::Detected | SessionState::Buffering => {
                info!(session = %self.id, "deferred stop");
                self.stop_engines(core)
            }
            state => {
                debug!(session = %self.id, ?state, "deferred stop no longer needed");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Platform events
    // -----------------------------------------------------------------------

    pub(super) fn device_disconnected(&self, core: &mut Core, device: DeviceId) -> Result<()> {
        if core.device_id.is_some_and(|d| d != device) {
            debug!(session = %self.id, %device, "disconnect for another device ignored");
            return Ok(());
        }
        core.device_connected = false;
        match self.state() {
            SessionState::Detected | SessionState::Buffering => self.stop_engines(core)?,
            _ => self.close_device(core),
        }
        core.device = None;
        info!(session = %self.id, %device, "capture device disconnected");
        Ok(())
    }

    pub(super) fn device_connected(&self, core: &mut Core, device: DeviceId) -> Result<()> {
        core.device_connected = true;
        let changed = core.device_id != Some(device);
        core.device_id = Some(device);
        info!(session = %self.id, %device, changed, "capture device connected");

        let state = self.state();
        if matches!(state, SessionState::Idle | SessionState::Ssr) {
            return Ok(());
        }
        if matches!(state, SessionState::Detected | SessionState::Buffering) {
            self.stop_engines(core)?;
        }
        if changed || core.device.is_none() {
            self.close_device(core);
            core.device = None;
            self.attach_device(core)?;
        }
        match self.state() {
            SessionState::Active => self.start_device(core),
            SessionState::Loaded if core.started && !core.paused => self.start_engines(core),
            _ => Ok(()),
        }
    }

    /// A concurrent stream can move capture to a different profile; a
    /// profile that changes format or power path needs the model reloaded.
    pub(super) fn concurrent_stream(&self, core: &mut Core, active: bool) -> Result<()> {
        let Some(device) = core.device_id else {
            return Ok(());
        };
        let next = self.ctx.backend.capture_profile(device);
        let reload = core
            .profile
            .as_ref()
            .is_some_and(|current| current.requires_reload(&next));
        let state = self.state();
        debug!(session = %self.id, active, profile = %next.name, reload, ?state, "concurrent stream");

        if !reload || matches!(state, SessionState::Idle | SessionState::Ssr) {
            core.profile = Some(next);
            return Ok(());
        }

        info!(session = %self.id, profile = %next.name, "capture profile changed, reloading model");
        let model = core
            .model
            .clone()
            .ok_or_else(|| WakegateError::invalid_state("concurrent_stream", state))?;
        if state.is_recognizing() {
            self.stop_engines(core)?;
        }
        self.unload_engines(core);
        self.set_state(SessionState::Idle);

        let loaded = self.load_engines(core, &model);
        let restore = if core.started { SessionState::Active } else { SessionState::Loaded };
        self.park_on_restart(core, loaded, restore)?;
        if self.state() == SessionState::Ssr {
            return Ok(());
        }
        self.set_state(SessionState::Loaded);
        if let Some(config) = core.rec_config.clone() {
            self.apply_config(core, config)?;
        }
        if core.started && !core.paused && core.device_connected {
            self.start_engines(core)?;
        }
        Ok(())
    }

    pub(super) fn ssr_offline(&self, core: &mut Core) -> Result<()> {
        let state = self.state();
        let restore = match state {
            SessionState::Ssr => return Ok(()),
            SessionState::Idle => SessionState::Idle,
            SessionState::Loaded | SessionState::Detected => SessionState::Loaded,
            SessionState::Active => SessionState::Active,
            // Verifiers still deciding: the client has not been notified yet.
            SessionState::Buffering if core.detection_state != core.notification_state => {
                SessionState::Active
            }
            SessionState::Buffering => SessionState::Loaded,
        };
        info!(session = %self.id, ?state, ?restore, "subsystem down");

        if state.is_recognizing() {
            if let Err(e) = self.stop_engines(core) {
                warn!(session = %self.id, error = %e, "stop on subsystem restart failed");
            }
        }
        self.enter_ssr(core, restore);
        Ok(())
    }

    pub(super) fn ssr_online(&self, core: &mut Core) -> Result<()> {
        if self.state() != SessionState::Ssr {
            return Ok(());
        }
        let restore = std::mem::replace(&mut core.ssr_restore, SessionState::Idle);
        self.set_state(SessionState::Idle);
        if restore == SessionState::Idle {
            return Ok(());
        }

        let model = core
            .model
            .clone()
            .ok_or_else(|| WakegateError::invalid_state("ssr_online", "no model to restore"))?;
        let loaded = self.load_engines(core, &model);
        self.park_on_restart(core, loaded, restore)?;
        if self.state() == SessionState::Ssr {
            return Ok(());
        }
        self.set_state(SessionState::Loaded);
        if let Some(config) = core.rec_config.clone() {
            self.apply_config(core, config)?;
        }
        if restore == SessionState::Active && !core.paused && core.device_connected {
            self.start_engines(core)?;
            core.started = true;
        }
        info!(session = %self.id, state = ?self.state(), "session restored");
        Ok(())
    }

    fn enter_ssr(&self, core: &mut Core, restore: SessionState) {
        self.unload_engines(core);
        core.ssr_restore = restore;
        self.set_state(SessionState::Ssr);
    }

    /// A load or start that ran into a subsystem restart leaves the session
    /// in `Ssr`, to be replayed up to `restore` once the subsystem is back.
    fn park_on_restart(&self, core: &mut Core, result: Result<()>, restore: SessionState) -> Result<()> {
        match result {
            Err(e) if e.is_subsystem_restart() => {
                warn!(session = %self.id, ?restore, "subsystem down mid-operation, replay queued");
                self.enter_ssr(core, restore);
                Ok(())
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Engines
    // -----------------------------------------------------------------------

    fn load_engines(&self, core: &mut Core, model: &SoundModel) -> Result<()> {
        let ctx = &self.ctx;
        let module = ctx.config.module(model.module).ok_or_else(|| {
            WakegateError::Config(format!("module {:?} is not configured", model.module))
        })?;
        self.attach_device(core)?;

        let first_stage = ctx.registry.get_or_create(
            module,
            ctx.config.audio,
            ctx.backend.as_ref(),
            &ctx.model_lib,
        )?;
        self.model_id.store(model.model_id, Ordering::Release);
        let client = self.client()?;
        let reader = first_stage.new_reader();
        let mut engines = Engines {
            module: model.module,
            first_stage,
            verifiers: Vec::new(),
            reader,
        };

        if let Err(e) = engines.first_stage.load_sound_model(&client, &model.data) {
            error!(session = %self.id, error = %e, "first-stage load failed");
            self.release_engines(core, engines);
            return Err(e);
        }
        for stage in &model.second_stage {
            match self.build_verifier(&engines.first_stage, &client, stage) {
                Ok(verifier) => engines.verifiers.push(verifier),
                Err(e) => {
                    error!(session = %self.id, kind = ?stage.kind, error = %e, "verifier load failed");
                    self.release_engines(core, engines);
                    return Err(e);
                }
            }
        }

        info!(
            session = %self.id,
            module = ?model.module,
            verifiers = engines.verifiers.len(),
            "engines loaded"
        );
        core.engines = Some(engines);
        Ok(())
    }

    fn build_verifier(
        &self,
        first_stage: &FirstStageEngine,
        client: &Arc<dyn EngineClient>,
        stage: &SecondStageModel,
    ) -> Result<SecondStageEngine> {
        let verifier = self.ctx.verifiers.create(stage.kind)?;
        let engine = SecondStageEngine::new(
            stage.kind,
            self.ctx.config.second_stage.clone(),
            first_stage.format(),
            first_stage.new_reader(),
            verifier,
        )?;
        engine.load_sound_model(client, &stage.data)?;
        Ok(engine)
    }

    /// Detaches from every engine; they are released after the core lock.
    fn release_engines(&self, core: &mut Core, engines: Engines) {
        for verifier in &engines.verifiers {
            if let Err(e) = verifier.unload_sound_model(self.id) {
                warn!(session = %self.id, error = %e, "verifier unload failed");
            }
        }
        if engines.first_stage.is_attached(self.id) {
            if let Err(e) = engines.first_stage.unload_sound_model(self.id) {
                warn!(session = %self.id, error = %e, "first-stage unload failed");
            }
        }
        engines.first_stage.buffer().remove_reader(&engines.reader);
        core.retired.push(engines);
    }

    fn unload_engines(&self, core: &mut Core) {
        if let Some(engines) = core.engines.take() {
            self.release_engines(core, engines);
        }
        self.close_device(core);
        core.device = None;
        core.report = None;
        core.detection_state = 0;
        core.notification_state = 0;
    }

    fn apply_config(&self, core: &mut Core, config: RecognitionConfig) -> Result<()> {
        if let Some(bad) = config.second_stage_thresholds.iter().find(|t| t.threshold > 100) {
            return Err(WakegateError::InvalidArgument(format!(
                "{:?} threshold {} above 100",
                bad.kind, bad.threshold
            )));
        }
        let engines = core
            .engines
            .as_ref()
            .ok_or_else(|| WakegateError::invalid_state("send_recognition_config", self.state()))?;

        let request = BufferingRequest {
            hist_ms: config.hist_ms(),
            pre_roll_ms: config.pre_roll_ms(),
            capture_requested: config.capture_requested || !engines.verifiers.is_empty(),
        };
        *self.buffering.write() = request;

        let custom = self
            .ctx
            .config
            .module(engines.module)
            .is_some_and(|m| m.custom_wakeup);
        let levels = if custom {
            &config.custom_payload
        } else {
            &config.conf_levels
        };
        if !levels.is_empty() {
            engines
                .first_stage
                .update_conf_levels(self.id, config.recognition_mode, levels)?;
        }
        engines
            .first_stage
            .update_buf_config(self.id, request.hist_ms, request.pre_roll_ms);
        for verifier in &engines.verifiers {
            let threshold = config
                .threshold_for(verifier.verifier_kind())
                .unwrap_or(DEFAULT_THRESHOLD);
            verifier.set_threshold(threshold)?;
        }
        self.ensure_buffer_capacity(engines, &request);

        debug!(
            session = %self.id,
            capture = request.capture_requested,
            hist_ms = request.hist_ms,
            pre_roll_ms = request.pre_roll_ms,
            "recognition config applied"
        );
        core.rec_config = Some(config);
        Ok(())
    }

    fn ensure_buffer_capacity(&self, engines: &Engines, request: &BufferingRequest) {
        let format = engines.first_stage.format();
        let needed = format.ms_to_bytes(u64::from(
            request.hist_ms + request.pre_roll_ms + READ_MARGIN_MS,
        ));
        let buffer = engines.first_stage.buffer();
        if needed <= buffer.capacity() {
            return;
        }
        match buffer.resize(needed) {
            Ok(()) => info!(session = %self.id, capacity = needed, "ring buffer grown"),
            Err(e) => warn!(session = %self.id, error = %e, "ring buffer resize refused"),
        }
    }

    /// Loaded → Active. On failure the session stays Loaded with the device
    /// closed, except that a subsystem restart parks it in `Ssr`.
    fn start_engines(&self, core: &mut Core) -> Result<()> {
        self.start_device(core)?;
        let started = self.start_stages(core.engines.as_ref());
        if let Err(e) = started {
            error!(session = %self.id, error = %e, "failed to start recognition");
            self.close_device(core);
            return self.park_on_restart(core, Err(e), SessionState::Active);
        }
        core.detection_state = 0;
        core.notification_state = 0;
        core.rejection_notified = false;
        core.report = None;
        self.set_state(SessionState::Active);
        Ok(())
    }

    fn start_stages(&self, engines: Option<&Engines>) -> Result<()> {
        let engines = engines
            .ok_or_else(|| WakegateError::invalid_state("start_recognition", "no engines"))?;
        engines.first_stage.start_recognition(self.id)?;
        for (i, verifier) in engines.verifiers.iter().enumerate() {
            if let Err(e) = verifier.start_recognition(self.id) {
                for started in &engines.verifiers[..i] {
                    let _ = started.stop_recognition(self.id);
                }
                let _ = engines.first_stage.stop_recognition(self.id);
                return Err(e);
            }
        }
        engines.reader.reset();
        Ok(())
    }

    /// Detected/Buffering → Active without a full stop.
    fn restart_engines(&self, core: &mut Core) -> Result<()> {
        self.cancel_deferred_stop(core);
        let engines = core
            .engines
            .as_ref()
            .ok_or_else(|| WakegateError::invalid_state("restart_recognition", "no engines"))?;
        for verifier in &engines.verifiers {
            verifier.restart_recognition(self.id)?;
        }
        engines.first_stage.restart_recognition(self.id)?;
        engines.reader.reset();

        core.detection_state = 0;
        core.notification_state = 0;
        core.rejection_notified = false;
        core.report = None;
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Recognizing → Loaded. The state changes before the engines are told so
    /// a detection racing the stop is not routed here.
    fn stop_engines(&self, core: &mut Core) -> Result<()> {
        self.cancel_deferred_stop(core);
        self.set_state(SessionState::Loaded);

        let mut result = Ok(());
        if let Some(engines) = core.engines.as_ref() {
            for verifier in &engines.verifiers {
                if let Err(e) = verifier.stop_recognition(self.id) {
                    warn!(session = %self.id, error = %e, "verifier stop failed");
                }
            }
            result = engines.first_stage.stop_recognition(self.id);
            engines.reader.reset();
        }
        self.close_device(core);
        core.detection_state = 0;
        core.notification_state = 0;
        core.report = None;
        if let Err(e) = &result {
            error!(session = %self.id, error = %e, "failed to stop recognition");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Capture device
    // -----------------------------------------------------------------------

    fn attach_device(&self, core: &mut Core) -> Result<()> {
        let backend = &self.ctx.backend;
        let id = *core.device_id.get_or_insert_with(|| backend.default_device());
        core.profile = Some(backend.capture_profile(id));
        if core.device_connected && core.device.is_none() {
            core.device = Some(backend.create_device(id)?);
        }
        Ok(())
    }

    fn start_device(&self, core: &mut Core) -> Result<()> {
        let Some(device) = core.device.clone() else {
            return Ok(());
        };
        if !core.device_open {
            device
                .open()
                .map_err(|e| WakegateError::SessionOpenFailed(format!("{}: {e}", device.id())))?;
            core.device_open = true;
        }
        if let Err(e) = device.start() {
            if let Err(close) = device.close() {
                warn!(device = %device.id(), error = %close, "device close failed");
            }
            core.device_open = false;
            return Err(WakegateError::SessionStartFailed(format!("{}: {e}", device.id())));
        }
        Ok(())
    }

    fn close_device(&self, core: &mut Core) {
        if !core.device_open {
            return;
        }
        core.device_open = false;
        let Some(device) = core.device.as_ref() else {
            return;
        };
        if let Err(e) = device.stop() {
            warn!(device = %device.id(), error = %e, "device stop failed");
        }
        if let Err(e) = device.close() {
            warn!(device = %device.id(), error = %e, "device close failed");
        }
    }
}
