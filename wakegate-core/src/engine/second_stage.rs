//! CPU-side second-stage verification engine.
//!
//! Each session owns one engine per configured verifier. The engine holds a
//! reader on the first-stage ring buffer and a private verification thread.
//!
//! ## Threading
//!
//! ```text
//!  session ── set_detected(true) ──► Core { processing } ── cv ──┐
//!                                                                ▼
//!  verification thread: window from keyword indices ─► advance reader
//!        ─► process chunks ─► Success | Reject ─► client.set_engine_detection_state
//! ```
//!
//! Every stop, restart, unload or `set_detected(false)` bumps a generation
//! counter under the core lock and raises `exit_buffering`. The thread checks
//! both between chunks and never reports a result from an older generation.
//! A vendor `process` call already running completes first.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::{DetectionEngine, EngineClient, EngineKind, EngineState, SessionId};
use crate::buffering::format::AudioFormat;
use crate::buffering::RingBufferReader;
use crate::config::{SecondStageConfig, VerificationTimeoutPolicy};
use crate::error::{Result, WakegateError};
use crate::verifier::{Verifier, VerifierKind, VerifierParam};

/// Threshold used until the session configures one.
pub const DEFAULT_THRESHOLD: u32 = 60;

/// Final verdict of one verification window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub kind: VerifierKind,
    pub detected: bool,
    /// Best confidence seen in the window.
    pub confidence: u32,
    /// Rejected because the wall-clock ceiling passed.
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

struct Core {
    client: Option<(SessionId, Weak<dyn EngineClient>)>,
    processing: bool,
}

struct Inner {
    kind: VerifierKind,
    config: SecondStageConfig,
    format: AudioFormat,
    reader: RingBufferReader,
    verifier: Mutex<Box<dyn Verifier>>,
    core: Mutex<Core>,
    cv: Condvar,
    state: Mutex<EngineState>,
    generation: AtomicU64,
    exit_buffering: AtomicBool,
    exit_thread: AtomicBool,
    threshold: AtomicU32,
    last_outcome: Mutex<Option<VerificationOutcome>>,
}

/// Verifier engine owned by one session.
pub struct SecondStageEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SecondStageEngine {
    pub fn new(
        kind: VerifierKind,
        config: SecondStageConfig,
        format: AudioFormat,
        reader: RingBufferReader,
        verifier: Box<dyn Verifier>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            kind,
            config,
            format,
            reader,
            verifier: Mutex::new(verifier),
            core: Mutex::new(Core {
                client: None,
                processing: false,
            }),
            cv: Condvar::new(),
            state: Mutex::new(EngineState::Idle),
            generation: AtomicU64::new(0),
            exit_buffering: AtomicBool::new(false),
            exit_thread: AtomicBool::new(false),
            threshold: AtomicU32::new(DEFAULT_THRESHOLD),
            last_outcome: Mutex::new(None),
        });

        let thread_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("wakegate-{kind:?}-verifier").to_lowercase())
            .spawn(move || thread_inner.run_verification())?;

        debug!(?kind, "second-stage engine created");
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn verifier_kind(&self) -> VerifierKind {
        self.inner.kind
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    /// Confidence threshold applied at the start of the next window.
    pub fn set_threshold(&self, threshold: u32) -> Result<()> {
        if threshold > 100 {
            return Err(WakegateError::InvalidArgument(format!(
                "second-stage threshold {threshold} above 100"
            )));
        }
        self.inner.threshold.store(threshold, Ordering::Relaxed);
        Ok(())
    }

    pub fn threshold(&self) -> u32 {
        self.inner.threshold.load(Ordering::Relaxed)
    }

    pub fn last_outcome(&self) -> Option<VerificationOutcome> {
        *self.inner.last_outcome.lock()
    }

    pub fn reader(&self) -> &RingBufferReader {
        &self.inner.reader
    }
}

impl DetectionEngine for SecondStageEngine {
    fn kind(&self) -> EngineKind {
        self.inner.kind.engine_kind()
    }

    fn load_sound_model(&self, client: &Arc<dyn EngineClient>, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.client.is_some() {
            return Err(WakegateError::invalid_state("load_sound_model", inner.state()));
        }
        inner.verifier.lock().init(data)?;
        core.client = Some((client.id(), Arc::downgrade(client)));
        inner.set_state(EngineState::Loaded);
        info!(session = %client.id(), kind = ?inner.kind, "verifier model loaded");
        Ok(())
    }

    fn unload_sound_model(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.cancel(true);
        core.client = None;
        inner.reader.reset();
        let ended = inner.verifier.lock().end();
        inner.set_state(EngineState::Idle);
        info!(session = %id, kind = ?inner.kind, "verifier model unloaded");
        ended
    }

    fn start_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        let core = inner.cancel(true);
        if core.client.is_none() {
            return Err(WakegateError::invalid_state("start_recognition", inner.state()));
        }
        inner.reader.reset();
        *inner.last_outcome.lock() = None;
        inner.exit_buffering.store(false, Ordering::Release);
        inner.set_state(EngineState::Active);
        debug!(session = %id, kind = ?inner.kind, "verifier started");
        Ok(())
    }

    fn stop_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        let _core = inner.cancel(true);
        inner.reader.reset();
        if inner.state().is_active() {
            inner.set_state(EngineState::Loaded);
        }
        debug!(session = %id, kind = ?inner.kind, "verifier stopped");
        Ok(())
    }

    fn restart_recognition(&self, id: SessionId) -> Result<()> {
        let inner = &self.inner;
        let _core = inner.cancel(true);
        inner.reader.reset();
        if inner.state().is_active() {
            inner.exit_buffering.store(false, Ordering::Release);
            inner.set_state(EngineState::Active);
        }
        debug!(session = %id, kind = ?inner.kind, "verifier restarted");
        Ok(())
    }

    fn set_detected(&self, detected: bool) {
        let inner = &self.inner;
        if !detected {
            let _core = inner.cancel(true);
            if inner.state() == EngineState::Buffering {
                inner.set_state(EngineState::Active);
            }
            return;
        }

        let mut core = inner.cancel(false);
        if inner.state() != EngineState::Active {
            debug!(state = ?inner.state(), "verifier not active, detection ignored");
            return;
        }
        inner.exit_buffering.store(false, Ordering::Release);
        core.processing = true;
        inner.set_state(EngineState::Buffering);
        inner.cv.notify_one();
    }
}

impl Drop for SecondStageEngine {
    fn drop(&mut self) {
        self.inner.exit_buffering.store(true, Ordering::Release);
        self.inner.exit_thread.store(true, Ordering::Release);
        {
            let _core = self.inner.core.lock();
            self.inner.cv.notify_one();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("verification thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for SecondStageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondStageEngine")
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("threshold", &self.threshold())
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
            info!(kind = ?self.kind, from = ?*state, to = ?next, "verifier state");
            *state = next;
        }
    }

    /// Invalidates any window in flight and returns the core lock.
    fn cancel(&self, raise_exit: bool) -> MutexGuard<'_, Core> {
        if raise_exit {
            self.exit_buffering.store(true, Ordering::Release);
        }
        let mut core = self.core.lock();
        core.processing = false;
        self.generation.fetch_add(1, Ordering::AcqRel);
        core
    }

    fn cancelled(&self, generation: u64) -> bool {
        self.exit_thread.load(Ordering::Acquire)
            || self.exit_buffering.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
    }

    fn run_verification(&self) {
        debug!(kind = ?self.kind, "verification thread started");
        let mut core = self.core.lock();
        loop {
            while !core.processing && !self.exit_thread.load(Ordering::Acquire) {
                self.cv.wait(&mut core);
            }
            if self.exit_thread.load(Ordering::Acquire) {
                break;
            }
            core.processing = false;
            let generation = self.generation.load(Ordering::Acquire);
            let client = core.client.as_ref().and_then(|(_, c)| c.upgrade());

            let verdict = MutexGuard::unlocked(&mut core, || self.verify(generation));
            let outcome = match verdict {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    debug!(kind = ?self.kind, "verification cancelled");
                    continue;
                }
                Err(e) => {
                    if self.cancelled(generation) {
                        debug!(kind = ?self.kind, error = %e, "verification cancelled");
                        continue;
                    }
                    error!(kind = ?self.kind, error = %e, "verification failed, rejecting");
                    VerificationOutcome {
                        kind: self.kind,
                        detected: false,
                        confidence: 0,
                        timed_out: false,
                        elapsed_ms: 0,
                    }
                }
            };
            if self.generation.load(Ordering::Acquire) != generation {
                debug!(kind = ?self.kind, "verdict from a stale window dropped");
                continue;
            }

            *self.last_outcome.lock() = Some(outcome);
            self.set_state(EngineState::Detected);
            let detection = if outcome.detected {
                self.kind.success()
            } else {
                self.kind.reject()
            };
            info!(
                kind = ?self.kind,
                detected = outcome.detected,
                confidence = outcome.confidence,
                timed_out = outcome.timed_out,
                elapsed_ms = outcome.elapsed_ms,
                "verification finished"
            );
            let Some(client) = client else {
                debug!("verifier session is gone");
                continue;
            };
            let reported =
                MutexGuard::unlocked(&mut core, || client.set_engine_detection_state(detection));
            if let Err(e) = reported {
                debug!(session = %client.id(), error = %e, "session dropped verification result");
            }
        }
        debug!(kind = ?self.kind, "verification thread exiting");
    }

    /// Runs one window. `None` means the window was cancelled.
    fn verify(&self, generation: u64) -> Result<Option<VerificationOutcome>> {
        let begin = Instant::now();
        let deadline = match self.config.timeout {
            VerificationTimeoutPolicy::Unbounded => None,
            VerificationTimeoutPolicy::RejectAfter { ms } => Some(begin + Duration::from_millis(ms)),
        };
        let retry = Duration::from_millis(u64::from(self.config.retry_interval_ms.max(1)));
        let frame = self.format.frame_bytes().max(1);
        let align = |bytes: usize| bytes - bytes % frame;
        let ms = |ms: u32| self.format.ms_to_bytes(u64::from(ms));

        let (kw_start, kw_end) = self.reader.indices();
        let window_start = align(kw_start.saturating_sub(ms(self.config.kw_start_tolerance_ms)));
        let window_end = align(
            kw_end + ms(self.config.kw_end_tolerance_ms) + ms(self.config.data_after_kw_end_ms),
        );
        let outcome = |detected: bool, confidence: u32, timed_out: bool| VerificationOutcome {
            kind: self.kind,
            detected,
            confidence,
            timed_out,
            elapsed_ms: begin.elapsed().as_millis() as u64,
        };
        if window_end <= window_start {
            warn!(kw_start, kw_end, "empty verification window");
            return Ok(Some(outcome(false, 0, false)));
        }
        debug!(kind = ?self.kind, window_start, window_end, "verification window");

        {
            let mut verifier = self.verifier.lock();
            verifier.reset();
            verifier.set_param(VerifierParam::Threshold, self.threshold.load(Ordering::Relaxed))?;
            verifier.set_param(VerifierParam::KeywordStart, (kw_start - window_start.min(kw_start)) as u32)?;
            verifier.set_param(VerifierParam::KeywordEnd, kw_end.saturating_sub(window_start) as u32)?;
        }
        self.reader.enable();

        let timed_out = || deadline.is_some_and(|d| Instant::now() >= d);

        // The writer may still be short of the window start.
        loop {
            if self.cancelled(generation) {
                return Ok(None);
            }
            if timed_out() {
                warn!(kind = ?self.kind, "verification timed out before window start");
                return Ok(Some(outcome(false, 0, true)));
            }
            match self.reader.advance_read_offset(window_start) {
                Ok(()) => break,
                Err(WakegateError::InsufficientUnread { available, .. }) => {
                    trace!(available, window_start, "waiting for window start");
                    thread::sleep(retry);
                }
                Err(e) => return Err(e),
            }
        }

        let total = window_end - window_start;
        let chunk = align(ms(self.config.chunk_ms)).max(frame);
        let mut buf = vec![0u8; chunk];
        let mut processed = 0usize;
        let mut best = 0u32;
        while processed < total {
            if self.cancelled(generation) {
                return Ok(None);
            }
            if timed_out() {
                warn!(kind = ?self.kind, processed, total, "verification timed out");
                return Ok(Some(outcome(false, best, true)));
            }
            let want = chunk.min(total - processed);
            if self.reader.unread_size() < want {
                thread::sleep(retry);
                continue;
            }
            let n = self.reader.read(&mut buf[..want])?;
            if n == 0 {
                thread::sleep(retry);
                continue;
            }
            let result = self.verifier.lock().process(&buf[..n])?;
            processed += n;
            best = best.max(result.confidence);
            trace!(processed, confidence = result.confidence, "verifier chunk");
            if result.detected {
                return Ok(Some(outcome(true, result.confidence, false)));
            }
        }
        Ok(Some(outcome(false, best, false)))
    }
}
