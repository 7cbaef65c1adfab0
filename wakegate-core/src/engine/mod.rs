//! Detection engines.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──load──► Loaded ──start──► Active ──detection──► Detected
//!   ▲              ▲  ▲                ▲                    │
//!   └───unload─────┘  └──stop──────────┤◄──restart──────────┤
//!                                      └──────────── Buffering ◄┘
//! ```
//!
//! Two kinds implement [`DetectionEngine`]:
//!
//! - [`FirstStageEngine`] drives the DSP-resident keyword spotter. It is shared
//!   by every session using the same module type and owns the ring buffer and
//!   the event-processing thread.
//! - [`SecondStageEngine`] runs a CPU verifier over buffered audio after a
//!   first-stage hit. Each session owns its own.
//!
//! ## Threading
//!
//! `stop`, `restart`, `load`, `unload` and confidence updates first raise the
//! engine's `exit_buffering` flag, then take its state-transition lock. The
//! processing and verification threads poll that flag between reads and
//! vendor calls, so an in-flight buffering loop exits within one read cycle.

pub mod first_stage;
pub mod params;
pub mod registry;
pub mod second_stage;

pub use first_stage::FirstStageEngine;
pub use registry::EngineRegistry;
pub use second_stage::SecondStageEngine;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::SessionState;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "st{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loaded,
    Active,
    Buffering,
    Detected,
}

impl EngineState {
    /// Recognition is running (possibly mid-detection).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Active | EngineState::Buffering | EngineState::Detected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineKind {
    FirstStage,
    KeywordVerifier,
    UserVerifier,
}

/// Result reported by an engine to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionType {
    /// First-stage keyword hit.
    FirstStage,
    KeywordSuccess,
    KeywordReject,
    UserSuccess,
    UserReject,
}

impl DetectionType {
    pub fn bits(self) -> u32 {
        match self {
            DetectionType::FirstStage => 0x01,
            DetectionType::KeywordSuccess => 0x02,
            DetectionType::KeywordReject => 0x04,
            DetectionType::UserSuccess => 0x08,
            DetectionType::UserReject => 0x10,
        }
    }

    pub fn is_second_stage(self) -> bool {
        self != DetectionType::FirstStage
    }

    pub fn is_reject(self) -> bool {
        matches!(self, DetectionType::KeywordReject | DetectionType::UserReject)
    }
}

/// Buffering needs a session reports to its first-stage engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferingRequest {
    pub hist_ms: u32,
    pub pre_roll_ms: u32,
    /// Audio after the keyword is wanted, by the client or a verifier.
    pub capture_requested: bool,
}

/// The session side of the engine/session relationship. Engines hold only
/// weak references to their clients.
pub trait EngineClient: Send + Sync {
    fn id(&self) -> SessionId;

    /// Model id for multi-model modules; 0 otherwise.
    fn model_id(&self) -> u32;

    /// Current state; readable without the session's transition lock.
    fn state(&self) -> SessionState;

    fn buffering_request(&self) -> BufferingRequest;

    /// Delivers an engine result. May block briefly on the session lock and
    /// fails if the session moved on in the meantime.
    fn set_engine_detection_state(&self, detection: DetectionType) -> Result<()>;
}

/// Operations shared by both engine kinds.
pub trait DetectionEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Fails with [`WakegateError::SubsystemRestart`] when the subsystem
    /// went down mid-load; the client is not attached and the caller owns
    /// the replay.
    ///
    /// [`WakegateError::SubsystemRestart`]: crate::error::WakegateError::SubsystemRestart
    fn load_sound_model(&self, client: &Arc<dyn EngineClient>, data: &[u8]) -> Result<()>;

    fn unload_sound_model(&self, id: SessionId) -> Result<()>;

    /// Like loading, a subsystem restart is passed back to the caller.
    fn start_recognition(&self, id: SessionId) -> Result<()>;

    fn stop_recognition(&self, id: SessionId) -> Result<()>;

    fn restart_recognition(&self, id: SessionId) -> Result<()>;

    /// Signals a verifier that first-stage audio is ready. First-stage
    /// engines ignore it.
    fn set_detected(&self, _detected: bool) {}
}

/// Counters for one first-stage engine.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    pub callbacks: AtomicUsize,
    pub ignored_callbacks: AtomicUsize,
    pub parse_failures: AtomicUsize,
    pub detections: AtomicUsize,
    pub bytes_buffered: AtomicUsize,
    pub notifications: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn reset(&self) {
        self.callbacks.store(0, Ordering::Relaxed);
        self.ignored_callbacks.store(0, Ordering::Relaxed);
        self.parse_failures.store(0, Ordering::Relaxed);
        self.detections.store(0, Ordering::Relaxed);
        self.bytes_buffered.store(0, Ordering::Relaxed);
        self.notifications.store(0, Ordering::Relaxed);
        self.restarts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            ignored_callbacks: self.ignored_callbacks.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            bytes_buffered: self.bytes_buffered.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub callbacks: usize,
    pub ignored_callbacks: usize,
    pub parse_failures: usize,
    pub detections: usize,
    pub bytes_buffered: usize,
    pub notifications: usize,
    pub restarts: usize,
}
