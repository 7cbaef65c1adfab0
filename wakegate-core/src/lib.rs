//! # wakegate-core
//!
//! Two-stage wake-word detection core.
//!
//! ## Architecture
//!
//! ```text
//! DSP capture session ── detection event ──► FirstStageEngine (one per module)
//!        │                                        │ route to owning session
//!        │ FTRT + live audio                      ▼
//!        └──────────────────────────────► RingBuffer ──► readers
//!                                                 │           │
//!                              SecondStageEngine(s)           client read()
//!                                       │ verdict
//!                                       ▼
//!                       SoundTriggerSession ── broadcast::Sender<RecognitionEvent>
//! ```
//!
//! Sessions attach to a shared first-stage engine per module type; the
//! engine merges their models into one composite (or registers them side by
//! side in multi-model mode). Engines talk back to sessions only through the
//! [`engine::EngineClient`] trait and only ever hold weak references.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod model;
pub mod platform;
pub mod session;
pub mod sim;
pub mod verifier;

// Convenience re-exports for downstream crates
pub use config::{ModuleType, PlatformConfig};
pub use engine::{EngineRegistry, FirstStageEngine, SecondStageEngine, SessionId};
pub use error::{Result, WakegateError};
pub use ipc::events::{RecognitionEvent, RecognitionStatus, SecondStageScore, SessionStatusEvent};
pub use model::{ModelLibHandle, SoundModelLib};
pub use platform::Platform;
pub use session::{RecognitionConfig, SessionState, SoundModel, SoundTriggerSession};
pub use verifier::{Verifier, VerifierFactory, VerifierKind};
