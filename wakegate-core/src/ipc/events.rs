//! Events delivered to clients over each session's broadcast channels.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `RecognitionEvent` | `SoundTriggerSession::subscribe_recognition` |
//! | `SessionStatusEvent` | `SoundTriggerSession::subscribe_status` |

use serde::{Deserialize, Serialize};

use crate::engine::SessionId;
use crate::session::SessionState;
use crate::verifier::VerifierKind;

// ---------------------------------------------------------------------------
// Recognition events
// ---------------------------------------------------------------------------

/// Sent when a detection is confirmed or rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionEvent {
    /// Monotonically increasing per-session sequence number.
    pub seq: u64,
    pub session: SessionId,
    pub status: RecognitionStatus,
    /// Audio after the keyword can be read from the session.
    pub capture_available: bool,
    /// Confidence levels in the session's own slot layout.
    pub confidence_levels: Vec<u32>,
    /// Keyword start in bytes from the first buffered byte.
    pub kw_start_index: usize,
    /// Keyword end in bytes from the first buffered byte. Equal to the start
    /// when the detection carried no usable keyword window.
    pub kw_end_index: usize,
    pub timestamp_us: u64,
    pub second_stage: Vec<SecondStageScore>,
    /// Time from the detection callback to this notification.
    pub processing_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionStatus {
    Success,
    /// A second-stage verifier rejected the keyword.
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondStageScore {
    pub kind: VerifierKind,
    pub detected: bool,
    pub confidence: u32,
}

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Sent on every session state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub session: SessionId,
    pub from: SessionState,
    pub to: SessionState,
}
