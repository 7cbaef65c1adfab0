//! Second-stage verification libraries.
//!
//! The [`Verifier`] trait is the seam to a CPU-side keyword or speaker
//! verification library. A [`SecondStageEngine`](crate::engine::SecondStageEngine)
//! owns one verifier and feeds it PCM chunks from its ring-buffer reader after
//! a first-stage hit. Implementations are stateful and only ever driven from
//! one thread at a time.

pub mod energy;

pub use energy::{EnergyVerifier, EnergyVerifierFactory};

use serde::{Deserialize, Serialize};

use crate::engine::{DetectionType, EngineKind};
use crate::error::Result;

/// What a verifier confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// Keyword verification.
    Keyword,
    /// Speaker (user) verification.
    User,
}

impl VerifierKind {
    pub fn engine_kind(self) -> EngineKind {
        match self {
            VerifierKind::Keyword => EngineKind::KeywordVerifier,
            VerifierKind::User => EngineKind::UserVerifier,
        }
    }

    pub fn success(self) -> DetectionType {
        match self {
            VerifierKind::Keyword => DetectionType::KeywordSuccess,
            VerifierKind::User => DetectionType::UserSuccess,
        }
    }

    pub fn reject(self) -> DetectionType {
        match self {
            VerifierKind::Keyword => DetectionType::KeywordReject,
            VerifierKind::User => DetectionType::UserReject,
        }
    }
}

/// Tunables a verifier exposes through `get_param` / `set_param`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierParam {
    /// Confidence (0-100) at or above which `process` reports a detection.
    Threshold,
    /// Keyword start, in bytes from the start of the processed window.
    KeywordStart,
    /// Keyword end, in bytes from the start of the processed window.
    KeywordEnd,
}

/// Result of one `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifierResult {
    pub detected: bool,
    /// Confidence in 0-100.
    pub confidence: u32,
}

/// A CPU-side verification library instance.
pub trait Verifier: Send {
    /// Initialises the instance from an opaque model blob.
    fn init(&mut self, model: &[u8]) -> Result<()>;

    /// Consumes one chunk of PCM. Verifiers accumulate across calls until
    /// `reset`.
    fn process(&mut self, pcm: &[u8]) -> Result<VerifierResult>;

    fn get_param(&self, param: VerifierParam) -> Result<u32>;

    fn set_param(&mut self, param: VerifierParam, value: u32) -> Result<()>;

    /// Drops accumulated state before the next detection window.
    fn reset(&mut self);

    /// Releases the model. `init` must be called again before `process`.
    fn end(&mut self) -> Result<()>;
}

/// Creates verifier instances per kind.
pub trait VerifierFactory: Send + Sync {
    fn create(&self, kind: VerifierKind) -> Result<Box<dyn Verifier>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_detection_bits() {
        assert_eq!(VerifierKind::Keyword.success(), DetectionType::KeywordSuccess);
        assert_eq!(VerifierKind::User.reject(), DetectionType::UserReject);
        assert!(VerifierKind::User.reject().is_reject());
        assert_eq!(VerifierKind::Keyword.engine_kind(), EngineKind::KeywordVerifier);
    }

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&VerifierKind::User).expect("serialize kind");
        assert_eq!(json, r#""user""#);
    }
}
