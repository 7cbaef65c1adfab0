//! What a client hands a session: the sound model and the recognition config.

use serde::{Deserialize, Serialize};

use crate::config::ModuleType;
use crate::error::{Result, WakegateError};
use crate::verifier::VerifierKind;

/// History kept ahead of the keyword when the client leaves it unset.
pub const DEFAULT_HIST_MS: u32 = 1_500;
/// Pre-roll kept ahead of the history when the client leaves it unset.
pub const DEFAULT_PRE_ROLL_MS: u32 = 250;

pub const RECOGNITION_MODE_KEYPHRASE: u32 = 0x1;
pub const RECOGNITION_MODE_USER_ID: u32 = 0x2;

/// A verifier model carried alongside the first-stage model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondStageModel {
    pub kind: VerifierKind,
    pub data: Vec<u8>,
}

/// Sound model as loaded by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundModel {
    pub module: ModuleType,
    /// Identifies the model inside a multi-model engine. Ignored otherwise.
    #[serde(default)]
    pub model_id: u32,
    pub data: Vec<u8>,
    #[serde(default)]
    pub second_stage: Vec<SecondStageModel>,
}

impl SoundModel {
    pub fn new(module: ModuleType, data: Vec<u8>) -> Self {
        Self {
            module,
            model_id: 0,
            data,
            second_stage: Vec::new(),
        }
    }

    pub fn with_model_id(mut self, model_id: u32) -> Self {
        self.model_id = model_id;
        self
    }

    pub fn with_verifier(mut self, kind: VerifierKind, data: Vec<u8>) -> Self {
        self.second_stage.push(SecondStageModel { kind, data });
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(WakegateError::InvalidModel("empty sound model".into()));
        }
        for (i, stage) in self.second_stage.iter().enumerate() {
            if self.second_stage[..i].iter().any(|s| s.kind == stage.kind) {
                return Err(WakegateError::InvalidModel(format!(
                    "duplicate {:?} verifier model",
                    stage.kind
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondStageThreshold {
    pub kind: VerifierKind,
    pub threshold: u32,
}

/// Recognition parameters sent before (or between) starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecognitionConfig {
    /// Client wants to read the audio that follows the keyword.
    pub capture_requested: bool,
    pub recognition_mode: u32,
    /// One level per slot of the session's model: keyphrases first, then
    /// active user pairs.
    pub conf_levels: Vec<u8>,
    /// Zero selects [`DEFAULT_HIST_MS`].
    pub hist_ms: u32,
    /// Zero selects [`DEFAULT_PRE_ROLL_MS`].
    pub pre_roll_ms: u32,
    pub second_stage_thresholds: Vec<SecondStageThreshold>,
    /// Opaque wakeup payload for modules configured with `customWakeup`.
    pub custom_payload: Vec<u8>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            capture_requested: false,
            recognition_mode: RECOGNITION_MODE_KEYPHRASE,
            conf_levels: Vec::new(),
            hist_ms: 0,
            pre_roll_ms: 0,
            second_stage_thresholds: Vec::new(),
            custom_payload: Vec::new(),
        }
    }
}

impl RecognitionConfig {
    pub fn with_conf_levels(levels: &[u8]) -> Self {
        Self {
            conf_levels: levels.to_vec(),
            ..Self::default()
        }
    }

    pub fn hist_ms(&self) -> u32 {
        if self.hist_ms == 0 {
            DEFAULT_HIST_MS
        } else {
            self.hist_ms
        }
    }

    pub fn pre_roll_ms(&self) -> u32 {
        if self.pre_roll_ms == 0 {
            DEFAULT_PRE_ROLL_MS
        } else {
            self.pre_roll_ms
        }
    }

    pub fn threshold_for(&self, kind: VerifierKind) -> Option<u32> {
        self.second_stage_thresholds
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.threshold)
    }
}
