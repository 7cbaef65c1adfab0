//! Platform knobs (JSON file).
//!
//! Everything here has a working default so a missing file is not an error.
//! `normalize()` clamps values loaded from disk into sane ranges.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffering::format::AudioFormat;
use crate::error::Result;

/// First-stage DSP module family. One shared engine exists per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// Merge-capable keyword spotter.
    Gmm,
    /// Multi-model keyword spotter; models are registered side by side.
    Pdk,
    /// Vendor hotword module configured through an opaque payload.
    Hotword,
}

/// How several client models share one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelMode {
    /// One composite model produced by the vendor merge.
    Merged,
    /// Each model registered under its own model id.
    MultiModel,
}

/// `(tag_id, param_id)` addressing one DSP parameter. Zero means unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamIds {
    pub tag_id: u32,
    pub param_id: u32,
}

impl ParamIds {
    pub const fn new(tag_id: u32, param_id: u32) -> Self {
        Self { tag_id, param_id }
    }

    pub fn is_supported(&self) -> bool {
        self.tag_id != 0 && self.param_id != 0
    }
}

const DETECTION_ENGINE_TAG: u32 = 0xC000_0004;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ModuleConfig {
    pub module_type: ModuleType,
    pub mode: ModelMode,
    /// Wakeup configuration is an opaque client payload instead of the
    /// confidence-level layout.
    pub custom_wakeup: bool,
    pub load_sound_model: ParamIds,
    pub unload_sound_model: ParamIds,
    pub wakeup_config: ParamIds,
    pub buffering_config: ParamIds,
    pub engine_reset: ParamIds,
    pub custom_config: ParamIds,
    /// Ring buffer length. Default: 3000 ms.
    pub ring_buffer_ms: u32,
    /// Shared hardware buffer length; 0 reads through the capture session.
    pub mapped_buffer_ms: u32,
    /// Read size of the buffering loop. Default: 20 ms.
    pub read_chunk_ms: u32,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::for_type(ModuleType::Gmm)
    }
}

impl ModuleConfig {
    pub fn for_type(module_type: ModuleType) -> Self {
        let tag = DETECTION_ENGINE_TAG;
        Self {
            module_type,
            mode: match module_type {
                ModuleType::Pdk => ModelMode::MultiModel,
                _ => ModelMode::Merged,
            },
            custom_wakeup: module_type == ModuleType::Hotword,
            load_sound_model: ParamIds::new(tag, 0x0800_1049),
            unload_sound_model: ParamIds::new(tag, 0x0800_104A),
            wakeup_config: ParamIds::new(tag, 0x0800_104B),
            buffering_config: ParamIds::new(tag, 0x0800_104C),
            engine_reset: ParamIds::new(tag, 0x0800_104D),
            custom_config: ParamIds::new(tag, 0x0800_104E),
            ring_buffer_ms: 3_000,
            mapped_buffer_ms: 0,
            read_chunk_ms: 20,
        }
    }

    pub fn is_multi_model(&self) -> bool {
        self.mode == ModelMode::MultiModel
    }

    pub fn normalize(&mut self) {
        self.ring_buffer_ms = self.ring_buffer_ms.clamp(500, 30_000);
        self.mapped_buffer_ms = self.mapped_buffer_ms.min(10_000);
        self.read_chunk_ms = self.read_chunk_ms.clamp(5, 200);
    }
}

/// What to do when a second-stage verifier runs past its wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum VerificationTimeoutPolicy {
    /// Wait for the verifier to consume its window, however long it takes.
    Unbounded,
    /// Report rejection once `ms` have passed since processing started.
    RejectAfter { ms: u64 },
}

impl Default for VerificationTimeoutPolicy {
    fn default() -> Self {
        VerificationTimeoutPolicy::RejectAfter { ms: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SecondStageConfig {
    /// Audio kept before the reported keyword start. Default: 300 ms.
    pub kw_start_tolerance_ms: u32,
    /// Audio kept after the reported keyword end. Default: 300 ms.
    pub kw_end_tolerance_ms: u32,
    /// Extra trailing audio fed to the verifier. Default: 200 ms.
    pub data_after_kw_end_ms: u32,
    /// Verifier input chunk. Default: 20 ms.
    pub chunk_ms: u32,
    /// Sleep between polls while the writer catches up. Default: 5 ms.
    pub retry_interval_ms: u32,
    pub timeout: VerificationTimeoutPolicy,
}

impl Default for SecondStageConfig {
    fn default() -> Self {
        Self {
            kw_start_tolerance_ms: 300,
            kw_end_tolerance_ms: 300,
            data_after_kw_end_ms: 200,
            chunk_ms: 20,
            retry_interval_ms: 5,
            timeout: VerificationTimeoutPolicy::default(),
        }
    }
}

impl SecondStageConfig {
    pub fn normalize(&mut self) {
        self.kw_start_tolerance_ms = self.kw_start_tolerance_ms.min(2_000);
        self.kw_end_tolerance_ms = self.kw_end_tolerance_ms.min(2_000);
        self.data_after_kw_end_ms = self.data_after_kw_end_ms.min(2_000);
        self.chunk_ms = self.chunk_ms.clamp(5, 200);
        self.retry_interval_ms = self.retry_interval_ms.clamp(1, 100);
        if let VerificationTimeoutPolicy::RejectAfter { ms } = &mut self.timeout {
            *ms = (*ms).clamp(50, 60_000);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlatformConfig {
    pub audio: AudioFormat,
    pub modules: Vec<ModuleConfig>,
    pub second_stage: SecondStageConfig,
    /// Deliver second-stage rejections to the client instead of silently
    /// restarting recognition.
    pub notify_second_stage_failure: bool,
    /// Delay before engines are stopped after a detection the client did not
    /// follow up on. Default: 1000 ms.
    pub deferred_stop_delay_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            audio: AudioFormat::default(),
            modules: vec![
                ModuleConfig::for_type(ModuleType::Gmm),
                ModuleConfig::for_type(ModuleType::Pdk),
                ModuleConfig::for_type(ModuleType::Hotword),
            ],
            second_stage: SecondStageConfig::default(),
            notify_second_stage_failure: false,
            deferred_stop_delay_ms: 1_000,
        }
    }
}

impl PlatformConfig {
    pub fn normalize(&mut self) {
        if !matches!(self.audio.bit_width, 16 | 24 | 32) {
            warn!(bit_width = self.audio.bit_width, "unsupported bit width, using 16");
            self.audio.bit_width = 16;
        }
        self.audio.channels = self.audio.channels.clamp(1, 8);
        self.audio.sample_rate = self.audio.sample_rate.clamp(8_000, 48_000);

        let mut seen = Vec::new();
        self.modules.retain(|m| {
            if seen.contains(&m.module_type) {
                return false;
            }
            seen.push(m.module_type);
            true
        });
        for module in &mut self.modules {
            module.normalize();
        }
        self.second_stage.normalize();
        self.deferred_stop_delay_ms = self.deferred_stop_delay_ms.clamp(10, 10_000);
    }

    pub fn module(&self, module_type: ModuleType) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.module_type == module_type)
    }

    /// Loads and normalizes `path`; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no platform config, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let mut config: PlatformConfig = serde_json::from_str(&raw)?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}
