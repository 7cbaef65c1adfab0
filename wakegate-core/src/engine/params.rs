//! First-stage parameter payloads.
//!
//! Every push is `{module_instance_id, param_id, param_size, error_code}`
//! followed by the parameter data, zero-padded to 8 bytes. Integers are
//! little-endian.

use crate::config::{ModuleConfig, ParamIds};

/// Parameter classes pushed to the DSP module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    LoadSoundModel,
    UnloadSoundModel,
    WakeupConfig,
    BufferingConfig,
    EngineReset,
    CustomConfig,
}

impl ParamClass {
    pub fn ids(self, module: &ModuleConfig) -> ParamIds {
        match self {
            ParamClass::LoadSoundModel => module.load_sound_model,
            ParamClass::UnloadSoundModel => module.unload_sound_model,
            ParamClass::WakeupConfig => module.wakeup_config,
            ParamClass::BufferingConfig => module.buffering_config,
            ParamClass::EngineReset => module.engine_reset,
            ParamClass::CustomConfig => module.custom_config,
        }
    }
}

pub const PARAM_HEADER_LEN: usize = 16;

/// Wraps `data` in the module parameter header.
pub fn wrap_param(module_instance_id: u32, param_id: u32, data: &[u8]) -> Vec<u8> {
    let padded = (data.len() + 7) & !7;
    let mut out = Vec::with_capacity(PARAM_HEADER_LEN + padded);
    out.extend_from_slice(&module_instance_id.to_le_bytes());
    out.extend_from_slice(&param_id.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(data);
    out.resize(PARAM_HEADER_LEN + padded, 0);
    out
}

/// Merged-mode wakeup configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WakeupConfig {
    pub mode: u16,
    pub custom_payload_size: u16,
    pub num_active_models: u8,
    pub conf_levels: Vec<u8>,
    pub enables: Vec<u8>,
}

impl WakeupConfig {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 2 * self.conf_levels.len());
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.custom_payload_size.to_le_bytes());
        out.push(self.num_active_models);
        out.push(0);
        out.extend_from_slice(&self.conf_levels);
        out.extend_from_slice(&self.enables);
        out
    }
}

/// Multi-model wakeup configuration for one registered model.
pub fn encode_model_wakeup(model_id: u32, mode: u32, conf_levels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 4 * conf_levels.len());
    for w in [model_id, mode, 0, conf_levels.len() as u32] {
        out.extend_from_slice(&w.to_le_bytes());
    }
    for level in conf_levels {
        out.extend_from_slice(&u32::from(*level).to_le_bytes());
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferingConfig {
    pub hist_ms: u32,
    pub pre_roll_ms: u32,
}

impl BufferingConfig {
    /// Multi-model modules prefix the model id.
    pub fn encode(&self, model_id: Option<u32>) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        if let Some(id) = model_id {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&self.hist_ms.to_le_bytes());
        out.extend_from_slice(&self.pre_roll_ms.to_le_bytes());
        out
    }
}

pub fn encode_register(model_id: u32, model: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + model.len());
    out.extend_from_slice(&model_id.to_le_bytes());
    out.extend_from_slice(&(model.len() as u32).to_le_bytes());
    out.extend_from_slice(model);
    out
}

pub fn encode_deregister(model_id: u32) -> Vec<u8> {
    model_id.to_le_bytes().to_vec()
}

/// Splits a wrapped parameter back into `(module_instance_id, param_id, data)`.
pub fn unwrap_param(payload: &[u8]) -> Option<(u32, u32, &[u8])> {
    let word = |i: usize| -> Option<u32> {
        let b = payload.get(i * 4..i * 4 + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };
    let miid = word(0)?;
    let param_id = word(1)?;
    let size = word(2)? as usize;
    let data = payload.get(PARAM_HEADER_LEN..PARAM_HEADER_LEN + size)?;
    Some((miid, param_id, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_is_padded_to_eight_bytes() {
        let wrapped = wrap_param(0x11, 0x22, &[1, 2, 3]);
        assert_eq!(wrapped.len(), PARAM_HEADER_LEN + 8);
        assert_eq!(unwrap_param(&wrapped), Some((0x11, 0x22, &[1u8, 2, 3][..])));
    }

    #[test]
    fn wakeup_layout() {
        let cfg = WakeupConfig {
            mode: 1,
            custom_payload_size: 0,
            num_active_models: 2,
            conf_levels: vec![60, 100],
            enables: vec![1, 0],
        };
        assert_eq!(cfg.encode(), vec![1, 0, 0, 0, 2, 0, 60, 100, 1, 0]);
    }

    #[test]
    fn buffering_layout_with_model_id() {
        let cfg = BufferingConfig {
            hist_ms: 1_500,
            pre_roll_ms: 250,
        };
        assert_eq!(cfg.encode(None).len(), 8);
        let with_id = cfg.encode(Some(9));
        assert_eq!(&with_id[..4], &9u32.to_le_bytes());
        assert_eq!(&with_id[4..8], &1_500u32.to_le_bytes());
    }

    #[test]
    fn model_wakeup_uses_word_levels() {
        let data = encode_model_wakeup(3, 1, &[70]);
        assert_eq!(data.len(), 20);
        assert_eq!(&data[16..], &70u32.to_le_bytes());
    }
}
