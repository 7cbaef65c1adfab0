//! Energy-based verifier using an RMS threshold and a hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute the RMS of each incoming chunk (16-bit little-endian PCM).
//! 2. If RMS ≥ `rms_threshold` the chunk counts as speech and the hangover
//!    counter is reloaded.
//! 3. If RMS is below threshold but the hangover counter is non-zero, the
//!    chunk still counts as speech and the counter decrements.
//! 4. Confidence is accumulated speech over `min_speech_ms`, capped at 100.
//!    A detection is reported once confidence reaches the threshold param.
//!
//! Used by the simulator and the tests as a stand-in for a vendor keyword or
//! speaker verification library.

use serde::{Deserialize, Serialize};

use super::{Verifier, VerifierFactory, VerifierKind, VerifierParam, VerifierResult};
use crate::error::{Result, WakegateError};

/// Model blob understood by [`EnergyVerifier`], as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnergyModel {
    pub sample_rate: u32,
    /// RMS amplitude in [0, 1] above which a chunk counts as speech.
    pub rms_threshold: f32,
    pub hangover_chunks: u32,
    /// Speech needed for full confidence.
    pub min_speech_ms: u32,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            rms_threshold: 0.02,
            hangover_chunks: 8,
            min_speech_ms: 200,
        }
    }
}

impl EnergyModel {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A simple energy-based verifier.
#[derive(Debug, Clone)]
pub struct EnergyVerifier {
    model: Option<EnergyModel>,
    threshold: u32,
    kw_start: u32,
    kw_end: u32,
    speech_samples: u64,
    hangover_counter: u32,
}

impl EnergyVerifier {
    pub fn new() -> Self {
        Self {
            model: None,
            threshold: 60,
            kw_start: 0,
            kw_end: 0,
            speech_samples: 0,
            hangover_counter: 0,
        }
    }

    /// Root-mean-square of 16-bit little-endian PCM, normalised to [0, 1].
    fn rms(pcm: &[u8]) -> f32 {
        let samples = pcm.len() / 2;
        if samples == 0 {
            return 0.0;
        }
        let sum_sq: f32 = pcm
            .chunks_exact(2)
            .map(|b| {
                let s = f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0;
                s * s
            })
            .sum();
        (sum_sq / samples as f32).sqrt()
    }

    fn confidence(&self, model: &EnergyModel) -> u32 {
        let needed = u64::from(model.min_speech_ms) * u64::from(model.sample_rate) / 1_000;
        if needed == 0 {
            return 100;
        }
        (self.speech_samples * 100 / needed).min(100) as u32
    }
}

impl Default for EnergyVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier for EnergyVerifier {
    /// An empty blob selects the default model.
    fn init(&mut self, model: &[u8]) -> Result<()> {
        let parsed = if model.is_empty() {
            EnergyModel::default()
        } else {
            serde_json::from_slice(model)
                .map_err(|e| WakegateError::Verifier(format!("unreadable energy model: {e}")))?
        };
        if !(0.0..=1.0).contains(&parsed.rms_threshold) || parsed.sample_rate == 0 {
            return Err(WakegateError::Verifier(format!("energy model out of range: {parsed:?}")));
        }
        self.model = Some(parsed);
        self.reset();
        Ok(())
    }

    fn process(&mut self, pcm: &[u8]) -> Result<VerifierResult> {
        let model = self
            .model
            .ok_or_else(|| WakegateError::Verifier("process before init".into()))?;

        let samples = (pcm.len() / 2) as u64;
        if Self::rms(pcm) >= model.rms_threshold {
            self.hangover_counter = model.hangover_chunks;
            self.speech_samples += samples;
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            self.speech_samples += samples;
        }

        let confidence = self.confidence(&model);
        Ok(VerifierResult {
            detected: confidence >= self.threshold,
            confidence,
        })
    }

    fn get_param(&self, param: VerifierParam) -> Result<u32> {
        Ok(match param {
            VerifierParam::Threshold => self.threshold,
            VerifierParam::KeywordStart => self.kw_start,
            VerifierParam::KeywordEnd => self.kw_end,
        })
    }

    fn set_param(&mut self, param: VerifierParam, value: u32) -> Result<()> {
        match param {
            VerifierParam::Threshold => {
                if value > 100 {
                    return Err(WakegateError::Verifier(format!("threshold {value} above 100")));
                }
                self.threshold = value;
            }
            VerifierParam::KeywordStart => self.kw_start = value,
            VerifierParam::KeywordEnd => self.kw_end = value,
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.speech_samples = 0;
        self.hangover_counter = 0;
    }

    fn end(&mut self) -> Result<()> {
        self.model = None;
        self.reset();
        Ok(())
    }
}

/// Hands out an [`EnergyVerifier`] for every kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyVerifierFactory;

impl VerifierFactory for EnergyVerifierFactory {
    fn create(&self, _kind: VerifierKind) -> Result<Box<dyn Verifier>> {
        Ok(Box::new(EnergyVerifier::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(amplitude: i16, samples: usize) -> Vec<u8> {
        (0..samples).flat_map(|_| amplitude.to_le_bytes()).collect()
    }

    fn verifier(model: EnergyModel) -> EnergyVerifier {
        let mut v = EnergyVerifier::new();
        v.init(&model.encode()).unwrap();
        v
    }

    #[test]
    fn silence_never_detects() {
        let mut v = verifier(EnergyModel::default());
        for _ in 0..20 {
            let r = v.process(&pcm(0, 320)).unwrap();
            assert!(!r.detected);
            assert_eq!(r.confidence, 0);
        }
    }

    #[test]
    fn sustained_speech_reaches_threshold() {
        let mut v = verifier(EnergyModel {
            hangover_chunks: 0,
            ..EnergyModel::default()
        });
        v.set_param(VerifierParam::Threshold, 50).unwrap();
        // 20 ms chunks, 200 ms for full confidence.
        let first = v.process(&pcm(8_000, 320)).unwrap();
        assert_eq!(first.confidence, 10);
        assert!(!first.detected);
        for _ in 0..3 {
            v.process(&pcm(8_000, 320)).unwrap();
        }
        let fifth = v.process(&pcm(8_000, 320)).unwrap();
        assert_eq!(fifth.confidence, 50);
        assert!(fifth.detected);
    }

    #[test]
    fn hangover_counts_trailing_quiet_chunks() {
        let mut v = verifier(EnergyModel {
            hangover_chunks: 2,
            ..EnergyModel::default()
        });
        v.process(&pcm(8_000, 320)).unwrap();
        v.process(&pcm(0, 320)).unwrap();
        v.process(&pcm(0, 320)).unwrap();
        let after = v.process(&pcm(0, 320)).unwrap();
        assert_eq!(after.confidence, 30);
    }

    #[test]
    fn reset_drops_accumulated_speech() {
        let mut v = verifier(EnergyModel::default());
        v.process(&pcm(8_000, 1_600)).unwrap();
        v.reset();
        assert_eq!(v.process(&pcm(0, 320)).unwrap().confidence, 0);
    }

    #[test]
    fn process_before_init_fails() {
        let mut v = EnergyVerifier::new();
        assert!(v.process(&pcm(0, 10)).is_err());
        v.init(&[]).unwrap();
        assert!(v.process(&pcm(0, 10)).is_ok());
        v.end().unwrap();
        assert!(v.process(&pcm(0, 10)).is_err());
    }

    #[test]
    fn threshold_above_100_is_rejected() {
        let mut v = EnergyVerifier::new();
        assert!(v.set_param(VerifierParam::Threshold, 101).is_err());
        v.set_param(VerifierParam::KeywordEnd, 9_600).unwrap();
        assert_eq!(v.get_param(VerifierParam::KeywordEnd).unwrap(), 9_600);
    }

    #[test]
    fn rms_of_full_scale_square_wave() {
        let samples: Vec<u8> = (0..256)
            .flat_map(|i| (if i % 2 == 0 { 16_384i16 } else { -16_384 }).to_le_bytes())
            .collect();
        let rms = EnergyVerifier::rms(&samples);
        assert!((rms - 0.5).abs() < 1e-5, "rms={rms}");
    }
}
