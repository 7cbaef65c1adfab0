//! PCM format description and byte/time conversions.

use serde::{Deserialize, Serialize};

/// Interleaved integer PCM layout of the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g. 16000, 48000).
    pub sample_rate: u32,
    /// Bits per sample (16, 24 or 32).
    pub bit_width: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bit_width: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Size of one interleaved frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels.max(1)) * usize::from(self.bit_width / 8).max(1)
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.frame_bytes() as u64
    }

    /// Converts a duration in microseconds to a frame-aligned byte count.
    pub fn us_to_bytes(&self, us: u64) -> usize {
        let frames = us.saturating_mul(u64::from(self.sample_rate)) / 1_000_000;
        frames as usize * self.frame_bytes()
    }

    pub fn ms_to_bytes(&self, ms: u64) -> usize {
        self.us_to_bytes(ms.saturating_mul(1_000))
    }

    /// Converts a byte count back to whole milliseconds of audio.
    pub fn bytes_to_ms(&self, bytes: usize) -> u64 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return 0;
        }
        bytes as u64 * 1_000 / bps
    }

    pub fn frames_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.frame_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_16k_mono_s16() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.frame_bytes(), 2);
        assert_eq!(fmt.bytes_per_second(), 32_000);
    }

    #[test]
    fn us_to_bytes_is_frame_aligned() {
        let fmt = AudioFormat {
            sample_rate: 16_000,
            bit_width: 16,
            channels: 2,
        };
        assert_eq!(fmt.us_to_bytes(1_000_000), 64_000);
        // 70 us is one whole frame at 16 kHz (62.5 us per frame)
        assert_eq!(fmt.us_to_bytes(70), 4);
    }

    #[test]
    fn ms_round_trip() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.bytes_to_ms(fmt.ms_to_bytes(250)), 250);
    }
}
