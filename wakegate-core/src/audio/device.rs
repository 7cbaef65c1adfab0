//! Capture devices and capture profiles.

use serde::{Deserialize, Serialize};

use crate::buffering::format::AudioFormat;
use crate::error::Result;

/// Backend-assigned identifier of an input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// One input device path used by a session.
pub trait CaptureDevice: Send + Sync {
    fn id(&self) -> DeviceId;
    fn open(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// How a device is being captured: format and low-power routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureProfile {
    pub name: String,
    pub device: DeviceId,
    pub format: AudioFormat,
    /// True when the DSP low-power island path is used.
    pub low_power: bool,
}

impl CaptureProfile {
    /// A model loaded under `self` has to be reloaded to run under `next`.
    pub fn requires_reload(&self, next: &CaptureProfile) -> bool {
        self.format != next.format || self.low_power != next.low_power
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(low_power: bool, channels: u16) -> CaptureProfile {
        CaptureProfile {
            name: "handset-mic".into(),
            device: DeviceId(1),
            format: AudioFormat {
                channels,
                ..AudioFormat::default()
            },
            low_power,
        }
    }

    #[test]
    fn format_or_routing_change_requires_reload() {
        assert!(!profile(true, 1).requires_reload(&profile(true, 1)));
        assert!(profile(true, 1).requires_reload(&profile(false, 1)));
        assert!(profile(true, 1).requires_reload(&profile(true, 2)));
    }
}
