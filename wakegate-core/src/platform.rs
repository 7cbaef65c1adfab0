//! Process-wide entry point: owns the collaborators every session shares and
//! fans platform events (subsystem restart, device routing, concurrent
//! streams) out to the live sessions.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::{CaptureBackend, DeviceId};
use crate::config::PlatformConfig;
use crate::engine::EngineRegistry;
use crate::error::Result;
use crate::model::ModelLibHandle;
use crate::session::{SessionInner, SoundTriggerSession};
use crate::verifier::VerifierFactory;

/// Shared by every session of one [`Platform`].
pub(crate) struct PlatformContext {
    pub(crate) config: PlatformConfig,
    pub(crate) backend: Arc<dyn CaptureBackend>,
    pub(crate) model_lib: ModelLibHandle,
    pub(crate) verifiers: Arc<dyn VerifierFactory>,
    pub(crate) registry: Arc<EngineRegistry>,
}

pub struct Platform {
    ctx: Arc<PlatformContext>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
}

impl Platform {
    pub fn new(
        mut config: PlatformConfig,
        backend: Arc<dyn CaptureBackend>,
        model_lib: ModelLibHandle,
        verifiers: Arc<dyn VerifierFactory>,
    ) -> Self {
        config.normalize();
        info!(
            modules = config.modules.len(),
            sample_rate = config.audio.sample_rate,
            "platform initialised"
        );
        Self {
            ctx: Arc::new(PlatformContext {
                config,
                backend,
                model_lib,
                verifiers,
                registry: Arc::new(EngineRegistry::new()),
            }),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.ctx.registry
    }

    pub fn open_session(&self) -> Result<SoundTriggerSession> {
        let session = SoundTriggerSession::open(Arc::clone(&self.ctx))?;
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(session.downgrade());
        Ok(session)
    }

    pub fn session_count(&self) -> usize {
        self.live_sessions().len()
    }

    /// The audio subsystem went down. Every session tears its engines down
    /// and remembers what to rebuild.
    pub fn ssr_offline(&self) {
        let sessions = self.live_sessions();
        info!(sessions = sessions.len(), "subsystem offline");
        for session in sessions {
            session.on_ssr_offline();
        }
    }

    /// The audio subsystem is back. Sessions reload and restart as needed.
    pub fn ssr_online(&self) {
        let sessions = self.live_sessions();
        info!(sessions = sessions.len(), "subsystem online");
        for session in sessions {
            session.on_ssr_online();
        }
    }

    pub fn device_connected(&self, device: DeviceId) {
        for session in self.live_sessions() {
            if let Err(e) = session.on_device_connected(device) {
                warn!(%device, error = %e, "device connect handling failed");
            }
        }
    }

    pub fn device_disconnected(&self, device: DeviceId) {
        for session in self.live_sessions() {
            if let Err(e) = session.on_device_disconnected(device) {
                warn!(%device, error = %e, "device disconnect handling failed");
            }
        }
    }

    /// Another stream started (`active`) or stopped on the shared input path.
    pub fn concurrent_stream(&self, active: bool) {
        for session in self.live_sessions() {
            if let Err(e) = session.on_concurrent_stream(active) {
                warn!(active, error = %e, "concurrent stream handling failed");
            }
        }
    }

    /// Upgraded outside the table lock so session work never runs under it.
    fn live_sessions(&self) -> Vec<Arc<SessionInner>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{JsonModelLib, LoopbackBackend};
    use crate::verifier::EnergyVerifierFactory;

    fn platform() -> Platform {
        Platform::new(
            PlatformConfig::default(),
            Arc::new(LoopbackBackend::new()),
            ModelLibHandle::new(JsonModelLib),
            Arc::new(EnergyVerifierFactory),
        )
    }

    #[test]
    fn dropped_sessions_are_forgotten() {
        let platform = platform();
        let a = platform.open_session().unwrap();
        let b = platform.open_session().unwrap();
        assert_eq!(platform.session_count(), 2);
        assert_ne!(a.id(), b.id());
        drop(a);
        assert_eq!(platform.session_count(), 1);
    }

    #[test]
    fn events_without_sessions_are_harmless() {
        let platform = platform();
        platform.ssr_offline();
        platform.ssr_online();
        platform.device_connected(DeviceId(3));
        platform.concurrent_stream(true);
        assert!(platform.registry().is_empty());
    }

    #[test]
    fn config_is_normalized() {
        let config = PlatformConfig {
            deferred_stop_delay_ms: 0,
            ..PlatformConfig::default()
        };
        let platform = Platform::new(
            config,
            Arc::new(LoopbackBackend::new()),
            ModelLibHandle::new(JsonModelLib),
            Arc::new(EnergyVerifierFactory),
        );
        assert_eq!(platform.config().deferred_stop_delay_ms, 10);
    }
}
