//! Process-wide table of shared first-stage engines, one per module type.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::FirstStageEngine;
use crate::audio::CaptureBackend;
use crate::buffering::format::AudioFormat;
use crate::config::{ModuleConfig, ModuleType};
use crate::error::Result;
use crate::model::ModelLibHandle;

#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<HashMap<ModuleType, Arc<FirstStageEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the engine for `module.module_type`, creating it with a fresh
    /// capture session on first use.
    pub fn get_or_create(
        &self,
        module: &ModuleConfig,
        format: AudioFormat,
        backend: &dyn CaptureBackend,
        model_lib: &ModelLibHandle,
    ) -> Result<Arc<FirstStageEngine>> {
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(&module.module_type) {
            return Ok(Arc::clone(engine));
        }
        let capture = backend.create_session(module.module_type)?;
        let engine = Arc::new(FirstStageEngine::new(
            module.clone(),
            format,
            capture,
            model_lib.clone(),
        )?);
        engines.insert(module.module_type, Arc::clone(&engine));
        info!(module = ?module.module_type, "first-stage engine registered");
        Ok(engine)
    }

    pub fn get(&self, module: ModuleType) -> Option<Arc<FirstStageEngine>> {
        self.engines.lock().get(&module).cloned()
    }

    /// Drops the engine for `module` once no session holds it. Returns true
    /// when the engine was removed.
    pub fn release_if_unreferenced(&self, module: ModuleType) -> bool {
        let released = {
            let mut engines = self.engines.lock();
            let unreferenced = engines
                .get(&module)
                .is_some_and(|e| Arc::strong_count(e) == 1 && e.attached_count() == 0);
            if unreferenced {
                engines.remove(&module)
            } else {
                None
            }
        };
        // Dropped outside the table lock; the engine joins its thread.
        match released {
            Some(engine) => {
                drop(engine);
                info!(?module, "first-stage engine released");
                true
            }
            None => {
                debug!(?module, "first-stage engine still referenced");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engines = self.engines.lock();
        f.debug_struct("EngineRegistry")
            .field("modules", &engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{JsonModelLib, LoopbackBackend};

    #[test]
    fn same_module_shares_one_engine() {
        let registry = EngineRegistry::new();
        let backend = LoopbackBackend::new();
        let lib = ModelLibHandle::new(JsonModelLib);
        let module = ModuleConfig::default();

        let a = registry
            .get_or_create(&module, AudioFormat::default(), &backend, &lib)
            .unwrap();
        let b = registry
            .get_or_create(&module, AudioFormat::default(), &backend, &lib)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(backend.sessions_created(), 1);

        let pdk = ModuleConfig::for_type(ModuleType::Pdk);
        registry
            .get_or_create(&pdk, AudioFormat::default(), &backend, &lib)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn release_waits_for_last_reference() {
        let registry = EngineRegistry::new();
        let backend = LoopbackBackend::new();
        let lib = ModelLibHandle::new(JsonModelLib);
        let module = ModuleConfig::default();

        let engine = registry
            .get_or_create(&module, AudioFormat::default(), &backend, &lib)
            .unwrap();
        assert!(!registry.release_if_unreferenced(ModuleType::Gmm));
        drop(engine);
        assert!(registry.release_if_unreferenced(ModuleType::Gmm));
        assert!(registry.is_empty());
        assert!(!registry.release_if_unreferenced(ModuleType::Gmm));
    }
}
