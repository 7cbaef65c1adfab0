//! Composite model book-keeping for a shared first-stage engine.
//!
//! Exactly one model is resident at a time. With one attached session it is
//! that session's own model; with more it is the vendor merge of all of them.
//! The composite confidence array follows the resident model's slot layout
//! and is reconciled against each session's own levels by slot name.
//!
//! Size invariant: a merge never yields a smaller blob than the previous
//! composite and a delete never yields a larger one. A violation aborts the
//! operation with [`WakegateError::MergeSizeInvariantViolation`] and leaves the
//! previous composite in place.

use tracing::{debug, info, warn};

use super::{ModelLibHandle, SoundModelInfo, MAX_CONF_LEVEL};
use crate::engine::SessionId;
use crate::error::{Result, WakegateError};

#[derive(Debug)]
pub struct CompositeModel {
    lib: ModelLibHandle,
    /// Per-session models in attach order.
    sessions: Vec<(SessionId, SoundModelInfo)>,
    resident: Option<SoundModelInfo>,
    merged: bool,
}

impl CompositeModel {
    pub fn new(lib: ModelLibHandle) -> Self {
        Self {
            lib,
            sessions: Vec::new(),
            resident: None,
            merged: false,
        }
    }

    pub fn resident(&self) -> Option<&SoundModelInfo> {
        self.resident.as_ref()
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|(s, _)| *s == id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.iter().map(|(s, _)| *s)
    }

    pub fn session_model(&self, id: SessionId) -> Option<&SoundModelInfo> {
        self.sessions.iter().find(|(s, _)| *s == id).map(|(_, m)| m)
    }

    fn session_model_mut(&mut self, id: SessionId) -> Option<&mut SoundModelInfo> {
        self.sessions
            .iter_mut()
            .find(|(s, _)| *s == id)
            .map(|(_, m)| m)
    }

    /// Registers `data` for `id` and folds it into the resident model.
    pub fn add_model(&mut self, id: SessionId, data: &[u8]) -> Result<()> {
        if self.contains(id) {
            debug!(session = %id, "model already registered");
            return Ok(());
        }
        let info = SoundModelInfo::parse(&*self.lib, data.to_vec())?;

        match &self.resident {
            None => {
                self.resident = Some(info.clone());
                self.merged = false;
            }
            Some(current) => {
                let merged = self
                    .lib
                    .merge(&[current.data(), data])
                    .map_err(|e| WakegateError::MergeFailed(e.to_string()))?;
                let merged = SoundModelInfo::parse(&*self.lib, merged)?;
                if merged.size() < current.size() {
                    warn!(
                        previous = current.size(),
                        produced = merged.size(),
                        "merged model shrank, keeping previous composite"
                    );
                    return Err(WakegateError::MergeSizeInvariantViolation {
                        previous: current.size(),
                        produced: merged.size(),
                    });
                }
                info!(
                    session = %id,
                    size = merged.size(),
                    keyphrases = merged.keyphrases().len(),
                    "models merged"
                );
                self.resident = Some(merged);
                self.merged = true;
            }
        }
        self.sessions.push((id, info));
        Ok(())
    }

    /// Removes `id`'s contribution from the resident model.
    pub fn delete_model(&mut self, id: SessionId) -> Result<()> {
        let Some(pos) = self.sessions.iter().position(|(s, _)| *s == id) else {
            return Ok(());
        };

        match self.sessions.len() - 1 {
            0 => {
                self.sessions.clear();
                self.resident = None;
                self.merged = false;
                return Ok(());
            }
            1 => {
                self.sessions.remove(pos);
                self.resident = self.sessions.first().map(|(_, m)| m.clone());
                self.merged = false;
                return Ok(());
            }
            _ => {}
        }

        let current = self
            .resident
            .as_ref()
            .ok_or_else(|| WakegateError::invalid_state("delete_model", "no resident model"))?;
        let departing = &self.sessions[pos].1;

        let mut model = current.data().to_vec();
        let mut reduced: Option<SoundModelInfo> = None;
        for kw in departing.keyphrases() {
            let shared = self
                .sessions
                .iter()
                .any(|(s, m)| *s != id && m.keyphrases().contains(kw));
            if shared {
                debug!(keyphrase = %kw, "keyphrase still owned by another session, kept");
                continue;
            }

            let expected = self
                .lib
                .size_after_deleting(&model, kw, None)
                .map_err(|e| WakegateError::MergeFailed(e.to_string()))?;
            if expected >= model.len() {
                return Err(WakegateError::MergeSizeInvariantViolation {
                    previous: model.len(),
                    produced: expected,
                });
            }
            let out = self
                .lib
                .delete_from_model(&model, kw, None)
                .map_err(|e| WakegateError::MergeFailed(e.to_string()))?;
            if out.len() != expected {
                return Err(WakegateError::MergeFailed(format!(
                    "deleting {kw} produced {} bytes, expected {expected}",
                    out.len()
                )));
            }
            let info = SoundModelInfo::parse(&*self.lib, out)?;
            model = info.data().to_vec();
            reduced = Some(info);
        }

        let reduced = match reduced {
            Some(r) => r,
            None => SoundModelInfo::parse(&*self.lib, model)?,
        };
        if reduced.size() > current.size() {
            return Err(WakegateError::MergeSizeInvariantViolation {
                previous: current.size(),
                produced: reduced.size(),
            });
        }

        info!(session = %id, size = reduced.size(), "model removed from composite");
        self.sessions.remove(pos);
        self.resident = Some(reduced);
        self.merged = true;
        Ok(())
    }

    /// Stores `id`'s own configured levels (in its model's slot layout).
    pub fn set_session_conf_levels(&mut self, id: SessionId, levels: &[u8]) -> Result<()> {
        self.session_model_mut(id)
            .ok_or_else(|| WakegateError::InvalidArgument(format!("no model for session {id}")))?
            .set_conf_levels(levels)
    }

    /// Writes `id`'s slots of the composite array: its configured levels when
    /// `apply`, the disabled value otherwise.
    pub fn reconcile_conf_levels(&mut self, id: SessionId, apply: bool) -> Result<()> {
        let src = self
            .session_model(id)
            .ok_or_else(|| WakegateError::InvalidArgument(format!("no model for session {id}")))?
            .clone();
        let merged = self.merged;
        let resident = self
            .resident
            .as_mut()
            .ok_or_else(|| WakegateError::invalid_state("reconcile_conf_levels", "no resident model"))?;

        if !merged {
            if apply {
                resident.set_conf_levels(src.conf_levels())?;
            } else {
                resident.reset_conf_levels();
            }
            return Ok(());
        }

        if src.num_conf_levels() > resident.num_conf_levels() {
            return Err(WakegateError::InvalidArgument(format!(
                "session has {} confidence slots, composite only {}",
                src.num_conf_levels(),
                resident.num_conf_levels()
            )));
        }
        for (slot, level) in src.slots().iter().zip(src.conf_levels()) {
            let Some(j) = resident.slot_index(&slot.name) else {
                continue;
            };
            resident.set_level_at(j, if apply { *level } else { MAX_CONF_LEVEL });
        }
        Ok(())
    }

    /// Applies the configured levels of every session in `active`.
    pub fn apply_active_conf_levels(&mut self, active: &[SessionId]) -> Result<()> {
        for id in active {
            if self.contains(*id) {
                self.reconcile_conf_levels(*id, true)?;
            }
        }
        Ok(())
    }

    /// Finds the session owning the first non-zero keyphrase slot of a merged
    /// detection. Only sessions for which `eligible` holds are considered.
    pub fn owner_of_detection(
        &self,
        levels: &[u32],
        eligible: impl Fn(SessionId) -> bool,
    ) -> Result<Option<SessionId>> {
        let resident = self
            .resident
            .as_ref()
            .ok_or_else(|| WakegateError::invalid_state("owner_of_detection", "no resident model"))?;
        let num_kw = resident.keyphrases().len();
        if levels.len() < num_kw {
            return Err(WakegateError::InvalidPayload(format!(
                "{} confidence values for {num_kw} keyphrases",
                levels.len()
            )));
        }
        let Some(slot) = levels[..num_kw].iter().position(|l| *l != 0) else {
            return Ok(None);
        };
        let keyphrase = &resident.keyphrases()[slot];
        Ok(self
            .sessions
            .iter()
            .find(|(s, m)| eligible(*s) && m.keyphrases().contains(keyphrase))
            .map(|(s, _)| *s))
    }

    /// Projects composite detection levels onto `id`'s own slot layout.
    pub fn session_levels(&self, id: SessionId, composite: &[u32]) -> Vec<u32> {
        let Some(own) = self.session_model(id) else {
            return Vec::new();
        };
        if !self.merged {
            return composite.to_vec();
        }
        let Some(resident) = self.resident.as_ref() else {
            return Vec::new();
        };
        own.slots()
            .iter()
            .map(|slot| {
                resident
                    .slot_index(&slot.name)
                    .and_then(|j| composite.get(j).copied())
                    .unwrap_or(0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelHeader, SoundModelLib};
    use crate::sim::JsonModelLib;

    fn lib() -> ModelLibHandle {
        ModelLibHandle::new(JsonModelLib)
    }

    fn kws(model: &CompositeModel) -> Vec<String> {
        model.resident().map(|r| r.keyphrases().to_vec()).unwrap_or_default()
    }

    #[test]
    fn first_model_is_resident_unmerged() {
        let mut c = CompositeModel::new(lib());
        let a = JsonModelLib::encode(&["alexa"], &[], &[]);
        c.add_model(SessionId(1), &a).unwrap();
        assert!(!c.is_merged());
        assert_eq!(c.resident().unwrap().data(), a.as_slice());
    }

    #[test]
    fn merge_then_delete_restores_first_model() {
        let mut c = CompositeModel::new(lib());
        let a = JsonModelLib::encode(&["alexa"], &["ann"], &[(0, 0)]);
        let b = JsonModelLib::encode(&["jarvis", "computer"], &[], &[]);
        c.add_model(SessionId(1), &a).unwrap();
        c.add_model(SessionId(2), &b).unwrap();
        assert!(c.is_merged());
        assert_eq!(kws(&c), ["alexa", "jarvis", "computer"]);

        // A third session forces the stepwise delete path.
        let d = JsonModelLib::encode(&["hal"], &[], &[]);
        c.add_model(SessionId(3), &d).unwrap();
        let before = c.resident().unwrap().size();
        c.delete_model(SessionId(2)).unwrap();
        assert_eq!(kws(&c), ["alexa", "hal"]);
        assert!(c.resident().unwrap().size() <= before);

        c.delete_model(SessionId(3)).unwrap();
        assert!(!c.is_merged());
        assert_eq!(kws(&c), ["alexa"]);
        assert!(c.resident().unwrap().size() <= a.len());
    }

    #[test]
    fn merged_delete_matches_single_model_size() {
        let mut c = CompositeModel::new(lib());
        let a = JsonModelLib::encode(&["alexa"], &[], &[]);
        let b = JsonModelLib::encode(&["jarvis"], &[], &[]);
        let d = JsonModelLib::encode(&["hal"], &[], &[]);
        c.add_model(SessionId(1), &a).unwrap();
        c.add_model(SessionId(2), &b).unwrap();
        c.add_model(SessionId(3), &d).unwrap();
        c.delete_model(SessionId(3)).unwrap();
        c.delete_model(SessionId(2)).unwrap();
        assert_eq!(kws(&c), ["alexa"]);
        assert_eq!(c.resident().unwrap().size(), a.len());
    }

    struct ShrinkingMerge;

    impl SoundModelLib for ShrinkingMerge {
        fn query_header(&self, model: &[u8]) -> Result<ModelHeader> {
            JsonModelLib.query_header(model)
        }

        fn merge(&self, _models: &[&[u8]]) -> Result<Vec<u8>> {
            Ok(JsonModelLib::encode(&["x"], &[], &[]))
        }

        fn size_after_deleting(&self, m: &[u8], k: &str, u: Option<&str>) -> Result<usize> {
            JsonModelLib.size_after_deleting(m, k, u)
        }

        fn delete_from_model(&self, m: &[u8], k: &str, u: Option<&str>) -> Result<Vec<u8>> {
            JsonModelLib.delete_from_model(m, k, u)
        }
    }

    #[test]
    fn shrinking_merge_keeps_previous_composite() {
        let mut c = CompositeModel::new(ModelLibHandle::new(ShrinkingMerge));
        let a = JsonModelLib::encode(&["a-rather-long-keyphrase"], &[], &[]);
        c.add_model(SessionId(1), &a).unwrap();
        let err = c
            .add_model(SessionId(2), &JsonModelLib::encode(&["b"], &[], &[]))
            .unwrap_err();
        assert!(matches!(err, WakegateError::MergeSizeInvariantViolation { .. }));
        assert_eq!(c.resident().unwrap().data(), a.as_slice());
        assert_eq!(c.session_count(), 1);
    }

    #[test]
    fn invalid_model_is_rejected() {
        let mut c = CompositeModel::new(lib());
        let err = c.add_model(SessionId(1), b"not a model").unwrap_err();
        assert!(matches!(err, WakegateError::InvalidModel(_)));
        assert!(c.resident().is_none());
    }

    #[test]
    fn stopped_session_slots_are_disabled() {
        let mut c = CompositeModel::new(lib());
        c.add_model(SessionId(1), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        c.add_model(SessionId(2), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();
        c.set_session_conf_levels(SessionId(1), &[60]).unwrap();
        c.set_session_conf_levels(SessionId(2), &[70]).unwrap();
        c.apply_active_conf_levels(&[SessionId(1), SessionId(2)])
            .unwrap();
        assert_eq!(c.resident().unwrap().conf_levels(), [60, 70]);

        c.reconcile_conf_levels(SessionId(1), false).unwrap();
        assert_eq!(c.resident().unwrap().conf_levels(), [MAX_CONF_LEVEL, 70]);

        c.reconcile_conf_levels(SessionId(1), true).unwrap();
        assert_eq!(c.resident().unwrap().conf_levels(), [60, 70]);
    }

    #[test]
    fn detection_owner_follows_nonzero_slot() {
        let mut c = CompositeModel::new(lib());
        c.add_model(SessionId(1), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        c.add_model(SessionId(2), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();
        assert_eq!(
            c.owner_of_detection(&[0, 88], |_| true).unwrap(),
            Some(SessionId(2))
        );
        assert_eq!(c.owner_of_detection(&[0, 88], |s| s != SessionId(2)).unwrap(), None);
        assert!(c.owner_of_detection(&[5], |_| true).is_err());
        assert_eq!(c.session_levels(SessionId(2), &[0, 88]), vec![88]);
    }
}
