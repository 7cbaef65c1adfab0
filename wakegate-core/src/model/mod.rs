//! Acoustic model metadata and the vendor model-library contract.
//!
//! Model bytes are opaque. Everything the core knows about a model comes from
//! [`SoundModelLib::query_header`]: keyphrases, enrolled users and which
//! user/keyphrase pairs are active. From that header [`SoundModelInfo`] derives
//! the flattened confidence-level layout: one slot per keyphrase, followed by
//! one slot per active user/keyphrase pair in user-major order.

pub mod composite;

pub use composite::CompositeModel;

use std::sync::Arc;

use crate::error::{Result, WakegateError};

/// Confidence value that disables a slot.
pub const MAX_CONF_LEVEL: u8 = 100;

/// Metadata reported by the vendor library for one model blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelHeader {
    pub keyphrases: Vec<String>,
    pub users: Vec<String>,
    /// Number of active user/keyphrase pairs declared by the model.
    pub active_user_keyword_pairs: usize,
    /// `pair_flags[user][keyphrase]` is set when that user is enrolled for
    /// that keyphrase.
    pub pair_flags: Vec<Vec<bool>>,
}

/// Contract for the vendor model library. All operations are pure functions
/// over model byte blobs.
pub trait SoundModelLib: Send + Sync + 'static {
    fn query_header(&self, model: &[u8]) -> Result<ModelHeader>;

    /// Merges models into one composite blob.
    fn merge(&self, models: &[&[u8]]) -> Result<Vec<u8>>;

    /// Byte size the model would have after removing `keyphrase` (or only its
    /// pairing with `user`).
    fn size_after_deleting(&self, model: &[u8], keyphrase: &str, user: Option<&str>)
        -> Result<usize>;

    fn delete_from_model(&self, model: &[u8], keyphrase: &str, user: Option<&str>)
        -> Result<Vec<u8>>;
}

/// Shared handle to any [`SoundModelLib`] implementor.
#[derive(Clone)]
pub struct ModelLibHandle(pub Arc<dyn SoundModelLib>);

impl ModelLibHandle {
    pub fn new<L: SoundModelLib>(lib: L) -> Self {
        Self(Arc::new(lib))
    }
}

impl std::ops::Deref for ModelLibHandle {
    type Target = dyn SoundModelLib;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for ModelLibHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLibHandle").finish_non_exhaustive()
    }
}

/// One confidence slot of a model's flattened level array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfSlot {
    /// `"<keyphrase>"` or `"<keyphrase>/<user>"`; used to match slots across
    /// models.
    pub name: String,
    pub keyphrase: usize,
    pub user: Option<usize>,
}

/// A model blob plus the metadata derived from its header.
#[derive(Debug, Clone, Default)]
pub struct SoundModelInfo {
    data: Vec<u8>,
    keyphrases: Vec<String>,
    users: Vec<String>,
    slots: Vec<ConfSlot>,
    conf_levels: Vec<u8>,
}

impl SoundModelInfo {
    /// Validates `header` and lays out the confidence slots. Every slot starts
    /// disabled.
    pub fn from_header(data: Vec<u8>, header: ModelHeader) -> Result<Self> {
        if header.keyphrases.is_empty() {
            return Err(WakegateError::InvalidModel("model declares no keyphrases".into()));
        }
        if header.active_user_keyword_pairs < header.users.len() {
            return Err(WakegateError::InvalidModel(format!(
                "{} active user/keyphrase pairs for {} users",
                header.active_user_keyword_pairs,
                header.users.len()
            )));
        }
        if !header.users.is_empty() && header.pair_flags.len() != header.users.len() {
            return Err(WakegateError::InvalidModel("missing user/keyphrase pair flags".into()));
        }

        let mut slots: Vec<ConfSlot> = header
            .keyphrases
            .iter()
            .enumerate()
            .map(|(k, name)| ConfSlot {
                name: name.clone(),
                keyphrase: k,
                user: None,
            })
            .collect();
        for (u, flags) in header.pair_flags.iter().enumerate() {
            for (k, enrolled) in flags.iter().enumerate() {
                if !*enrolled {
                    continue;
                }
                let Some(kw) = header.keyphrases.get(k) else {
                    return Err(WakegateError::InvalidModel(format!(
                        "pair flag references keyphrase {k} out of range"
                    )));
                };
                slots.push(ConfSlot {
                    name: format!("{kw}/{}", header.users[u]),
                    keyphrase: k,
                    user: Some(u),
                });
            }
        }

        Ok(Self {
            data,
            conf_levels: vec![MAX_CONF_LEVEL; slots.len()],
            keyphrases: header.keyphrases,
            users: header.users,
            slots,
        })
    }

    /// Queries the header through `lib` and builds the info.
    pub fn parse(lib: &dyn SoundModelLib, data: Vec<u8>) -> Result<Self> {
        let header = lib.query_header(&data).map_err(|e| match e {
            WakegateError::InvalidModel(msg) => WakegateError::InvalidModel(msg),
            other => WakegateError::InvalidModel(other.to_string()),
        })?;
        Self::from_header(data, header)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn keyphrases(&self) -> &[String] {
        &self.keyphrases
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn slots(&self) -> &[ConfSlot] {
        &self.slots
    }

    pub fn conf_levels(&self) -> &[u8] {
        &self.conf_levels
    }

    pub fn num_conf_levels(&self) -> usize {
        self.conf_levels.len()
    }

    pub fn set_conf_levels(&mut self, levels: &[u8]) -> Result<()> {
        if levels.len() != self.conf_levels.len() {
            return Err(WakegateError::InvalidArgument(format!(
                "expected {} confidence levels, got {}",
                self.conf_levels.len(),
                levels.len()
            )));
        }
        self.conf_levels.copy_from_slice(levels);
        Ok(())
    }

    pub fn reset_conf_levels(&mut self) {
        self.conf_levels.fill(MAX_CONF_LEVEL);
    }

    pub(crate) fn set_level_at(&mut self, slot: usize, level: u8) {
        if let Some(l) = self.conf_levels.get_mut(slot) {
            *l = level;
        }
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }
}

/// Keyword/user enable flags derived from confidence levels.
pub fn enables_for(levels: &[u8]) -> Vec<u8> {
    levels
        .iter()
        .map(|&l| u8::from(l != MAX_CONF_LEVEL))
        .collect()
}
