//! `JsonModelLib`: model library over a readable JSON model format.
//!
//! A model is `{"keyphrases": [...], "users": [...], "pairs": [[user, kw], ...]}`.
//! Merging takes the union in first-seen order; deleting a keyphrase drops
//! its pairs and any user left without pairs. Encoding is canonical, so a
//! merge followed by deleting the merged-in keyphrases reproduces the
//! original bytes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WakegateError};
use crate::model::{ModelHeader, SoundModelLib};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JsonModel {
    keyphrases: Vec<String>,
    users: Vec<String>,
    /// `(user index, keyphrase index)`
    pairs: Vec<(usize, usize)>,
}

impl JsonModel {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let model: JsonModel = serde_json::from_slice(bytes)
            .map_err(|e| WakegateError::InvalidModel(format!("unreadable model: {e}")))?;
        for (u, k) in &model.pairs {
            if *u >= model.users.len() || *k >= model.keyphrases.len() {
                return Err(WakegateError::InvalidModel(format!("pair ({u}, {k}) out of range")));
            }
        }
        Ok(model)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn index_of(list: &mut Vec<String>, name: &str) -> usize {
        match list.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                list.push(name.to_string());
                list.len() - 1
            }
        }
    }

    fn absorb(&mut self, other: &JsonModel) {
        for kw in &other.keyphrases {
            Self::index_of(&mut self.keyphrases, kw);
        }
        for user in &other.users {
            Self::index_of(&mut self.users, user);
        }
        for (u, k) in &other.pairs {
            let user = Self::index_of(&mut self.users, &other.users[*u]);
            let kw = Self::index_of(&mut self.keyphrases, &other.keyphrases[*k]);
            if !self.pairs.contains(&(user, kw)) {
                self.pairs.push((user, kw));
            }
        }
    }

    fn without(&self, keyphrase: &str, user: Option<&str>) -> Result<JsonModel> {
        let kw = self
            .keyphrases
            .iter()
            .position(|k| k == keyphrase)
            .ok_or_else(|| WakegateError::InvalidArgument(format!("keyphrase {keyphrase} not in model")))?;

        let mut out = self.clone();
        match user {
            Some(name) => {
                let u = self
                    .users
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| WakegateError::InvalidArgument(format!("user {name} not in model")))?;
                out.pairs.retain(|p| *p != (u, kw));
            }
            None => {
                out.keyphrases.remove(kw);
                out.pairs.retain(|(_, k)| *k != kw);
                for (_, k) in &mut out.pairs {
                    if *k > kw {
                        *k -= 1;
                    }
                }
            }
        }

        // Drop users left without any pair.
        let mut u = 0;
        while u < out.users.len() {
            if out.pairs.iter().any(|(pu, _)| *pu == u) {
                u += 1;
                continue;
            }
            out.users.remove(u);
            for (pu, _) in &mut out.pairs {
                if *pu > u {
                    *pu -= 1;
                }
            }
        }
        Ok(out)
    }
}

/// Stateless JSON-backed [`SoundModelLib`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModelLib;

impl JsonModelLib {
    /// Encodes a model; `pairs` are `(user index, keyphrase index)`.
    pub fn encode(keyphrases: &[&str], users: &[&str], pairs: &[(usize, usize)]) -> Vec<u8> {
        let model = JsonModel {
            keyphrases: keyphrases.iter().map(|s| s.to_string()).collect(),
            users: users.iter().map(|s| s.to_string()).collect(),
            pairs: pairs.to_vec(),
        };
        model.encode().unwrap_or_default()
    }
}

impl SoundModelLib for JsonModelLib {
    fn query_header(&self, model: &[u8]) -> Result<ModelHeader> {
        let m = JsonModel::decode(model)?;
        let mut pair_flags = vec![vec![false; m.keyphrases.len()]; m.users.len()];
        for (u, k) in &m.pairs {
            pair_flags[*u][*k] = true;
        }
        Ok(ModelHeader {
            active_user_keyword_pairs: m.pairs.len(),
            keyphrases: m.keyphrases,
            users: m.users,
            pair_flags,
        })
    }

    fn merge(&self, models: &[&[u8]]) -> Result<Vec<u8>> {
        let mut merged = JsonModel::default();
        for bytes in models {
            merged.absorb(&JsonModel::decode(bytes)?);
        }
        merged.encode()
    }

    fn size_after_deleting(&self, model: &[u8], keyphrase: &str, user: Option<&str>) -> Result<usize> {
        Ok(self.delete_from_model(model, keyphrase, user)?.len())
    }

    fn delete_from_model(&self, model: &[u8], keyphrase: &str, user: Option<&str>) -> Result<Vec<u8>> {
        JsonModel::decode(model)?.without(keyphrase, user)?.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_reports_pairs() {
        let bytes = JsonModelLib::encode(&["hey", "ok"], &["ann"], &[(0, 1)]);
        let header = JsonModelLib.query_header(&bytes).unwrap();
        assert_eq!(header.keyphrases, ["hey", "ok"]);
        assert_eq!(header.pair_flags, vec![vec![false, true]]);
        assert_eq!(header.active_user_keyword_pairs, 1);
    }

    #[test]
    fn merge_then_delete_is_canonical() {
        let a = JsonModelLib::encode(&["hey"], &["ann"], &[(0, 0)]);
        let b = JsonModelLib::encode(&["ok"], &["bo"], &[(0, 0)]);
        let merged = JsonModelLib.merge(&[&a, &b]).unwrap();
        assert!(merged.len() > a.len());
        let back = JsonModelLib.delete_from_model(&merged, "ok", None).unwrap();
        assert_eq!(back, a);
        assert_eq!(
            JsonModelLib.size_after_deleting(&merged, "ok", None).unwrap(),
            back.len()
        );
    }

    #[test]
    fn deleting_unknown_keyphrase_fails() {
        let a = JsonModelLib::encode(&["hey"], &[], &[]);
        assert!(JsonModelLib.delete_from_model(&a, "ok", None).is_err());
    }

    #[test]
    fn garbage_is_invalid_model() {
        assert!(matches!(
            JsonModelLib.query_header(b"\x00\x01"),
            Err(WakegateError::InvalidModel(_))
        ));
    }
}
