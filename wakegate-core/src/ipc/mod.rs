//! Client-facing notification types.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over its own transport unchanged.

pub mod events;
