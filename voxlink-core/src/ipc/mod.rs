//! Event types published by a live session.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host UI
//! can forward them verbatim.

pub mod events;
