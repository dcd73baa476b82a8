//! Types published on the engine's event stream.
//!
//! Everything derives `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward events as JSON (the app prints one per line).

pub mod events;
