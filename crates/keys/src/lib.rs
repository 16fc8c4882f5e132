//! Signing key lifecycle for issued tokens
//!
//! The `KeyManager` owns one current ES256 signing key plus the public halves
//! of recently rotated keys. The key set is persisted as a single record in
//! the store and updated with a conditional write, so several bridge
//! instances can share it. In-process, the loaded set is an immutable
//! snapshot that rotation replaces in one step.

pub mod error;
pub mod manager;
pub mod material;
pub mod rotation;

pub use error::{Error, Result};
pub use manager::{JwkSet, KeyManager, Rotation, RotationPolicy};
pub use material::ALGORITHM;
pub use rotation::spawn_rotation_task;
