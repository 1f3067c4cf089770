//! Player bridge: the tank capability API and the sandboxed script runtime

pub mod api;
pub mod runtime;

pub use api::TankHandle;
pub use runtime::{LoadError, PlayerProgram, PlayerRuntime};
