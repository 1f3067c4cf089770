//! Game simulation modules

pub mod actions;
pub mod r#match;
pub mod rng;
pub mod scan;
pub mod snapshot;
pub mod step;
pub mod world;

pub use r#match::{GameMatch, MatchHandle, PlayerSpec};
