//! Authoritative server engine for a programmable-tank game
//!
//! Player programs are rhai scripts driving a tank-control API (turn, move,
//! scan, shoot). A fixed-timestep deterministic simulation advances the
//! arena, and each timed action a program awaits completes after exactly its
//! game-time duration regardless of wall-clock jitter.

pub mod config;
pub mod game;
pub mod player;
pub mod protocol;
pub mod util;
