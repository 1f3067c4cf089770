//! Broadcaster-boundary message definitions
//! These are the shapes handed to the state-broadcast collaborator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::game::world::{Constants, TankClass};

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// One tank outlived the rest
    Hp,
    /// The last tanks died on the same tick
    DoubleKo,
    /// Time limit reached
    Timeout,
    /// Externally stopped
    Aborted,
    /// Ended through a player forfeit
    Forfeit,
    /// The simulation itself failed
    Error,
}

/// Messages emitted toward the broadcast collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Emitted once when a match begins
    MatchStart {
        seed: u32,
        constants: Constants,
        tanks: BTreeMap<String, TankInfo>,
    },

    /// Throttled world snapshot
    State {
        /// Simulated time
        t: f64,
        tanks: Vec<TankSnapshot>,
        projectiles: Vec<ProjectileSnapshot>,
    },

    /// Final result
    MatchEnd {
        winner: Option<String>,
        reason: EndReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankInfo {
    pub tank_type: TankClass,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankSnapshot {
    pub slot: String,
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
    pub hp: i32,
    pub tank_type: TankClass,
    /// Present iff a scan action is in flight
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanView>,
}

/// Visualization hint for an in-flight scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanView {
    pub a_deg: f64,
    pub b_deg: f64,
    /// Live result, recomputed at snapshot time
    pub found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectileSnapshot {
    pub owner: String,
    pub x: f64,
    pub y: f64,
}
