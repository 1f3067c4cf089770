//! World state: match constants, tanks, projectiles

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::rng::Mulberry32;
use super::scan::normalize_deg;

/// Tank classes selectable by player programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TankClass {
    /// Fast and fragile
    Light,
    /// Slow and durable
    Heavy,
}

impl TankClass {
    /// Parse the class tag a player program declares.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "light" => Some(Self::Light),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }
}

/// Class-derived stats
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassStats {
    pub max_hp: i32,
    /// Units per second
    pub move_speed: f64,
    /// Degrees per second
    pub turn_rate: f64,
}

/// Frozen per-match rule snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constants {
    pub arena_w: f64,
    pub arena_h: f64,
    pub tick_rate: u32,
    /// Simulated seconds a default timed action occupies
    pub action_duration: f64,
    pub scan_range: f64,
    pub tank_radius: f64,
    pub projectile_radius: f64,
    pub projectile_speed: f64,
    pub projectile_damage: i32,
    pub light: ClassStats,
    pub heavy: ClassStats,
    pub snapshot_rate: u32,
    /// Simulated seconds before the match times out
    pub match_time_limit: f64,
    pub max_code_size: usize,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            arena_w: 1200.0,
            arena_h: 800.0,
            tick_rate: 60,
            action_duration: 1.0,
            scan_range: 700.0,
            tank_radius: 18.0,
            projectile_radius: 4.0,
            projectile_speed: 420.0,
            projectile_damage: 20,
            light: ClassStats {
                max_hp: 60,
                move_speed: 160.0,
                turn_rate: 120.0,
            },
            heavy: ClassStats {
                max_hp: 120,
                move_speed: 60.0,
                turn_rate: 90.0,
            },
            snapshot_rate: 20,
            match_time_limit: 180.0,
            max_code_size: 50 * 1024,
        }
    }
}

impl Constants {
    pub fn class_stats(&self, class: TankClass) -> ClassStats {
        match class {
            TankClass::Light => self.light,
            TankClass::Heavy => self.heavy,
        }
    }

    /// Seconds of simulated time per tick.
    pub fn dt(&self) -> f64 {
        1.0 / f64::from(self.tick_rate)
    }
}

/// The timed action currently occupying a tank's busy window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveAction {
    TurnLeft,
    TurnRight,
    MoveForward,
    MoveBackward,
    Scan { a_deg: f64, b_deg: f64 },
}

impl ActiveAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::TurnLeft => ActionKind::TurnLeft,
            Self::TurnRight => ActionKind::TurnRight,
            Self::MoveForward => ActionKind::MoveForward,
            Self::MoveBackward => ActionKind::MoveBackward,
            Self::Scan { .. } => ActionKind::Scan,
        }
    }
}

/// Action discriminant carried by completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    TurnLeft,
    TurnRight,
    MoveForward,
    MoveBackward,
    Scan,
}

/// Authoritative per-slot tank state
#[derive(Debug, Clone)]
pub struct Tank {
    pub slot: String,
    pub name: String,
    pub class: TankClass,
    pub x: f64,
    pub y: f64,
    /// Degrees in `[0, 360)`; 0° = +x, clockwise
    pub heading: f64,
    pub hp: i32,
    /// Simulated time at which the scheduled action completes; 0 when never busy
    pub busy_until: f64,
    pub active_action: Option<ActiveAction>,
    /// The single live projectile owned by this tank, if any
    pub active_projectile: Option<u64>,
    /// Outcome of the most recently completed scan
    pub last_scan_result: bool,
}

impl Tank {
    pub fn alive(&self) -> bool {
        self.hp > 0
    }
}

/// A projectile in flight. Velocity is the source of truth for direction.
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: u64,
    pub owner: String,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

/// Match world: owned by the match task, mutated only by `step` and the
/// orchestrator's death handling.
pub struct World {
    /// Simulated time in seconds, advanced by exactly one dt per tick
    pub t: f64,
    pub seed: u32,
    pub constants: Constants,
    pub rng: Mulberry32,
    // BTreeMaps keep per-tick iteration order stable across runs.
    pub tanks: BTreeMap<String, Tank>,
    pub projectiles: BTreeMap<u64, Projectile>,
    next_projectile_id: u64,
}

impl World {
    /// Build the starting world: tanks evenly spaced on a ring around the
    /// arena center, rotated by one seeded random offset, each facing the
    /// center.
    pub fn new(seed: u32, constants: Constants, players: &[(String, String, TankClass)]) -> Self {
        let mut rng = Mulberry32::new(seed);
        let cx = constants.arena_w / 2.0;
        let cy = constants.arena_h / 2.0;
        let ring = 0.55 * constants.arena_w.min(constants.arena_h) / 2.0;
        let offset_deg = rng.next_f64() * 360.0;

        let mut tanks = BTreeMap::new();
        let n = players.len().max(1) as f64;
        for (i, (slot, name, class)) in players.iter().enumerate() {
            let angle = normalize_deg(offset_deg + i as f64 * 360.0 / n);
            let rad = angle.to_radians();
            let stats = constants.class_stats(*class);
            tanks.insert(
                slot.clone(),
                Tank {
                    slot: slot.clone(),
                    name: name.clone(),
                    class: *class,
                    x: cx + ring * rad.cos(),
                    y: cy + ring * rad.sin(),
                    heading: normalize_deg(angle + 180.0),
                    hp: stats.max_hp,
                    busy_until: 0.0,
                    active_action: None,
                    active_projectile: None,
                    last_scan_result: false,
                },
            );
        }

        Self {
            t: 0.0,
            seed,
            constants,
            rng,
            tanks,
            projectiles: BTreeMap::new(),
            next_projectile_id: 0,
        }
    }

    pub fn dt(&self) -> f64 {
        self.constants.dt()
    }

    pub fn alloc_projectile_id(&mut self) -> u64 {
        self.next_projectile_id += 1;
        self.next_projectile_id
    }

    /// Uniform `[0, 1)` draw from the match PRNG.
    pub fn random(&mut self) -> f64 {
        self.rng.next_f64()
    }
}
