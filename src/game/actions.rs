//! Timed-action starters and the per-tick applicator

use super::scan::{is_in_scan_arc, normalize_deg};
use super::world::{ActionKind, ActiveAction, World};

/// Tolerance absorbing floating-point drift across many dt increments.
pub const BUSY_EPSILON: f64 = 1e-9;

/// Descriptor emitted when a busy window closes
#[derive(Debug, Clone, PartialEq)]
pub struct ActionComplete {
    pub slot: String,
    pub kind: ActionKind,
    /// Present iff the completed action was a scan
    pub scan_result: Option<bool>,
}

fn is_idle(world: &World, slot: &str) -> bool {
    world
        .tanks
        .get(slot)
        .map(|t| world.t >= t.busy_until - BUSY_EPSILON)
        .unwrap_or(false)
}

/// Schedule a timed action: mark the tank busy for `duration` simulated
/// seconds and record the per-tick work. Returns false when the tank is
/// missing, dead, or still busy.
fn start_timed(world: &mut World, slot: &str, action: ActiveAction, duration: f64) -> bool {
    if !is_idle(world, slot) {
        return false;
    }
    let t = world.t;
    let Some(tank) = world.tanks.get_mut(slot) else {
        return false;
    };
    if !tank.alive() {
        return false;
    }
    tank.busy_until = t + duration;
    tank.active_action = Some(action);
    true
}

fn turn_duration(world: &World, slot: &str, degrees: Option<f64>) -> f64 {
    match degrees {
        Some(deg) => {
            let rate = world
                .tanks
                .get(slot)
                .map(|t| world.constants.class_stats(t.class).turn_rate)
                .unwrap_or(1.0);
            deg.abs() / rate
        }
        None => world.constants.action_duration,
    }
}

pub fn start_turn_left(world: &mut World, slot: &str, degrees: Option<f64>) -> bool {
    let duration = turn_duration(world, slot, degrees);
    start_timed(world, slot, ActiveAction::TurnLeft, duration)
}

pub fn start_turn_right(world: &mut World, slot: &str, degrees: Option<f64>) -> bool {
    let duration = turn_duration(world, slot, degrees);
    start_timed(world, slot, ActiveAction::TurnRight, duration)
}

pub fn start_move_forward(world: &mut World, slot: &str) -> bool {
    let duration = world.constants.action_duration;
    start_timed(world, slot, ActiveAction::MoveForward, duration)
}

pub fn start_move_backward(world: &mut World, slot: &str) -> bool {
    let duration = world.constants.action_duration;
    start_timed(world, slot, ActiveAction::MoveBackward, duration)
}

pub fn start_scan(world: &mut World, slot: &str, a_deg: f64, b_deg: f64) -> bool {
    let duration = world.constants.action_duration;
    start_timed(world, slot, ActiveAction::Scan { a_deg, b_deg }, duration)
}

/// Instant action: spawn a projectile just outside the shooter's hull along
/// its heading. Fails while the shooter already owns a live projectile.
pub fn shoot(world: &mut World, slot: &str) -> bool {
    let Some(tank) = world.tanks.get(slot) else {
        return false;
    };
    if !tank.alive() || tank.active_projectile.is_some() {
        return false;
    }

    let c = &world.constants;
    // Spawn outside the shooter's circle so tick 0 cannot self-hit.
    let offset = c.tank_radius + c.projectile_radius + 1.0;
    let rad = tank.heading.to_radians();
    let x = tank.x + rad.cos() * offset;
    let y = tank.y + rad.sin() * offset;
    let vx = rad.cos() * c.projectile_speed;
    let vy = rad.sin() * c.projectile_speed;
    let owner = tank.slot.clone();

    let id = world.alloc_projectile_id();
    world.projectiles.insert(
        id,
        super::world::Projectile {
            id,
            owner,
            x,
            y,
            vx,
            vy,
        },
    );
    if let Some(tank) = world.tanks.get_mut(slot) {
        tank.active_projectile = Some(id);
    }
    true
}

/// Advance every busy, alive tank by one dt slice and collect the busy
/// windows that close this tick. Scans are resolved here, against positions
/// at completion time.
pub fn apply_actions(world: &mut World) -> Vec<ActionComplete> {
    let dt = world.dt();
    let t = world.t;
    let slots: Vec<String> = world.tanks.keys().cloned().collect();
    let mut completions = Vec::new();

    for slot in &slots {
        let (action, completes) = {
            let Some(tank) = world.tanks.get(slot) else {
                continue;
            };
            if !tank.alive() {
                continue;
            }
            let Some(action) = tank.active_action else {
                continue;
            };
            (action, t + dt >= tank.busy_until - BUSY_EPSILON)
        };

        let stats = {
            let tank = &world.tanks[slot];
            world.constants.class_stats(tank.class)
        };
        let c = world.constants.clone();

        if let Some(tank) = world.tanks.get_mut(slot) {
            match action {
                ActiveAction::TurnLeft => {
                    tank.heading = normalize_deg(tank.heading - stats.turn_rate * dt);
                }
                ActiveAction::TurnRight => {
                    tank.heading = normalize_deg(tank.heading + stats.turn_rate * dt);
                }
                ActiveAction::MoveForward | ActiveAction::MoveBackward => {
                    let sign = if action == ActiveAction::MoveForward {
                        1.0
                    } else {
                        -1.0
                    };
                    let rad = tank.heading.to_radians();
                    tank.x += sign * rad.cos() * stats.move_speed * dt;
                    tank.y += sign * rad.sin() * stats.move_speed * dt;
                    tank.x = tank.x.clamp(c.tank_radius, c.arena_w - c.tank_radius);
                    tank.y = tank.y.clamp(c.tank_radius, c.arena_h - c.tank_radius);
                }
                ActiveAction::Scan { .. } => {}
            }
        }

        if !completes {
            continue;
        }

        let scan_result = if let ActiveAction::Scan { a_deg, b_deg } = action {
            let scanner = world.tanks[slot].clone();
            let found = world.tanks.values().any(|other| {
                other.slot != *slot
                    && other.alive()
                    && is_in_scan_arc(
                        scanner.x,
                        scanner.y,
                        scanner.heading,
                        other.x,
                        other.y,
                        a_deg,
                        b_deg,
                        c.scan_range,
                    )
            });
            Some(found)
        } else {
            None
        };

        if let Some(tank) = world.tanks.get_mut(slot) {
            if let Some(found) = scan_result {
                tank.last_scan_result = found;
            }
            // busy_until stays put; the next idleness check compares t against it.
            tank.active_action = None;
        }

        completions.push(ActionComplete {
            slot: slot.clone(),
            kind: action.kind(),
            scan_result,
        });
    }

    completions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::{Constants, TankClass};

    fn two_player_world() -> World {
        let specs = vec![
            ("p1".to_string(), "P1".to_string(), TankClass::Light),
            ("p2".to_string(), "P2".to_string(), TankClass::Light),
        ];
        World::new(42, Constants::default(), &specs)
    }

    fn place(world: &mut World, slot: &str, x: f64, y: f64, heading: f64) {
        let tank = world.tanks.get_mut(slot).unwrap();
        tank.x = x;
        tank.y = y;
        tank.heading = heading;
    }

    #[test]
    fn starter_rejected_while_busy() {
        let mut world = two_player_world();
        assert!(start_move_forward(&mut world, "p1"));
        assert!(!start_move_forward(&mut world, "p1"));
        assert!(!start_scan(&mut world, "p1", -30.0, 30.0));
    }

    #[test]
    fn turn_duration_scales_with_degrees() {
        let mut world = two_player_world();
        // Light turn rate is 120 deg/s, so 90 degrees takes 0.75 s.
        assert!(start_turn_right(&mut world, "p1", Some(90.0)));
        let busy = world.tanks["p1"].busy_until;
        assert!((busy - 0.75).abs() < 1e-12);
    }

    #[test]
    fn default_turn_uses_action_duration() {
        let mut world = two_player_world();
        assert!(start_turn_left(&mut world, "p1", None));
        assert!((world.tanks["p1"].busy_until - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dead_tank_cannot_start() {
        let mut world = two_player_world();
        world.tanks.get_mut("p1").unwrap().hp = 0;
        assert!(!start_move_forward(&mut world, "p1"));
        assert!(!shoot(&mut world, "p1"));
    }

    #[test]
    fn shoot_spawns_outside_hull_along_heading() {
        let mut world = two_player_world();
        place(&mut world, "p1", 300.0, 400.0, 0.0);
        assert!(shoot(&mut world, "p1"));

        let id = world.tanks["p1"].active_projectile.unwrap();
        let proj = &world.projectiles[&id];
        let c = &world.constants;
        assert!((proj.x - (300.0 + c.tank_radius + c.projectile_radius + 1.0)).abs() < 1e-9);
        assert!((proj.y - 400.0).abs() < 1e-9);
        assert!((proj.vx - c.projectile_speed).abs() < 1e-9);
        assert!(proj.vy.abs() < 1e-9);
    }

    #[test]
    fn second_shot_rejected_while_projectile_lives() {
        let mut world = two_player_world();
        assert!(shoot(&mut world, "p1"));
        let count = world.projectiles.len();
        assert!(!shoot(&mut world, "p1"));
        assert_eq!(world.projectiles.len(), count);
    }

    #[test]
    fn turn_applies_one_dt_slice_per_tick() {
        let mut world = two_player_world();
        place(&mut world, "p1", 600.0, 400.0, 0.0);
        assert!(start_turn_right(&mut world, "p1", Some(90.0)));
        apply_actions(&mut world);
        // 120 deg/s over 1/60 s = 2 degrees.
        assert!((world.tanks["p1"].heading - 2.0).abs() < 1e-9);
    }

    #[test]
    fn move_clamps_to_arena_inset() {
        let mut world = two_player_world();
        let r = world.constants.tank_radius;
        place(&mut world, "p1", r + 0.5, 400.0, 180.0);
        assert!(start_move_forward(&mut world, "p1"));
        for _ in 0..60 {
            apply_actions(&mut world);
            world.t += world.dt();
        }
        assert!((world.tanks["p1"].x - r).abs() < 1e-9);
    }

    #[test]
    fn scan_resolves_against_positions_at_completion() {
        let mut world = two_player_world();
        place(&mut world, "p1", 100.0, 100.0, 0.0);
        place(&mut world, "p2", 200.0, 100.0, 0.0);
        assert!(start_scan(&mut world, "p1", -30.0, 30.0));

        let mut completions = Vec::new();
        for _ in 0..60 {
            completions.extend(apply_actions(&mut world));
            world.t += world.dt();
        }
        let done: Vec<_> = completions
            .iter()
            .filter(|c| c.slot == "p1" && c.kind == ActionKind::Scan)
            .collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].scan_result, Some(true));
        assert!(world.tanks["p1"].last_scan_result);
    }

    #[test]
    fn completion_leaves_busy_until_for_idle_check() {
        let mut world = two_player_world();
        assert!(start_move_forward(&mut world, "p1"));
        for _ in 0..60 {
            apply_actions(&mut world);
            world.t += world.dt();
        }
        let tank = &world.tanks["p1"];
        assert!(tank.active_action.is_none());
        // Idle again: a new action is accepted.
        assert!(start_move_forward(&mut world, "p1"));
    }
}
