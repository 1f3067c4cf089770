//! One atomic simulation tick

use super::actions::apply_actions;
use super::world::{ActionKind, World};
use crate::protocol::EndReason;

/// Events produced by a single call to `step`, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TickEvent {
    ActionComplete {
        slot: String,
        kind: ActionKind,
        scan_result: Option<bool>,
    },
    ProjectileDespawn {
        id: u64,
        owner: String,
    },
    ProjectileHit {
        id: u64,
        owner: String,
        target: String,
        damage: i32,
    },
    MatchEnd {
        winner: Option<String>,
        reason: EndReason,
    },
}

/// Advance the world by exactly one tick.
///
/// Order matters: actions commit before projectiles move so a move that just
/// completed affects collision this same tick; out-of-bounds despawn precedes
/// hit detection so a projectile that left the arena cannot also register a
/// hit; time advances after physics; match-end is evaluated last.
pub fn step(world: &mut World) -> Vec<TickEvent> {
    let dt = world.dt();
    let mut events: Vec<TickEvent> = apply_actions(world)
        .into_iter()
        .map(|c| TickEvent::ActionComplete {
            slot: c.slot,
            kind: c.kind,
            scan_result: c.scan_result,
        })
        .collect();

    for proj in world.projectiles.values_mut() {
        proj.x += proj.vx * dt;
        proj.y += proj.vy * dt;
    }

    // Boundary despawn
    let c = world.constants.clone();
    let oob: Vec<u64> = world
        .projectiles
        .values()
        .filter(|p| {
            p.x < -c.projectile_radius
                || p.x > c.arena_w + c.projectile_radius
                || p.y < -c.projectile_radius
                || p.y > c.arena_h + c.projectile_radius
        })
        .map(|p| p.id)
        .collect();
    for id in oob {
        if let Some(proj) = world.projectiles.remove(&id) {
            if let Some(owner) = world.tanks.get_mut(&proj.owner) {
                owner.active_projectile = None;
            }
            events.push(TickEvent::ProjectileDespawn {
                id,
                owner: proj.owner,
            });
        }
    }

    // Hit detection; a projectile is consumed by its first hit.
    let ids: Vec<u64> = world.projectiles.keys().copied().collect();
    let hit_dist_sq = {
        let d = c.projectile_radius + c.tank_radius;
        d * d
    };
    for id in ids {
        let Some(proj) = world.projectiles.get(&id) else {
            continue;
        };
        let (px, py, owner) = (proj.x, proj.y, proj.owner.clone());

        let target = world.tanks.values().find_map(|tank| {
            if tank.slot == owner || !tank.alive() {
                return None;
            }
            let dx = px - tank.x;
            let dy = py - tank.y;
            (dx * dx + dy * dy <= hit_dist_sq).then(|| tank.slot.clone())
        });

        if let Some(target) = target {
            if let Some(tank) = world.tanks.get_mut(&target) {
                tank.hp = (tank.hp - c.projectile_damage).max(0);
            }
            world.projectiles.remove(&id);
            if let Some(shooter) = world.tanks.get_mut(&owner) {
                shooter.active_projectile = None;
            }
            events.push(TickEvent::ProjectileHit {
                id,
                owner,
                target,
                damage: c.projectile_damage,
            });
        }
    }

    world.t += dt;

    if let Some(end) = evaluate_match_end(world) {
        events.push(end);
    }
    events
}

fn evaluate_match_end(world: &World) -> Option<TickEvent> {
    let alive: Vec<&super::world::Tank> = world.tanks.values().filter(|t| t.alive()).collect();
    if alive.len() <= 1 {
        return Some(TickEvent::MatchEnd {
            winner: alive.first().map(|t| t.slot.clone()),
            reason: if alive.len() == 1 {
                EndReason::Hp
            } else {
                EndReason::DoubleKo
            },
        });
    }
    if world.t >= world.constants.match_time_limit {
        let mut by_hp = alive;
        by_hp.sort_by(|a, b| b.hp.cmp(&a.hp));
        let winner = if by_hp[0].hp > by_hp[1].hp {
            Some(by_hp[0].slot.clone())
        } else {
            None
        };
        return Some(TickEvent::MatchEnd {
            winner,
            reason: EndReason::Timeout,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::actions::{shoot, start_move_forward, start_scan};
    use crate::game::world::{Constants, TankClass};

    fn world_with(n: usize, constants: Constants) -> World {
        let specs: Vec<_> = (1..=n)
            .map(|i| (format!("p{i}"), format!("P{i}"), TankClass::Light))
            .collect();
        World::new(11, constants, &specs)
    }

    fn place(world: &mut World, slot: &str, x: f64, y: f64, heading: f64) {
        let tank = world.tanks.get_mut(slot).unwrap();
        tank.x = x;
        tank.y = y;
        tank.heading = heading;
    }

    fn run_ticks(world: &mut World, n: usize) -> Vec<TickEvent> {
        let mut events = Vec::new();
        for _ in 0..n {
            events.extend(step(world));
        }
        events
    }

    #[test]
    fn forward_move_covers_exact_distance() {
        let mut world = world_with(2, Constants::default());
        place(&mut world, "p1", 100.0, 100.0, 0.0);
        assert!(start_move_forward(&mut world, "p1"));

        let events = run_ticks(&mut world, 60);

        let tank = &world.tanks["p1"];
        assert!((tank.x - 260.0).abs() < 1e-6, "x = {}", tank.x);
        assert!((tank.y - 100.0).abs() < 1e-6);
        assert!(tank.heading.abs() < 1e-9);
        assert!(tank.active_action.is_none());
        assert!(events.iter().any(|e| matches!(
            e,
            TickEvent::ActionComplete { slot, kind: ActionKind::MoveForward, .. } if slot == "p1"
        )));
    }

    #[test]
    fn action_completes_on_exact_tick() {
        let mut world = world_with(2, Constants::default());
        assert!(start_scan(&mut world, "p1", 0.0, 0.0));

        for tick in 1..=59 {
            let events = step(&mut world);
            assert!(
                !events
                    .iter()
                    .any(|e| matches!(e, TickEvent::ActionComplete { .. })),
                "completed early at tick {tick}"
            );
        }
        let events = step(&mut world);
        assert!(events
            .iter()
            .any(|e| matches!(e, TickEvent::ActionComplete { slot, .. } if slot == "p1")));
    }

    #[test]
    fn projectile_travels_and_despawns_at_edge() {
        let mut world = world_with(2, Constants::default());
        place(&mut world, "p1", 1100.0, 100.0, 0.0);
        place(&mut world, "p2", 100.0, 700.0, 0.0);
        assert!(shoot(&mut world, "p1"));

        // ~100 units to the edge at 420 u/s: well under a second.
        let events = run_ticks(&mut world, 60);
        assert!(events
            .iter()
            .any(|e| matches!(e, TickEvent::ProjectileDespawn { owner, .. } if owner == "p1")));
        assert!(world.projectiles.is_empty());
        assert!(world.tanks["p1"].active_projectile.is_none());
        // One-shot rule: allowed to fire again after the despawn.
        assert!(shoot(&mut world, "p1"));
    }

    #[test]
    fn projectile_hit_applies_damage_and_consumes() {
        let mut world = world_with(2, Constants::default());
        place(&mut world, "p1", 100.0, 400.0, 0.0);
        place(&mut world, "p2", 400.0, 400.0, 180.0);
        assert!(shoot(&mut world, "p1"));

        let events = run_ticks(&mut world, 120);
        let hits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TickEvent::ProjectileHit { target, .. } if target == "p2"))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(world.tanks["p2"].hp, 40);
        assert!(world.projectiles.is_empty());
        assert!(world.tanks["p1"].active_projectile.is_none());
    }

    #[test]
    fn projectile_skips_owner_and_dead_tanks() {
        let mut world = world_with(3, Constants::default());
        // Dead tank sits in the line of fire; the projectile must pass through.
        place(&mut world, "p1", 100.0, 400.0, 0.0);
        place(&mut world, "p2", 250.0, 400.0, 0.0);
        place(&mut world, "p3", 500.0, 400.0, 0.0);
        world.tanks.get_mut("p2").unwrap().hp = 0;
        assert!(shoot(&mut world, "p1"));

        let events = run_ticks(&mut world, 120);
        assert!(events
            .iter()
            .any(|e| matches!(e, TickEvent::ProjectileHit { target, .. } if target == "p3")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TickEvent::ProjectileHit { target, .. } if target == "p2")));
    }

    #[test]
    fn damage_floors_at_zero() {
        let mut constants = Constants::default();
        constants.projectile_damage = 500;
        let mut world = world_with(3, constants);
        place(&mut world, "p1", 100.0, 400.0, 0.0);
        place(&mut world, "p2", 400.0, 400.0, 0.0);
        place(&mut world, "p3", 100.0, 100.0, 0.0);
        assert!(shoot(&mut world, "p1"));

        run_ticks(&mut world, 120);
        assert_eq!(world.tanks["p2"].hp, 0);
    }

    #[test]
    fn last_survivor_wins_by_hp() {
        let mut world = world_with(2, Constants::default());
        world.tanks.get_mut("p2").unwrap().hp = 0;
        let events = step(&mut world);
        assert!(events.iter().any(|e| matches!(
            e,
            TickEvent::MatchEnd { winner: Some(w), reason: EndReason::Hp } if w == "p1"
        )));
    }

    #[test]
    fn double_ko_has_no_winner() {
        let mut world = world_with(2, Constants::default());
        world.tanks.get_mut("p1").unwrap().hp = 0;
        world.tanks.get_mut("p2").unwrap().hp = 0;
        let events = step(&mut world);
        assert!(events.iter().any(|e| matches!(
            e,
            TickEvent::MatchEnd { winner: None, reason: EndReason::DoubleKo }
        )));
    }

    #[test]
    fn timeout_picks_strict_hp_leader() {
        let mut constants = Constants::default();
        constants.match_time_limit = 0.05;
        let mut world = world_with(2, constants.clone());
        world.tanks.get_mut("p2").unwrap().hp = 10;

        let events = run_ticks(&mut world, 4);
        assert!(events.iter().any(|e| matches!(
            e,
            TickEvent::MatchEnd { winner: Some(w), reason: EndReason::Timeout } if w == "p1"
        )));

        // Equal hp at the limit is a draw.
        let mut tied = world_with(2, constants);
        let events = run_ticks(&mut tied, 4);
        assert!(events.iter().any(|e| matches!(
            e,
            TickEvent::MatchEnd { winner: None, reason: EndReason::Timeout }
        )));
    }

    #[test]
    fn dead_tank_pose_is_quiescent() {
        let mut world = world_with(3, Constants::default());
        assert!(start_move_forward(&mut world, "p2"));
        world.tanks.get_mut("p2").unwrap().hp = 0;
        let before = (world.tanks["p2"].x, world.tanks["p2"].y, world.tanks["p2"].heading);
        run_ticks(&mut world, 30);
        let after = (world.tanks["p2"].x, world.tanks["p2"].y, world.tanks["p2"].heading);
        assert_eq!(before, after);
    }

    #[test]
    fn heading_stays_normalized_under_turning() {
        let mut world = world_with(2, Constants::default());
        place(&mut world, "p1", 600.0, 400.0, 1.0);
        crate::game::actions::start_turn_left(&mut world, "p1", Some(720.0));
        for _ in 0..400 {
            step(&mut world);
            let h = world.tanks["p1"].heading;
            assert!((0.0..360.0).contains(&h), "heading out of range: {h}");
        }
    }

    #[test]
    fn determinism_across_identical_runs() {
        let script = |world: &mut World| {
            start_scan(world, "p1", -30.0, 30.0);
            start_move_forward(world, "p2");
            shoot(world, "p1");
        };
        let mut a = world_with(2, Constants::default());
        let mut b = world_with(2, Constants::default());
        script(&mut a);
        script(&mut b);
        for _ in 0..300 {
            step(&mut a);
            step(&mut b);
            for (ta, tb) in a.tanks.values().zip(b.tanks.values()) {
                assert_eq!(ta.x.to_bits(), tb.x.to_bits());
                assert_eq!(ta.y.to_bits(), tb.y.to_bits());
                assert_eq!(ta.heading.to_bits(), tb.heading.to_bits());
                assert_eq!(ta.hp, tb.hp);
            }
            assert_eq!(a.projectiles.len(), b.projectiles.len());
        }
    }

    #[test]
    fn heavy_speed_variants_cover_both_documented_values() {
        for speed in [60.0, 100.0] {
            let mut constants = Constants::default();
            constants.heavy.move_speed = speed;
            let specs = vec![
                ("p1".to_string(), "H".to_string(), TankClass::Heavy),
                ("p2".to_string(), "L".to_string(), TankClass::Light),
            ];
            let mut world = World::new(11, constants, &specs);
            place(&mut world, "p1", 100.0, 100.0, 0.0);
            assert!(start_move_forward(&mut world, "p1"));
            run_ticks(&mut world, 60);
            assert!(
                (world.tanks["p1"].x - (100.0 + speed)).abs() < 1e-6,
                "speed {speed}: x = {}",
                world.tanks["p1"].x
            );
        }
    }
}
