//! Snapshot building for state broadcast

use crate::protocol::{ProjectileSnapshot, ScanView, ServerMsg, TankSnapshot};

use super::scan::is_in_scan_arc;
use super::world::{ActiveAction, World};

/// Builds throttled state snapshots
pub struct SnapshotBuilder {
    ticks_since_snapshot: u32,
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Derive the interval from tick and snapshot rates.
    pub fn from_rates(tick_rate: u32, snapshot_rate: u32) -> Self {
        let interval = (f64::from(tick_rate) / f64::from(snapshot_rate.max(1))).round() as u32;
        Self::new(interval)
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force a snapshot on the next check (used around important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Build a state message from the current world
    pub fn build(&self, world: &World) -> ServerMsg {
        let tanks: Vec<TankSnapshot> = world
            .tanks
            .values()
            .map(|tank| {
                let scan = match tank.active_action {
                    Some(ActiveAction::Scan { a_deg, b_deg }) => {
                        let found = world.tanks.values().any(|other| {
                            other.slot != tank.slot
                                && other.alive()
                                && is_in_scan_arc(
                                    tank.x,
                                    tank.y,
                                    tank.heading,
                                    other.x,
                                    other.y,
                                    a_deg,
                                    b_deg,
                                    world.constants.scan_range,
                                )
                        });
                        Some(ScanView { a_deg, b_deg, found })
                    }
                    _ => None,
                };
                TankSnapshot {
                    slot: tank.slot.clone(),
                    x: tank.x,
                    y: tank.y,
                    heading_deg: tank.heading,
                    hp: tank.hp,
                    tank_type: tank.class,
                    scan,
                }
            })
            .collect();

        let projectiles: Vec<ProjectileSnapshot> = world
            .projectiles
            .values()
            .map(|p| ProjectileSnapshot {
                owner: p.owner.clone(),
                x: p.x,
                y: p.y,
            })
            .collect();

        ServerMsg::State {
            t: world.t,
            tanks,
            projectiles,
        }
    }
}
