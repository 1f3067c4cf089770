//! Match orchestration and the authoritative tick loop

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::player::api::{ActionReply, ActionRequest, WorldCommand};
use crate::player::runtime::{LoadError, PlayerProgram, PlayerRuntime, DEFAULT_WATCHDOG_TIMEOUT};
use crate::protocol::{EndReason, ServerMsg, TankInfo};

use super::actions;
use super::snapshot::SnapshotBuilder;
use super::step::{step, TickEvent};
use super::world::{ActionKind, Constants, World};

/// Per-slot player submission. The class tag comes from the source itself.
#[derive(Debug, Clone)]
pub struct PlayerSpec {
    pub slot: String,
    pub name: String,
    pub source: String,
}

/// After a stall, replay at most this many ticks in one burst.
const MAX_CATCHUP_TICKS: u32 = 10;

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    events_tx: broadcast::Sender<ServerMsg>,
    stop_tx: mpsc::Sender<()>,
}

impl MatchHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.events_tx.subscribe()
    }

    /// Request a graceful stop (match ends with reason `aborted`). Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// The single-slot pending-completion mailbox for one tank
struct PendingAction {
    kind: ActionKind,
    reply: oneshot::Sender<ActionReply>,
}

fn innocuous_reply(kind: ActionKind) -> ActionReply {
    match kind {
        ActionKind::Scan => ActionReply::Scan(false),
        _ => ActionReply::Void,
    }
}

fn request_kind(request: &ActionRequest) -> ActionKind {
    match request {
        ActionRequest::TurnLeft { .. } => ActionKind::TurnLeft,
        ActionRequest::TurnRight { .. } => ActionKind::TurnRight,
        ActionRequest::MoveForward => ActionKind::MoveForward,
        ActionRequest::MoveBackward => ActionKind::MoveBackward,
        ActionRequest::Scan { .. } => ActionKind::Scan,
    }
}

/// The authoritative match: owns the world, the command queue, the pending
/// mailboxes, and the player runtimes.
pub struct GameMatch {
    id: Uuid,
    world: World,
    cmd_tx: mpsc::Sender<WorldCommand>,
    cmd_rx: mpsc::Receiver<WorldCommand>,
    stop_rx: mpsc::Receiver<()>,
    events_tx: broadcast::Sender<ServerMsg>,
    snapshots: SnapshotBuilder,
    pending: BTreeMap<String, PendingAction>,
    runtimes: BTreeMap<String, PlayerRuntime>,
    programs: BTreeMap<String, PlayerProgram>,
    names: BTreeMap<String, String>,
    forfeited: BTreeSet<String>,
    forfeit_details: Vec<String>,
}

impl GameMatch {
    /// Load every player program (any failure aborts the match before it
    /// starts) and build the world from the declared classes.
    pub fn new(
        id: Uuid,
        seed: u32,
        constants: Constants,
        specs: Vec<PlayerSpec>,
    ) -> Result<(Self, MatchHandle), LoadError> {
        Self::with_watchdog(id, seed, constants, specs, DEFAULT_WATCHDOG_TIMEOUT)
    }

    pub fn with_watchdog(
        id: Uuid,
        seed: u32,
        constants: Constants,
        specs: Vec<PlayerSpec>,
        watchdog_timeout: Duration,
    ) -> Result<(Self, MatchHandle), LoadError> {
        let mut programs = BTreeMap::new();
        let mut names = BTreeMap::new();
        let mut players = Vec::new();
        for spec in specs {
            let program = PlayerProgram::load(&spec.source, &constants)?;
            players.push((spec.slot.clone(), spec.name.clone(), program.class));
            names.insert(spec.slot.clone(), spec.name);
            programs.insert(spec.slot.clone(), program);
        }

        let world = World::new(seed, constants, &players);
        let runtimes: BTreeMap<String, PlayerRuntime> = programs
            .keys()
            .map(|slot| (slot.clone(), PlayerRuntime::new(slot, watchdog_timeout)))
            .collect();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (events_tx, _) = broadcast::channel(256);

        let handle = MatchHandle {
            id,
            events_tx: events_tx.clone(),
            stop_tx,
        };

        let snapshots = SnapshotBuilder::from_rates(
            world.constants.tick_rate,
            world.constants.snapshot_rate,
        );

        Ok((
            Self {
                id,
                world,
                cmd_tx,
                cmd_rx,
                stop_rx,
                events_tx,
                snapshots,
                pending: BTreeMap::new(),
                runtimes,
                programs,
                names,
                forfeited: BTreeSet::new(),
                forfeit_details: Vec::new(),
            },
            handle,
        ))
    }

    /// Run the match to completion: announce it, start the player runtimes,
    /// then drive the fixed-timestep loop.
    pub async fn run(mut self) {
        info!(match_id = %self.id, seed = self.world.seed, "match starting");
        self.broadcast_match_start();
        self.start_runtimes();

        let tick_interval = Duration::from_secs_f64(self.world.dt());
        let catchup_cap = tick_interval * MAX_CATCHUP_TICKS;
        let mut accumulator = Duration::ZERO;
        let mut last_wake = Instant::now();

        loop {
            if self.stop_rx.try_recv().is_ok() {
                self.finish(None, EndReason::Aborted, None);
                return;
            }

            self.drain_commands();

            let now = Instant::now();
            accumulator += now - last_wake;
            last_wake = now;
            if accumulator > catchup_cap {
                accumulator = catchup_cap;
            }

            while accumulator >= tick_interval {
                accumulator -= tick_interval;

                let outcome = catch_unwind(AssertUnwindSafe(|| step(&mut self.world)));
                let events = match outcome {
                    Ok(events) => events,
                    Err(panic) => {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned());
                        error!(match_id = %self.id, detail = ?detail, "simulation failed");
                        self.finish(None, EndReason::Error, detail);
                        return;
                    }
                };

                if let Some((winner, reason)) = self.process_tick(events) {
                    self.finish(winner, reason, None);
                    return;
                }
            }

            let sleep_for = tick_interval
                .saturating_sub(accumulator)
                .max(Duration::from_millis(1));
            tokio::time::sleep(sleep_for).await;
        }
    }

    fn broadcast_match_start(&self) {
        let tanks: BTreeMap<String, TankInfo> = self
            .world
            .tanks
            .values()
            .map(|t| {
                (
                    t.slot.clone(),
                    TankInfo {
                        tank_type: t.class,
                        name: t.name.clone(),
                    },
                )
            })
            .collect();
        let _ = self.events_tx.send(ServerMsg::MatchStart {
            seed: self.world.seed,
            constants: self.world.constants.clone(),
            tanks,
        });
    }

    fn start_runtimes(&self) {
        for (slot, program) in &self.programs {
            let Some(runtime) = self.runtimes.get(slot) else {
                continue;
            };
            runtime.spawn(program, self.cmd_tx.clone());
        }
    }

    /// Drain the command queue: action starts, instant ops, forfeits. Runs
    /// once per wake, before any tick of that wake, so completions from tick
    /// n are answered before anything is applied in tick n+1.
    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                WorldCommand::Start {
                    slot,
                    request,
                    reply,
                } => self.handle_start(slot, request, reply),
                WorldCommand::Shoot { slot, reply } => {
                    let _ = reply.send(actions::shoot(&mut self.world, &slot));
                }
                WorldCommand::Random { reply } => {
                    let _ = reply.send(self.world.random());
                }
                WorldCommand::Log { slot, message } => {
                    info!(match_id = %self.id, slot = %slot, "{message}");
                }
                WorldCommand::Forfeit { slot, error } => self.handle_forfeit(&slot, &error),
            }
        }
    }

    fn handle_start(
        &mut self,
        slot: String,
        request: ActionRequest,
        reply: oneshot::Sender<ActionReply>,
    ) {
        let kind = request_kind(&request);
        if self.pending.contains_key(&slot) {
            // A well-formed program cannot get here; resolve immediately so
            // the caller never hangs.
            let _ = reply.send(innocuous_reply(kind));
            return;
        }

        let accepted = match request {
            ActionRequest::TurnLeft { degrees } => {
                actions::start_turn_left(&mut self.world, &slot, degrees)
            }
            ActionRequest::TurnRight { degrees } => {
                actions::start_turn_right(&mut self.world, &slot, degrees)
            }
            ActionRequest::MoveForward => actions::start_move_forward(&mut self.world, &slot),
            ActionRequest::MoveBackward => actions::start_move_backward(&mut self.world, &slot),
            ActionRequest::Scan { a_deg, b_deg } => {
                actions::start_scan(&mut self.world, &slot, a_deg, b_deg)
            }
        };

        if accepted {
            self.pending.insert(slot, PendingAction { kind, reply });
        } else {
            let _ = reply.send(innocuous_reply(kind));
        }
    }

    /// A runtime reported a player error or watchdog timeout: the tank dies
    /// and normal match-end detection decides the winner.
    fn handle_forfeit(&mut self, slot: &str, error: &str) {
        warn!(match_id = %self.id, slot = %slot, error = %error, "player forfeited");
        self.forfeited.insert(slot.to_string());
        self.forfeit_details.push(format!("{slot}: {error}"));
        if let Some(tank) = self.world.tanks.get_mut(slot) {
            tank.hp = 0;
        }
        self.resolve_innocuous(slot);
        if let Some(runtime) = self.runtimes.get(slot) {
            runtime.stop();
        }
    }

    /// Consume one tick's events: resolve completed actions, sweep freshly
    /// dead tanks, emit a snapshot when the throttle allows. Returns the
    /// match result if this tick ended it.
    fn process_tick(&mut self, events: Vec<TickEvent>) -> Option<(Option<String>, EndReason)> {
        let mut ended = None;
        for event in events {
            match event {
                TickEvent::ActionComplete {
                    slot,
                    kind,
                    scan_result,
                } => {
                    // Detach the mailbox before resolving: the player thread
                    // may immediately enqueue its next action.
                    if let Some(pending) = self.pending.remove(&slot) {
                        let reply = match (kind, scan_result) {
                            (ActionKind::Scan, Some(found)) => ActionReply::Scan(found),
                            _ => ActionReply::Void,
                        };
                        let _ = pending.reply.send(reply);
                    }
                }
                TickEvent::ProjectileHit {
                    owner,
                    target,
                    damage,
                    ..
                } => {
                    debug!(match_id = %self.id, shooter = %owner, target = %target, damage, "hit");
                }
                TickEvent::ProjectileDespawn { id, owner } => {
                    debug!(match_id = %self.id, projectile = id, owner = %owner, "despawn");
                }
                TickEvent::MatchEnd { winner, reason } => {
                    ended = Some((winner, reason));
                }
            }
        }

        self.sweep_dead();

        if ended.is_some() {
            self.snapshots.force_next();
        }
        if self.snapshots.should_send() {
            let _ = self.events_tx.send(self.snapshots.build(&self.world));
        }

        ended
    }

    /// A tank whose hp just reached zero while its runtime still runs would
    /// leave its suspended action unresolved forever; resolve it innocuously
    /// and stop the runtime.
    fn sweep_dead(&mut self) {
        let dead: Vec<String> = self
            .world
            .tanks
            .values()
            .filter(|t| !t.alive())
            .map(|t| t.slot.clone())
            .collect();
        for slot in dead {
            if let Some(runtime) = self.runtimes.get(&slot) {
                if runtime.is_running() {
                    runtime.stop();
                }
            }
            self.resolve_innocuous(&slot);
        }
    }

    fn resolve_innocuous(&mut self, slot: &str) {
        if let Some(pending) = self.pending.remove(slot) {
            let _ = pending.reply.send(innocuous_reply(pending.kind));
        }
    }

    /// Stop everything, resolve every remaining pending action, and publish
    /// the final result.
    fn finish(&mut self, winner: Option<String>, reason: EndReason, detail: Option<String>) {
        for runtime in self.runtimes.values() {
            runtime.stop();
        }
        let slots: Vec<String> = self.pending.keys().cloned().collect();
        for slot in slots {
            self.resolve_innocuous(&slot);
        }

        // An hp win produced purely by forfeits is reported as one.
        let reason = if reason == EndReason::Hp && self.all_deaths_are_forfeits() {
            EndReason::Forfeit
        } else {
            reason
        };

        let detail = detail.or_else(|| {
            (!self.forfeit_details.is_empty()).then(|| self.forfeit_details.join("; "))
        });

        let winner_name = winner.as_ref().and_then(|slot| self.names.get(slot));
        info!(
            match_id = %self.id,
            winner = ?winner,
            winner_name = ?winner_name,
            reason = ?reason,
            t = self.world.t,
            "match ended"
        );
        let _ = self.events_tx.send(ServerMsg::MatchEnd {
            winner,
            reason,
            detail,
        });
    }

    fn all_deaths_are_forfeits(&self) -> bool {
        if self.forfeited.is_empty() {
            return false;
        }
        self.world
            .tanks
            .values()
            .filter(|t| !t.alive())
            .all(|t| self.forfeited.contains(&t.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE_SCANNER: &str = r#"
        const CLASS = "light";

        fn run(tank) {
            tank.scan(0.0, 0.0);
        }
    "#;

    fn spec(slot: &str, source: &str) -> PlayerSpec {
        PlayerSpec {
            slot: slot.to_string(),
            name: slot.to_uppercase(),
            source: source.to_string(),
        }
    }

    async fn wait_for_end(rx: &mut broadcast::Receiver<ServerMsg>) -> ServerMsg {
        loop {
            match rx.recv().await.expect("match channel closed") {
                msg @ ServerMsg::MatchEnd { .. } => return msg,
                _ => continue,
            }
        }
    }

    #[test]
    fn load_failure_aborts_before_start() {
        let result = GameMatch::new(
            Uuid::new_v4(),
            1,
            Constants::default(),
            vec![spec("p1", IDLE_SCANNER), spec("p2", "fn run( {")],
        );
        assert!(matches!(result, Err(LoadError::Parse(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_player_ends_immediately_with_hp_win() {
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            1,
            Constants::default(),
            vec![spec("p1", IDLE_SCANNER)],
        )
        .unwrap();
        let mut rx = handle.subscribe();
        tokio::spawn(game.run());

        let end = tokio::time::timeout(Duration::from_secs(5), wait_for_end(&mut rx))
            .await
            .expect("match did not end");
        let ServerMsg::MatchEnd { winner, reason, .. } = end else {
            unreachable!()
        };
        assert_eq!(winner.as_deref(), Some("p1"));
        assert_eq!(reason, EndReason::Hp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_aborts_the_match() {
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            1,
            Constants::default(),
            vec![spec("p1", IDLE_SCANNER), spec("p2", IDLE_SCANNER)],
        )
        .unwrap();
        let mut rx = handle.subscribe();
        tokio::spawn(game.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();

        let end = tokio::time::timeout(Duration::from_secs(5), wait_for_end(&mut rx))
            .await
            .expect("match did not end");
        let ServerMsg::MatchEnd { reason, winner, .. } = end else {
            unreachable!()
        };
        assert_eq!(reason, EndReason::Aborted);
        assert_eq!(winner, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn match_start_lists_declared_classes() {
        let heavy = r#"
            const CLASS = "heavy";
            fn run(tank) { tank.scan(0.0, 0.0); }
        "#;
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            1,
            Constants::default(),
            vec![spec("p1", IDLE_SCANNER), spec("p2", heavy)],
        )
        .unwrap();
        let mut rx = handle.subscribe();
        tokio::spawn(game.run());

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no message")
            .expect("channel closed");
        let ServerMsg::MatchStart { tanks, .. } = first else {
            panic!("expected match_start first, got {first:?}");
        };
        assert_eq!(
            tanks["p2"].tank_type,
            crate::game::world::TankClass::Heavy
        );
        handle.stop();
    }
}
