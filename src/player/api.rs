//! Tank API - the capability object handed to player programs
//!
//! Player code runs on its own blocking thread; every operation here is
//! marshalled onto the match task's command queue. Timed operations park on a
//! oneshot that the match task resolves at the tick the busy window closes,
//! which is what turns wall-clock-jittery player code into exact game-time
//! actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::runtime::Watchdog;

/// A timed action requested by a player program
#[derive(Debug)]
pub enum ActionRequest {
    TurnLeft { degrees: Option<f64> },
    TurnRight { degrees: Option<f64> },
    MoveForward,
    MoveBackward,
    Scan { a_deg: f64, b_deg: f64 },
}

/// Completion value delivered when a busy window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReply {
    Void,
    Scan(bool),
}

/// Requests marshalled from player threads onto the match task
#[derive(Debug)]
pub enum WorldCommand {
    /// Start a timed action; the reply sender becomes the pending-completion
    /// mailbox until the action's tick arrives (or resolves immediately on
    /// busy rejection).
    Start {
        slot: String,
        request: ActionRequest,
        reply: oneshot::Sender<ActionReply>,
    },
    Shoot {
        slot: String,
        reply: oneshot::Sender<bool>,
    },
    Random {
        reply: oneshot::Sender<f64>,
    },
    Log {
        slot: String,
        message: String,
    },
    /// A runtime reporting its player's error or watchdog timeout
    Forfeit {
        slot: String,
        error: String,
    },
}

/// One instance per slot; cloneable into the player's sandbox.
#[derive(Clone)]
pub struct TankHandle {
    slot: String,
    cmd_tx: mpsc::Sender<WorldCommand>,
    watchdog: Arc<Watchdog>,
    running: Arc<AtomicBool>,
}

impl TankHandle {
    pub fn new(
        slot: String,
        cmd_tx: mpsc::Sender<WorldCommand>,
        watchdog: Arc<Watchdog>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            slot,
            cmd_tx,
            watchdog,
            running,
        }
    }

    /// The match is gone (queue closed or mailbox dropped unresolved); wind
    /// the player loop down so it cannot spin against a dead channel.
    fn match_died(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Block until the requested action's busy window closes. A dead match
    /// resolves innocuously so the player thread exits instead of
    /// deadlocking.
    fn timed(&self, request: ActionRequest) -> ActionReply {
        // Action-started hook: a cooperating program re-arms its watchdog here.
        self.watchdog.arm();
        let (tx, rx) = oneshot::channel();
        let sent = self.cmd_tx.blocking_send(WorldCommand::Start {
            slot: self.slot.clone(),
            request,
            reply: tx,
        });
        if sent.is_err() {
            self.match_died();
            return ActionReply::Void;
        }
        let reply = match rx.blocking_recv() {
            Ok(reply) => reply,
            Err(_) => {
                self.match_died();
                ActionReply::Void
            }
        };
        // The busy window itself is cooperation; give the code after the
        // action a fresh window rather than charging it the game-time wait.
        self.watchdog.arm();
        reply
    }

    pub fn turn_left(&self, degrees: Option<f64>) {
        self.timed(ActionRequest::TurnLeft { degrees });
    }

    pub fn turn_right(&self, degrees: Option<f64>) {
        self.timed(ActionRequest::TurnRight { degrees });
    }

    pub fn move_forward(&self) {
        self.timed(ActionRequest::MoveForward);
    }

    pub fn move_backward(&self) {
        self.timed(ActionRequest::MoveBackward);
    }

    pub fn scan(&self, a_deg: f64, b_deg: f64) -> bool {
        match self.timed(ActionRequest::Scan { a_deg, b_deg }) {
            ActionReply::Scan(found) => found,
            ActionReply::Void => false,
        }
    }

    /// Instant: false while this tank already owns a live projectile.
    pub fn shoot(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self.cmd_tx.blocking_send(WorldCommand::Shoot {
            slot: self.slot.clone(),
            reply: tx,
        });
        if sent.is_err() {
            self.match_died();
            return false;
        }
        rx.blocking_recv().unwrap_or_else(|_| {
            self.match_died();
            false
        })
    }

    /// Uniform `[0, 1)` from the match's seeded PRNG.
    pub fn random(&self) -> f64 {
        let (tx, rx) = oneshot::channel();
        let sent = self.cmd_tx.blocking_send(WorldCommand::Random { reply: tx });
        if sent.is_err() {
            self.match_died();
            return 0.0;
        }
        rx.blocking_recv().unwrap_or_else(|_| {
            self.match_died();
            0.0
        })
    }

    /// The only sanctioned player output; routed through the server log.
    pub fn log(&self, message: &str) {
        if self
            .cmd_tx
            .blocking_send(WorldCommand::Log {
                slot: self.slot.clone(),
                message: message.to_string(),
            })
            .is_err()
        {
            self.match_died();
        }
    }
}
