//! Player runtime - restricted script sandbox with a wall-clock watchdog
//!
//! Untrusted sources are rhai modules. The engine is built raw with only the
//! core, math, array, and map packages registered: no filesystem, network, or
//! process surface exists, and the time package is never registered so player
//! code has no real-time primitive to dodge the watchdog with. `print` and
//! `debug` are silenced; `tank.log()` is the only sanctioned output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage, Package,
};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Scope};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::game::world::{Constants, TankClass};

use super::api::{TankHandle, WorldCommand};

/// Name of the loop entry point a player source must declare.
pub const ENTRY_POINT: &str = "run";

/// Name of the class-tag constant a player source must declare.
pub const CLASS_BINDING: &str = "CLASS";

/// Wall clock allowed per loop invocation before the player forfeits.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Player source rejection at load time; the match never starts.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("player source exceeds the {max}-byte limit")]
    SourceTooLarge { max: usize },

    #[error("player source failed to parse: {0}")]
    Parse(String),

    #[error("player source failed to evaluate: {0}")]
    Eval(String),

    #[error("player source does not declare a `{CLASS_BINDING}` string constant")]
    MissingClassTag,

    #[error("unknown tank class `{0}`")]
    UnknownClass(String),

    #[error("player source does not declare a `{ENTRY_POINT}` function")]
    MissingEntryPoint,
}

/// Resettable wall-clock deadline shared between the sandbox's progress hook
/// and the tank API's action-started hook.
pub struct Watchdog {
    timeout: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(None),
        }
    }

    /// (Re)arm the deadline `timeout` from now.
    pub fn arm(&self) {
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = Some(Instant::now() + self.timeout);
    }

    pub fn disarm(&self) {
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = None;
    }

    pub fn expired(&self) -> bool {
        let deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        deadline.is_some_and(|d| Instant::now() > d)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A validated player source, ready to spawn.
pub struct PlayerProgram {
    pub class: TankClass,
    source: String,
}

impl PlayerProgram {
    /// Compile the source, evaluate its top level once, and extract the two
    /// required bindings: the class tag and the loop entry point.
    pub fn load(source: &str, constants: &Constants) -> Result<Self, LoadError> {
        if source.len() > constants.max_code_size {
            return Err(LoadError::SourceTooLarge {
                max: constants.max_code_size,
            });
        }

        let engine = build_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| LoadError::Parse(e.to_string()))?;

        let mut scope = Scope::new();
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| LoadError::Eval(e.to_string()))?;

        let tag = scope
            .get_value::<ImmutableString>(CLASS_BINDING)
            .ok_or(LoadError::MissingClassTag)?;
        let class =
            TankClass::from_tag(&tag).ok_or_else(|| LoadError::UnknownClass(tag.to_string()))?;

        if !ast.iter_functions().any(|f| f.name == ENTRY_POINT) {
            return Err(LoadError::MissingEntryPoint);
        }

        Ok(Self {
            class,
            source: source.to_string(),
        })
    }
}

/// Drives one player's loop entry point on a blocking task.
pub struct PlayerRuntime {
    slot: String,
    running: Arc<AtomicBool>,
    watchdog: Arc<Watchdog>,
}

impl PlayerRuntime {
    pub fn new(slot: &str, watchdog_timeout: Duration) -> Self {
        Self {
            slot: slot.to_string(),
            running: Arc::new(AtomicBool::new(true)),
            watchdog: Arc::new(Watchdog::new(watchdog_timeout)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Graceful, idempotent stop: the progress hook ends the script at its
    /// next operation, and any blocked timed call is unblocked by the match
    /// task dropping the pending mailbox.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Start the outer loop. The engine is rebuilt inside the blocking task so
    /// nothing engine-internal has to cross threads; the source was already
    /// validated by [`PlayerProgram::load`].
    pub fn spawn(&self, program: &PlayerProgram, cmd_tx: mpsc::Sender<WorldCommand>) {
        let handle = TankHandle::new(
            self.slot.clone(),
            cmd_tx.clone(),
            self.watchdog.clone(),
            self.running.clone(),
        );
        let slot = self.slot.clone();
        let source = program.source.clone();
        let running = self.running.clone();
        let watchdog = self.watchdog.clone();
        tokio::task::spawn_blocking(move || {
            run_player_loop(&slot, &source, handle, &cmd_tx, &running, &watchdog);
        });
    }
}

fn run_player_loop(
    slot: &str,
    source: &str,
    handle: TankHandle,
    cmd_tx: &mpsc::Sender<WorldCommand>,
    running: &Arc<AtomicBool>,
    watchdog: &Arc<Watchdog>,
) {
    let mut engine = build_engine();
    register_api(&mut engine);
    {
        let running = running.clone();
        let watchdog = watchdog.clone();
        engine.on_progress(move |_| {
            if !running.load(Ordering::Relaxed) {
                return Some("stopped".into());
            }
            if watchdog.expired() {
                return Some("timeout".into());
            }
            None
        });
    }

    let forfeit = |error: String| {
        warn!(slot = %slot, error = %error, "player forfeits");
        let _ = cmd_tx.blocking_send(WorldCommand::Forfeit {
            slot: slot.to_string(),
            error,
        });
    };

    let ast = match engine.compile(source) {
        Ok(ast) => ast,
        Err(err) => {
            forfeit(format!("source no longer compiles: {err}"));
            return;
        }
    };

    let mut scope = Scope::new();
    watchdog.arm();
    let top_level = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
    watchdog.disarm();
    if let Err(err) = top_level {
        forfeit(format!("top-level evaluation failed: {err}"));
        return;
    }

    while running.load(Ordering::Relaxed) {
        watchdog.arm();
        let result = engine.call_fn::<Dynamic>(&mut scope, &ast, ENTRY_POINT, (handle.clone(),));
        watchdog.disarm();

        match result {
            Ok(_) => {}
            Err(err) => {
                match classify_termination(&err) {
                    Termination::Stopped => {
                        debug!(slot = %slot, "player loop stopped");
                    }
                    Termination::Timeout => {
                        forfeit(format!(
                            "loop invocation exceeded the {:?} watchdog",
                            watchdog.timeout()
                        ));
                    }
                    Termination::Fault => {
                        forfeit(format!("loop invocation failed: {err}"));
                    }
                }
                break;
            }
        }

        // Brief yield between invocations so a loop body that never awaits an
        // action still leaves room for the rest of the host.
        std::thread::sleep(Duration::from_millis(1));
    }
    running.store(false, Ordering::Relaxed);
}

enum Termination {
    Stopped,
    Timeout,
    Fault,
}

fn classify_termination(err: &EvalAltResult) -> Termination {
    if let EvalAltResult::ErrorTerminated(token, _) = err {
        match token.clone().into_string().as_deref() {
            Ok("stopped") => Termination::Stopped,
            Ok("timeout") => Termination::Timeout,
            _ => Termination::Fault,
        }
    } else {
        Termination::Fault
    }
}

/// Restricted engine: core/math/array/map only, silent print/debug, bounded
/// sizes and depths. The time package is deliberately absent.
fn build_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());

    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine.disable_symbol("eval");

    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(16 * 1024);
    engine.set_max_map_size(16 * 1024);

    // Tamed JSON: parse failures yield unit instead of raising.
    engine.register_fn("parse_json", |text: &str| -> Dynamic {
        serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|value| rhai::serde::to_dynamic(value).ok())
            .unwrap_or(Dynamic::UNIT)
    });

    engine
}

fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<TankHandle>("Tank");

    engine.register_fn("turn_left", |t: &mut TankHandle| t.turn_left(None));
    engine.register_fn("turn_left", |t: &mut TankHandle, deg: f64| {
        t.turn_left(Some(deg))
    });
    engine.register_fn("turn_left", |t: &mut TankHandle, deg: i64| {
        t.turn_left(Some(deg as f64))
    });

    engine.register_fn("turn_right", |t: &mut TankHandle| t.turn_right(None));
    engine.register_fn("turn_right", |t: &mut TankHandle, deg: f64| {
        t.turn_right(Some(deg))
    });
    engine.register_fn("turn_right", |t: &mut TankHandle, deg: i64| {
        t.turn_right(Some(deg as f64))
    });

    engine.register_fn("move_forward", |t: &mut TankHandle| t.move_forward());
    engine.register_fn("move_backward", |t: &mut TankHandle| t.move_backward());

    engine.register_fn("scan", |t: &mut TankHandle, a: f64, b: f64| -> bool {
        t.scan(a, b)
    });
    engine.register_fn("scan", |t: &mut TankHandle, a: i64, b: i64| -> bool {
        t.scan(a as f64, b as f64)
    });

    engine.register_fn("shoot", |t: &mut TankHandle| -> bool { t.shoot() });
    engine.register_fn("log", |t: &mut TankHandle, msg: &str| t.log(msg));
    engine.register_fn("random", |t: &mut TankHandle| -> f64 { t.random() });
}
