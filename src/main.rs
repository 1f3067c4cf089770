//! Tank Arena Server - authoritative engine for a programmable-tank game
//!
//! Single-match driver: loads the player scripts given on the command line,
//! runs one authoritative match, and prints the broadcaster-boundary
//! messages as JSON lines. Lobby, transport, and rendering live in external
//! collaborators.

use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tank_arena_server::config::Config;
use tank_arena_server::game::world::Constants;
use tank_arena_server::game::{GameMatch, PlayerSpec};
use tank_arena_server::protocol::ServerMsg;
use tank_arena_server::util::time::unix_millis;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    anyhow::ensure!(
        paths.len() >= 2,
        "usage: tank-arena-server <bot.rhai> <bot.rhai> [more bots...]"
    );

    let mut specs = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading player script {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("bot")
            .to_string();
        specs.push(PlayerSpec {
            slot: format!("p{}", i + 1),
            name,
            source,
        });
    }

    let seed = config.seed.unwrap_or_else(|| unix_millis() as u32);
    let match_id = Uuid::new_v4();
    info!(server = %config.display_name, match_id = %match_id, seed, "starting match");

    let (game, handle) = GameMatch::new(match_id, seed, Constants::default(), specs)
        .map_err(|err| anyhow::anyhow!("failed to load players: {err}"))?;

    let mut events = handle.subscribe();
    let runner = tokio::spawn(game.run());

    // Ctrl+C aborts the match gracefully
    let stop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping match");
            stop_handle.stop();
        }
    });

    loop {
        match events.recv().await {
            Ok(msg) => {
                let ended = matches!(msg, ServerMsg::MatchEnd { .. });
                println!("{}", serde_json::to_string(&msg)?);
                if ended {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!(lagged = n, "event receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    runner.await?;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
