//! Self-play worker: the subprocess side of the orchestrator.
//!
//! A worker loads the frozen snapshot once, plays its assigned games
//! sequentially, and writes one batch file per completed game. It shares
//! nothing with the parent but the filesystem; cancellation is a sentinel
//! file in its output directory, checked between plies.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::codec;
use super::game::{play_game, GameLimits};
use crate::agent::FrozenAgent;
use crate::chess::Color;
use crate::config::TrainingConfig;
use crate::env::{ChessEnvironment, RewardTable};
use crate::error::Result;

/// Name of the cooperative-cancel sentinel inside a worker's out dir.
pub const CANCEL_SENTINEL: &str = "cancel";

/// Everything a worker needs beyond its CLI flags, shipped as the
/// `--config` JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    pub training: TrainingConfig,
    /// Color of the learner in this worker's first game; alternates
    /// per game, so the parent stitches global color fairness out of
    /// per-worker start parities.
    pub first_color_white: bool,
    /// Episode ids are `episode_base + game_index`: unique and
    /// reproducible without any randomness.
    pub episode_base: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub snapshot: PathBuf,
    pub seed: u64,
    pub out_dir: PathBuf,
    pub games: usize,
    pub spec: WorkerSpec,
}

/// Batch file name for one game index.
pub fn game_file_name(game_idx: usize) -> String {
    format!("game-{game_idx}.bin")
}

/// Run all assigned games. Returns how many completed; a cancelled or
/// failed game stops the loop but leaves finished files in place.
pub fn run_worker(args: &WorkerArgs) -> Result<usize> {
    let cfg = &args.spec.training;
    std::fs::create_dir_all(&args.out_dir)?;

    let learner = FrozenAgent::from_file(
        &args.snapshot,
        &cfg.hidden_layers,
        cfg.exploration_rate,
    )?;
    let opponent = FrozenAgent::from_file(
        &args.snapshot,
        &cfg.hidden_layers,
        cfg.opponent_exploration_rate,
    )?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut env = ChessEnvironment::new(RewardTable::from_config(cfg), cfg.max_steps_per_game);
    let cancel_path = args.out_dir.join(CANCEL_SENTINEL);

    let mut completed = 0usize;
    for game_idx in 0..args.games {
        if cancel_path.exists() {
            log::info!("worker cancelled before game {game_idx}; keeping {completed} games");
            break;
        }

        let learner_color = if (game_idx % 2 == 0) == args.spec.first_color_white {
            Color::White
        } else {
            Color::Black
        };
        let limits = GameLimits {
            game_deadline: Instant::now() + Duration::from_secs(cfg.game_timeout_secs),
            cancelled: Some(cancel_probe(cancel_path.clone())),
        };

        let episode_id = args.spec.episode_base + game_idx as u64;
        match play_game(
            &mut env,
            &learner,
            &opponent,
            learner_color,
            episode_id,
            &mut rng,
            &limits,
        )? {
            None => {
                log::info!("worker cancelled during game {game_idx}; discarding it");
                break;
            }
            Some(game) => {
                let path = args.out_dir.join(game_file_name(game_idx));
                codec::write_game(&path, &game)?;
                log::debug!(
                    "game {game_idx} finished: {:?} in {} plies ({} transitions)",
                    game.outcome,
                    game.length_plies,
                    game.transitions.len()
                );
                completed += 1;
            }
        }
    }
    Ok(completed)
}

fn cancel_probe(path: PathBuf) -> Box<dyn Fn() -> bool> {
    Box::new(move || path.exists())
}

/// Parse a worker's output directory in game order. Malformed or missing
/// files drop exactly that game.
pub fn read_worker_output(out_dir: &Path, games: usize) -> Vec<super::game::GameResult> {
    let mut results = Vec::new();
    for game_idx in 0..games {
        let path = out_dir.join(game_file_name(game_idx));
        if !path.exists() {
            continue;
        }
        match codec::read_game(&path) {
            Ok(game) => results.push(game),
            Err(err) => {
                log::warn!("dropping game {game_idx} from {}: {err}", out_dir.display());
            }
        }
    }
    results
}
