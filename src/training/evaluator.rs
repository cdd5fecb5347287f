//! Head-to-head and baseline evaluation.
//!
//! Promotion is decided by playing the candidate against the current
//! best under a fixed seed and a small fixed ε, never by self-reported
//! training metrics. Ties promote — an explicit anti-stagnation policy.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::opponents::BaselineOpponent;
use crate::agent::FrozenAgent;
use crate::chess::{Color, GameTermination};
use crate::config::TrainingConfig;
use crate::env::{ChessEnvironment, RewardTable, StepInfo};
use crate::error::{Result, TrainingError};

/// Salt folded into the run seed for evaluation RNG streams.
pub const EVAL_SALT: u64 = 0xe0a1_0000_5a17_c0fe;

/// ε used by both sides during evaluation games: small enough to stay
/// policy-faithful, non-zero so color-alternated games differ.
const EVAL_EPSILON: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvaluationOutcome {
    pub games: usize,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
}

impl EvaluationOutcome {
    /// `(wins + 0.5·draws) / games`; 0.5 on zero games.
    pub fn outcome_score(&self) -> f64 {
        if self.games == 0 {
            return 0.5;
        }
        (self.wins as f64 + 0.5 * self.draws as f64) / self.games as f64
    }
}

/// The promotion rule: score ≥ 0.5, ties included.
pub fn should_promote(outcome_score: f64) -> bool {
    outcome_score >= 0.5
}

/// Play `games` deterministic games of candidate vs incumbent, colors
/// alternating. Step-limit truncations score as draws.
pub fn head_to_head(
    candidate_params: &Path,
    incumbent_params: &Path,
    cfg: &TrainingConfig,
    seed: u64,
    games: usize,
) -> Result<EvaluationOutcome> {
    let candidate = FrozenAgent::from_file(candidate_params, &cfg.hidden_layers, EVAL_EPSILON)?;
    let incumbent = FrozenAgent::from_file(incumbent_params, &cfg.hidden_layers, EVAL_EPSILON)?;
    let mut rng = StdRng::seed_from_u64(seed ^ EVAL_SALT);
    let mut env = ChessEnvironment::new(RewardTable::from_config(cfg), cfg.max_steps_per_game);

    let mut outcome = EvaluationOutcome::default();
    for game_idx in 0..games {
        let candidate_color = if game_idx % 2 == 0 {
            Color::White
        } else {
            Color::Black
        };
        let points = play_pair(&mut env, &candidate, &incumbent, candidate_color, &mut rng)?;
        outcome.games += 1;
        match points {
            2 => outcome.wins += 1,
            1 => outcome.draws += 1,
            _ => outcome.losses += 1,
        }
    }
    Ok(outcome)
}

/// One candidate-vs-incumbent game; returns candidate points doubled
/// (2 win, 1 draw, 0 loss).
fn play_pair(
    env: &mut ChessEnvironment,
    candidate: &FrozenAgent,
    incumbent: &FrozenAgent,
    candidate_color: Color,
    rng: &mut StdRng,
) -> Result<u8> {
    env.reset();
    loop {
        let state = env.encode();
        let mask = env.legal_mask();
        let mover = env.side_to_move();
        let agent = if mover == candidate_color {
            candidate
        } else {
            incumbent
        };
        let action = agent.select_action(&state, &mask, rng)?;
        let step = env.step(action)?;
        match step.info {
            StepInfo::Terminal(GameTermination::Checkmate { winner }) => {
                return Ok(if winner == candidate_color { 2 } else { 0 });
            }
            StepInfo::Terminal(_) | StepInfo::StepLimitReached => return Ok(1),
            StepInfo::Ongoing => {}
        }
    }
}

/// Model vs scripted baseline, for `--evaluate --baseline`.
pub fn against_baseline(
    model_params: &Path,
    opponent: BaselineOpponent,
    cfg: &TrainingConfig,
    seed: u64,
    games: usize,
) -> Result<EvaluationOutcome> {
    let model = FrozenAgent::from_file(model_params, &cfg.hidden_layers, EVAL_EPSILON)?;
    let mut rng = StdRng::seed_from_u64(seed ^ EVAL_SALT);
    let mut env = ChessEnvironment::new(RewardTable::from_config(cfg), cfg.max_steps_per_game);

    let mut outcome = EvaluationOutcome::default();
    for game_idx in 0..games {
        let model_color = if game_idx % 2 == 0 {
            Color::White
        } else {
            Color::Black
        };
        env.reset();
        let points = loop {
            let mover = env.side_to_move();
            let action = if mover == model_color {
                let state = env.encode();
                let mask = env.legal_mask();
                model.select_action(&state, &mask, &mut rng)?
            } else {
                let mv = opponent.select_move(env.board()).ok_or_else(|| {
                    TrainingError::Encoding(
                        "baseline asked to move in a terminal position".into(),
                    )
                })?;
                mv.action()
            };
            let step = env.step(action)?;
            match step.info {
                StepInfo::Terminal(GameTermination::Checkmate { winner }) => {
                    break if winner == model_color { 2 } else { 0 };
                }
                StepInfo::Terminal(_) | StepInfo::StepLimitReached => break 1,
                StepInfo::Ongoing => {}
            }
        };
        outcome.games += 1;
        match points {
            2 => outcome.wins += 1,
            1 => outcome.draws += 1,
            _ => outcome.losses += 1,
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    #[test]
    fn ties_promote_and_losses_do_not() {
        let tie = EvaluationOutcome {
            games: 6,
            wins: 2,
            draws: 2,
            losses: 2,
        };
        assert_eq!(tie.outcome_score(), 0.5);
        assert!(should_promote(tie.outcome_score()));

        let losing = EvaluationOutcome {
            games: 6,
            wins: 1,
            draws: 2,
            losses: 3,
        };
        assert!(losing.outcome_score() < 0.5);
        assert!(!should_promote(losing.outcome_score()));
    }

    #[test]
    fn zero_games_is_a_vacuous_tie() {
        assert_eq!(EvaluationOutcome::default().outcome_score(), 0.5);
        assert!(should_promote(EvaluationOutcome::default().outcome_score()));
    }

    #[test]
    fn head_to_head_is_idempotent_for_a_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = TrainingConfig::fast_debug();
        cfg.hidden_layers = vec![8];
        cfg.max_steps_per_game = 12;

        tch::manual_seed(51);
        let a = Agent::new(&cfg.hidden_layers, 0.0, 1);
        let a_path = dir.path().join("a.safetensors");
        a.save(&a_path).unwrap();
        tch::manual_seed(52);
        let b = Agent::new(&cfg.hidden_layers, 0.0, 1);
        let b_path = dir.path().join("b.safetensors");
        b.save(&b_path).unwrap();

        let first = head_to_head(&a_path, &b_path, &cfg, 7, 4).unwrap();
        let second = head_to_head(&a_path, &b_path, &cfg, 7, 4).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.games, 4);
        assert_eq!(
            first.wins + first.draws + first.losses,
            first.games,
            "every game is scored exactly once"
        );
    }

    #[test]
    fn baseline_evaluation_completes_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = TrainingConfig::fast_debug();
        cfg.hidden_layers = vec![8];
        cfg.max_steps_per_game = 10;

        tch::manual_seed(53);
        let model = Agent::new(&cfg.hidden_layers, 0.0, 1);
        let path = dir.path().join("m.safetensors");
        model.save(&path).unwrap();

        let outcome = against_baseline(&path, BaselineOpponent::Heuristic, &cfg, 3, 2).unwrap();
        assert_eq!(outcome.games, 2);
    }
}
