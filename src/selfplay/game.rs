//! One self-play game between two frozen agents.
//!
//! Only the learner's transitions are recorded. Each transition chains
//! `(s, a)` at the learner's turn to the next state where the learner is
//! again to move (or to the terminal position), so the opponent's reply is
//! folded into the environment dynamics.

use std::time::Instant;

use rand::rngs::StdRng;

use crate::agent::FrozenAgent;
use crate::chess::{Color, GameTermination};
use crate::env::{ActionMask, ChessEnvironment, StepInfo};
use crate::error::Result;
use crate::replay::Transition;

/// Game-level outcome, color-absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    WhiteWins,
    BlackWins,
    Draw,
    StepLimit,
}

impl GameOutcome {
    pub fn code(self) -> u8 {
        match self {
            GameOutcome::WhiteWins => 0,
            GameOutcome::BlackWins => 1,
            GameOutcome::Draw => 2,
            GameOutcome::StepLimit => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GameOutcome::WhiteWins),
            1 => Some(GameOutcome::BlackWins),
            2 => Some(GameOutcome::Draw),
            3 => Some(GameOutcome::StepLimit),
            _ => None,
        }
    }
}

/// Why the game stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    ThreefoldRepetition,
    FiftyMoveRule,
    StepLimit,
    Timeout,
}

impl TerminationReason {
    pub fn code(self) -> u8 {
        match self {
            TerminationReason::Checkmate => 0,
            TerminationReason::Stalemate => 1,
            TerminationReason::InsufficientMaterial => 2,
            TerminationReason::ThreefoldRepetition => 3,
            TerminationReason::FiftyMoveRule => 4,
            TerminationReason::StepLimit => 5,
            TerminationReason::Timeout => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TerminationReason::Checkmate),
            1 => Some(TerminationReason::Stalemate),
            2 => Some(TerminationReason::InsufficientMaterial),
            3 => Some(TerminationReason::ThreefoldRepetition),
            4 => Some(TerminationReason::FiftyMoveRule),
            5 => Some(TerminationReason::StepLimit),
            6 => Some(TerminationReason::Timeout),
            _ => None,
        }
    }

    fn from_natural(kind: GameTermination) -> Self {
        match kind {
            GameTermination::Checkmate { .. } => TerminationReason::Checkmate,
            GameTermination::Stalemate => TerminationReason::Stalemate,
            GameTermination::InsufficientMaterial => TerminationReason::InsufficientMaterial,
            GameTermination::ThreefoldRepetition => TerminationReason::ThreefoldRepetition,
            GameTermination::FiftyMoveRule => TerminationReason::FiftyMoveRule,
        }
    }
}

/// A completed game with the learner's transitions. Immutable.
#[derive(Debug, Clone)]
pub struct GameResult {
    pub episode_id: u64,
    pub transitions: Vec<Transition>,
    pub outcome: GameOutcome,
    pub termination: TerminationReason,
    pub length_plies: u16,
    pub learner_color: Color,
}

impl GameResult {
    /// Outcome points from the learner's seat: 1 win, 0.5 draw, 0 loss.
    /// Step-limit truncations count as draws for scoring.
    pub fn learner_points(&self) -> f64 {
        match (self.outcome, self.learner_color) {
            (GameOutcome::WhiteWins, Color::White) | (GameOutcome::BlackWins, Color::Black) => 1.0,
            (GameOutcome::WhiteWins, Color::Black) | (GameOutcome::BlackWins, Color::White) => 0.0,
            (GameOutcome::Draw | GameOutcome::StepLimit, _) => 0.5,
        }
    }
}

/// Wall-clock and ply limits for one game.
pub struct GameLimits {
    pub game_deadline: Instant,
    /// Cooperative cancellation; checked between plies. A cancelled game
    /// is discarded entirely.
    pub cancelled: Option<Box<dyn Fn() -> bool>>,
}

impl GameLimits {
    fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().is_some_and(|f| f())
    }
}

/// Drive one game to completion. `Ok(None)` means the game was cancelled
/// and its partial transitions must be discarded; a per-game deadline
/// instead truncates to a kept step-limit result.
pub fn play_game(
    env: &mut ChessEnvironment,
    learner: &FrozenAgent,
    opponent: &FrozenAgent,
    learner_color: Color,
    episode_id: u64,
    rng: &mut StdRng,
    limits: &GameLimits,
) -> Result<Option<GameResult>> {
    env.reset();
    let rewards = env.rewards();
    let mut transitions: Vec<Transition> = Vec::new();
    // The learner's move awaiting its successor state.
    let mut pending: Option<(Vec<f32>, u16, f32, u16)> = None;

    let (outcome, termination) = loop {
        if limits.is_cancelled() {
            return Ok(None);
        }

        let state = env.encode();
        let mask = env.legal_mask();
        let mover = env.side_to_move();
        let ply = env.steps_taken() as u16;

        if mover == learner_color {
            if let Some((s, a, r, p)) = pending.take() {
                transitions.push(Transition {
                    state: s,
                    action: a,
                    reward: r,
                    next_state: state.clone(),
                    next_mask: mask,
                    done: false,
                    quality: 0.0,
                    episode_id,
                    ply: p,
                });
            }
        }

        let action = if mover == learner_color {
            learner.select_action(&state, &mask, rng)?
        } else {
            opponent.select_action(&state, &mask, rng)?
        };
        let step = env.step(action)?;

        if mover == learner_color {
            pending = Some((state, action, step.reward, ply));
        }

        match step.info {
            StepInfo::Terminal(kind) => {
                let outcome = match kind {
                    GameTermination::Checkmate {
                        winner: Color::White,
                    } => GameOutcome::WhiteWins,
                    GameTermination::Checkmate {
                        winner: Color::Black,
                    } => GameOutcome::BlackWins,
                    _ => GameOutcome::Draw,
                };
                // A terminal reached by the opponent's move rewrites the
                // learner's pending reward: it just learned the outcome.
                if mover != learner_color {
                    if let Some(p) = pending.as_mut() {
                        p.2 = match kind {
                            GameTermination::Checkmate { .. } => rewards.loss,
                            _ => rewards.draw,
                        };
                    }
                }
                break (outcome, TerminationReason::from_natural(kind));
            }
            StepInfo::StepLimitReached => {
                break (GameOutcome::StepLimit, TerminationReason::StepLimit);
            }
            StepInfo::Ongoing => {}
        }

        if Instant::now() >= limits.game_deadline {
            break (GameOutcome::StepLimit, TerminationReason::Timeout);
        }
    };

    // Truncations penalize the side to move at the cutoff.
    if outcome == GameOutcome::StepLimit {
        if let Some(p) = pending.as_mut() {
            if env.side_to_move() == learner_color {
                p.2 += rewards.step_limit_penalty;
            }
        }
    }

    if let Some((s, a, r, p)) = pending.take() {
        transitions.push(Transition {
            state: s,
            action: a,
            reward: r,
            next_state: env.encode(),
            next_mask: ActionMask::empty(),
            done: true,
            quality: 0.0,
            episode_id,
            ply: p,
        });
    }

    Ok(Some(GameResult {
        episode_id,
        transitions,
        outcome,
        termination,
        length_plies: env.steps_taken() as u16,
        learner_color,
    }))
}
