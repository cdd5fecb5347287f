//! Environment adapter over the chess rules engine.
//!
//! Translates between the board and the learner's tensor/integer view:
//! fixed-length state vectors, `from * 64 + to` actions, legal-action
//! masks, shaped rewards, and terminal classification. Illegal actions
//! fail fast; silently correcting them would poison the replay stream.

pub mod encoding;

pub use encoding::{encode_board, ActionMask, ACTION_SPACE, MASK_BYTES, STATE_LEN};

use crate::chess::{board_to_fen, legal_moves, terminal_state, Board, Color, GameTermination, Move};
use crate::config::TrainingConfig;
use crate::error::{Result, TrainingError};

/// Reward shape, copied out of the run config.
#[derive(Debug, Clone, Copy)]
pub struct RewardTable {
    pub win: f32,
    pub loss: f32,
    pub draw: f32,
    pub step_limit_penalty: f32,
    pub step: f32,
}

impl RewardTable {
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        RewardTable {
            win: cfg.win_reward,
            loss: cfg.loss_reward,
            draw: cfg.draw_reward,
            step_limit_penalty: cfg.step_limit_penalty,
            step: cfg.step_reward,
        }
    }
}

/// Per-step classification carried next to `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepInfo {
    Ongoing,
    Terminal(GameTermination),
    /// `maxStepsPerGame` reached without a natural terminal. `done` stays
    /// false; the orchestrator converts this into a step-limit outcome.
    StepLimitReached,
}

/// What one environment step produced, from the mover's perspective.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub next_state: Vec<f32>,
    pub next_mask: ActionMask,
    pub reward: f32,
    pub done: bool,
    pub info: StepInfo,
}

/// The environment: one live game, stepped by action index.
#[derive(Debug, Clone)]
pub struct ChessEnvironment {
    board: Board,
    rewards: RewardTable,
    max_steps: usize,
    steps_taken: usize,
}

impl ChessEnvironment {
    pub fn new(rewards: RewardTable, max_steps: usize) -> Self {
        ChessEnvironment {
            board: Board::starting(),
            rewards,
            max_steps,
            steps_taken: 0,
        }
    }

    /// Reset to the starting position. The returned mask carries the 20
    /// legal opening actions.
    pub fn reset(&mut self) -> (Vec<f32>, ActionMask) {
        self.board = Board::starting();
        self.steps_taken = 0;
        (self.encode(), self.legal_mask())
    }

    /// Derived purely from the internal board, byte-identical for
    /// identical positions.
    pub fn legal_mask(&self) -> ActionMask {
        ActionMask::from_moves(&legal_moves(&self.board))
    }

    pub fn encode(&self) -> Vec<f32> {
        encode_board(&self.board)
    }

    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    pub fn rewards(&self) -> RewardTable {
        self.rewards
    }

    /// The live board, for scripted opponents and the play loop.
    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn fen(&self) -> String {
        board_to_fen(&self.board)
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Apply `action` for the side to move.
    ///
    /// The reward is attributed to the mover: a mating move earns `win`,
    /// a move into a draw earns `draw`. The losing side's final reward is
    /// the caller's concern (it learns the outcome only after the reply).
    pub fn step(&mut self, action: u16) -> Result<StepOutcome> {
        if action as usize >= ACTION_SPACE {
            return Err(TrainingError::Encoding(format!(
                "action {action} outside the action space"
            )));
        }
        if !self.legal_mask().contains(action) {
            return Err(TrainingError::IllegalAction {
                action,
                fen: self.fen(),
            });
        }

        self.board.apply_move(Move::from_action(action));
        self.steps_taken += 1;

        let terminal = terminal_state(&self.board);
        let (reward, done, info) = match terminal {
            Some(GameTermination::Checkmate { .. }) => {
                // The mover just delivered mate.
                (self.rewards.win, true, StepInfo::Terminal(terminal.unwrap()))
            }
            Some(kind) => (self.rewards.draw, true, StepInfo::Terminal(kind)),
            None if self.steps_taken >= self.max_steps => {
                (self.rewards.step, false, StepInfo::StepLimitReached)
            }
            None => (self.rewards.step, false, StepInfo::Ongoing),
        };

        // Terminal states expose an all-zero, well-formed mask.
        let next_mask = if done {
            ActionMask::empty()
        } else {
            self.legal_mask()
        };

        Ok(StepOutcome {
            next_state: self.encode(),
            next_mask,
            reward,
            done,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn env() -> ChessEnvironment {
        ChessEnvironment::new(RewardTable::from_config(&TrainingConfig::default()), 120)
    }

    #[test]
    fn reset_exposes_twenty_opening_actions() {
        let mut env = env();
        let (state, mask) = env.reset();
        assert_eq!(state.len(), STATE_LEN);
        assert_eq!(mask.count(), 20);
    }

    #[test]
    fn legal_mask_matches_engine_after_reset() {
        let mut env = env();
        let (_, mask) = env.reset();
        let engine_mask = ActionMask::from_moves(&legal_moves(&Board::starting()));
        assert_eq!(mask, engine_mask);
    }

    #[test]
    fn illegal_action_fails_fast() {
        let mut env = env();
        env.reset();
        let err = env.step(0).unwrap_err(); // a1a1 is never legal
        assert_matches!(err, TrainingError::IllegalAction { action: 0, .. });
    }

    #[test]
    fn legal_step_advances_the_game() {
        let mut env = env();
        let (_, mask) = env.reset();
        let action = mask.legal_actions()[0];
        let outcome = env.step(action).unwrap();
        assert!(!outcome.done);
        assert_eq!(outcome.info, StepInfo::Ongoing);
        assert_eq!(outcome.reward, 0.0);
        assert!(outcome.next_mask.count() > 0);
        assert_eq!(env.side_to_move(), Color::Black);
    }

    #[test]
    fn step_limit_reported_without_done() {
        let mut env = ChessEnvironment::new(RewardTable::from_config(&TrainingConfig::default()), 1);
        let (_, mask) = env.reset();
        let outcome = env.step(mask.legal_actions()[0]).unwrap();
        assert!(!outcome.done);
        assert_eq!(outcome.info, StepInfo::StepLimitReached);
    }

    #[test]
    fn fools_mate_rewards_the_mover() {
        let mut env = env();
        env.reset();
        // 1. f3 e5 2. g4 Qh4#
        let moves = [
            Move::new(13, 21), // f2f3
            Move::new(52, 36), // e7e5
            Move::new(14, 30), // g2g4
            Move::new(59, 31), // d8h4
        ];
        let mut last = None;
        for mv in moves {
            last = Some(env.step(mv.action()).unwrap());
        }
        let outcome = last.unwrap();
        assert!(outcome.done);
        assert_eq!(outcome.reward, 1.0);
        assert!(outcome.next_mask.is_empty());
        assert_matches!(
            outcome.info,
            StepInfo::Terminal(GameTermination::Checkmate {
                winner: Color::Black
            })
        );
    }
}
