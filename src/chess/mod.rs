//! Compact chess rules engine.
//!
//! The training core consumes this through the environment adapter only:
//! legal move generation, move application, terminal classification, and
//! FEN for diagnostics. No search, no evaluation.

pub mod board;
pub mod fen;
pub mod movegen;
pub mod rules;

pub use board::{file_of, rank_of, square, Board, Color, Move, Piece, PieceKind};
pub use fen::{board_from_fen, board_to_fen, STARTING_FEN};
pub use movegen::{in_check, is_square_attacked, legal_moves};
pub use rules::{terminal_state, GameTermination};
