//! Scripted baseline opponents for offline evaluation.
//!
//! A material-greedy heuristic and a shallow alpha-beta searcher. These
//! never touch the learner; they exist so `--evaluate --baseline` can
//! rank a model against something that is not itself.

use crate::chess::{legal_moves, terminal_state, Board, Color, GameTermination, Move, PieceKind};

/// Centipawn-ish piece values.
fn piece_value(kind: PieceKind) -> i32 {
    match kind {
        PieceKind::Pawn => 100,
        PieceKind::Knight => 320,
        PieceKind::Bishop => 330,
        PieceKind::Rook => 500,
        PieceKind::Queen => 900,
        PieceKind::King => 0,
    }
}

/// Material balance from `perspective`'s seat.
fn material(board: &Board, perspective: Color) -> i32 {
    let mut score = 0;
    for sq in 0..64u8 {
        if let Some(piece) = board.piece_at(sq) {
            let value = piece_value(piece.kind);
            if piece.color == perspective {
                score += value;
            } else {
                score -= value;
            }
        }
    }
    score
}

const MATE_SCORE: i32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineOpponent {
    /// One-ply material greed; ties broken by lowest action index.
    Heuristic,
    /// Fixed-depth alpha-beta over the material evaluation.
    Minimax { depth: u32 },
}

impl BaselineOpponent {
    /// Pick a move for the side to move; `None` only on terminal
    /// positions.
    pub fn select_move(&self, board: &Board) -> Option<Move> {
        let moves = legal_moves(board);
        if moves.is_empty() {
            return None;
        }
        let mover = board.side_to_move();
        let depth = match self {
            BaselineOpponent::Heuristic => 1,
            BaselineOpponent::Minimax { depth } => (*depth).max(1),
        };

        let mut best: Option<(Move, i32)> = None;
        for mv in moves {
            let mut next = board.clone();
            next.apply_move(mv);
            let score = -negamax(&next, depth - 1, -MATE_SCORE, MATE_SCORE, mover.opposite());
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((mv, score)),
            }
        }
        best.map(|(mv, _)| mv)
    }
}

fn negamax(board: &Board, depth: u32, mut alpha: i32, beta: i32, perspective: Color) -> i32 {
    match terminal_state(board) {
        Some(GameTermination::Checkmate { winner }) => {
            // Depth-discounted so nearer mates rank higher.
            return if winner == perspective {
                MATE_SCORE - depth as i32
            } else {
                -(MATE_SCORE - depth as i32)
            };
        }
        Some(_) => return 0,
        None => {}
    }
    if depth == 0 {
        return material(board, perspective);
    }

    let mut best = -MATE_SCORE;
    for mv in legal_moves(board) {
        let mut next = board.clone();
        next.apply_move(mv);
        let score = -negamax(&next, depth - 1, -beta, -alpha, perspective.opposite());
        best = best.max(score);
        alpha = alpha.max(score);
        if alpha >= beta {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::board_from_fen;

    #[test]
    fn heuristic_grabs_a_hanging_queen() {
        // White rook on d1 can take the undefended queen on d8.
        let board = board_from_fen("3qk3/8/8/8/8/8/8/3RK3 w - - 0 1").unwrap();
        let mv = BaselineOpponent::Heuristic.select_move(&board).unwrap();
        assert_eq!(mv, Move::new(3, 59));
    }

    #[test]
    fn minimax_finds_mate_in_one() {
        // Qg7#/Qh7# supported by the king on g6.
        let board = board_from_fen("7k/1Q6/6K1/8/8/8/8/8 w - - 0 1").unwrap();
        let mv = BaselineOpponent::Minimax { depth: 2 }
            .select_move(&board)
            .unwrap();
        let mut next = board.clone();
        next.apply_move(mv);
        assert!(matches!(
            terminal_state(&next),
            Some(GameTermination::Checkmate { winner: Color::White })
        ));
    }

    #[test]
    fn terminal_position_yields_no_move() {
        let board = board_from_fen("7k/7Q/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert!(BaselineOpponent::Heuristic.select_move(&board).is_none());
    }

    #[test]
    fn selection_is_deterministic() {
        let board = Board::starting();
        let a = BaselineOpponent::Minimax { depth: 2 }.select_move(&board);
        let b = BaselineOpponent::Minimax { depth: 2 }.select_move(&board);
        assert_eq!(a, b);
    }
}
