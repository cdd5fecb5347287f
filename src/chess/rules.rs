//! Terminal position classification.
//!
//! Natural terminals only; the step-limit cutoff is the orchestrator's
//! business, not the rules engine's.

use super::board::{Board, Color, PieceKind};
use super::movegen::{in_check, legal_moves};

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameTermination {
    Checkmate { winner: Color },
    Stalemate,
    InsufficientMaterial,
    ThreefoldRepetition,
    FiftyMoveRule,
}

impl GameTermination {
    pub fn is_draw(self) -> bool {
        !matches!(self, GameTermination::Checkmate { .. })
    }
}

/// Classify the position, or `None` while the game is still live.
///
/// Mate and stalemate outrank the counting rules: a position with no legal
/// moves is decided even if the fifty-move counter also expired.
pub fn terminal_state(board: &Board) -> Option<GameTermination> {
    if legal_moves(board).is_empty() {
        return Some(if in_check(board) {
            GameTermination::Checkmate {
                winner: board.side_to_move().opposite(),
            }
        } else {
            GameTermination::Stalemate
        });
    }
    if board.halfmove_clock() >= 100 {
        return Some(GameTermination::FiftyMoveRule);
    }
    if board.repetition_count() >= 3 {
        return Some(GameTermination::ThreefoldRepetition);
    }
    if insufficient_material(board) {
        return Some(GameTermination::InsufficientMaterial);
    }
    None
}

/// K vs K, K+B vs K, K+N vs K, and K+B vs K+B with same-colored bishops.
fn insufficient_material(board: &Board) -> bool {
    let mut minor_squares: Vec<(Color, PieceKind, u8)> = Vec::new();
    for sq in 0..64u8 {
        let Some(piece) = board.piece_at(sq) else {
            continue;
        };
        match piece.kind {
            PieceKind::King => {}
            PieceKind::Bishop | PieceKind::Knight => {
                minor_squares.push((piece.color, piece.kind, sq));
                if minor_squares.len() > 2 {
                    return false;
                }
            }
            _ => return false,
        }
    }
    match minor_squares.as_slice() {
        [] => true,
        [_] => true,
        [(c1, PieceKind::Bishop, s1), (c2, PieceKind::Bishop, s2)] if c1 != c2 => {
            // Same square color => neither side can ever mate.
            let shade = |sq: u8| (sq / 8 + sq % 8) % 2;
            shade(*s1) == shade(*s2)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::board::Move;
    use crate::chess::fen::board_from_fen;

    #[test]
    fn live_position_is_not_terminal() {
        assert_eq!(terminal_state(&Board::starting()), None);
    }

    #[test]
    fn checkmate_names_the_winner() {
        let board = board_from_fen("7k/7Q/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert_eq!(
            terminal_state(&board),
            Some(GameTermination::Checkmate {
                winner: Color::White
            })
        );
    }

    #[test]
    fn stalemate_detected() {
        let board = board_from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert_eq!(terminal_state(&board), Some(GameTermination::Stalemate));
    }

    #[test]
    fn fifty_move_rule_trips_at_100_plies() {
        let board = board_from_fen("4k3/8/8/8/8/8/8/4K2R w - - 100 80").unwrap();
        assert_eq!(terminal_state(&board), Some(GameTermination::FiftyMoveRule));
    }

    #[test]
    fn threefold_repetition_detected() {
        let mut board = Board::starting();
        for _ in 0..2 {
            board.apply_move(Move::new(6, 21)); // Ng1f3
            board.apply_move(Move::new(62, 45)); // Ng8f6
            board.apply_move(Move::new(21, 6)); // Nf3g1
            board.apply_move(Move::new(45, 62)); // Nf6g8
        }
        assert_eq!(
            terminal_state(&board),
            Some(GameTermination::ThreefoldRepetition)
        );
    }

    #[test]
    fn bare_kings_are_a_draw() {
        let board = board_from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 1").unwrap();
        assert_eq!(
            terminal_state(&board),
            Some(GameTermination::InsufficientMaterial)
        );
    }

    #[test]
    fn same_shade_bishops_are_a_draw_opposite_are_not() {
        let opposite = board_from_fen("2b1k3/8/8/8/8/8/8/2B1K3 w - - 0 1").unwrap();
        assert_eq!(terminal_state(&opposite), None);
        let same = board_from_fen("1b2k3/8/8/8/8/8/8/2B1K3 w - - 0 1").unwrap();
        assert_eq!(
            terminal_state(&same),
            Some(GameTermination::InsufficientMaterial)
        );
    }

    #[test]
    fn rook_endgame_is_sufficient_material() {
        let board = board_from_fen("4k3/8/8/8/8/8/8/4K2R w - - 0 1").unwrap();
        assert_eq!(terminal_state(&board), None);
    }
}
