//! Legal move generation.
//!
//! Pseudo-legal moves are generated per piece and filtered by applying each
//! one to a copy of the board and rejecting positions that leave the mover's
//! king attacked. Castling legality (rights, empty path, no attacked transit
//! square) is handled during generation.

use super::board::{
    file_of, rank_of, square, Board, Color, Move, Piece, PieceKind, CASTLE_BK, CASTLE_BQ,
    CASTLE_WK, CASTLE_WQ,
};

const KNIGHT_DELTAS: [(i8, i8); 8] = [
    (-2, -1),
    (-2, 1),
    (-1, -2),
    (-1, 2),
    (1, -2),
    (1, 2),
    (2, -1),
    (2, 1),
];

const KING_DELTAS: [(i8, i8); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

const BISHOP_DIRS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];
const ROOK_DIRS: [(i8, i8); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

fn offset(sq: u8, df: i8, dr: i8) -> Option<u8> {
    let file = file_of(sq) as i8 + df;
    let rank = rank_of(sq) as i8 + dr;
    if (0..8).contains(&file) && (0..8).contains(&rank) {
        Some(square(file as u8, rank as u8))
    } else {
        None
    }
}

/// All legal moves for the side to move. Deterministic ordering: ascending
/// by from-square, then to-square.
pub fn legal_moves(board: &Board) -> Vec<Move> {
    let mover = board.side_to_move();
    let mut moves = pseudo_legal_moves(board, mover);
    moves.retain(|&mv| !leaves_king_in_check(board, mv, mover));
    moves.sort_by_key(|mv| mv.action());
    moves
}

/// True when `sq` is attacked by any piece of `attacker`.
pub fn is_square_attacked(board: &Board, sq: u8, attacker: Color) -> bool {
    // Pawn attacks run toward the defender's side.
    let pawn_dr: i8 = match attacker {
        Color::White => -1,
        Color::Black => 1,
    };
    for df in [-1i8, 1] {
        if let Some(from) = offset(sq, df, pawn_dr) {
            if board.piece_at(from)
                == Some(Piece {
                    color: attacker,
                    kind: PieceKind::Pawn,
                })
            {
                return true;
            }
        }
    }

    for (df, dr) in KNIGHT_DELTAS {
        if let Some(from) = offset(sq, df, dr) {
            if board.piece_at(from)
                == Some(Piece {
                    color: attacker,
                    kind: PieceKind::Knight,
                })
            {
                return true;
            }
        }
    }

    for (df, dr) in KING_DELTAS {
        if let Some(from) = offset(sq, df, dr) {
            if board.piece_at(from)
                == Some(Piece {
                    color: attacker,
                    kind: PieceKind::King,
                })
            {
                return true;
            }
        }
    }

    for (dirs, diagonal) in [(BISHOP_DIRS, true), (ROOK_DIRS, false)] {
        for (df, dr) in dirs {
            let mut cur = sq;
            while let Some(next) = offset(cur, df, dr) {
                if let Some(piece) = board.piece_at(next) {
                    if piece.color == attacker {
                        let slides = match piece.kind {
                            PieceKind::Queen => true,
                            PieceKind::Bishop => diagonal,
                            PieceKind::Rook => !diagonal,
                            _ => false,
                        };
                        if slides {
                            return true;
                        }
                    }
                    break;
                }
                cur = next;
            }
        }
    }

    false
}

/// True when the side to move is in check.
pub fn in_check(board: &Board) -> bool {
    let mover = board.side_to_move();
    match board.king_square(mover) {
        Some(king_sq) => is_square_attacked(board, king_sq, mover.opposite()),
        None => false,
    }
}

fn leaves_king_in_check(board: &Board, mv: Move, mover: Color) -> bool {
    let mut next = board.clone();
    next.apply_move(mv);
    match next.king_square(mover) {
        Some(king_sq) => is_square_attacked(&next, king_sq, mover.opposite()),
        None => true,
    }
}

fn pseudo_legal_moves(board: &Board, mover: Color) -> Vec<Move> {
    let mut moves = Vec::with_capacity(64);
    for from in 0..64u8 {
        let Some(piece) = board.piece_at(from) else {
            continue;
        };
        if piece.color != mover {
            continue;
        }
        match piece.kind {
            PieceKind::Pawn => pawn_moves(board, from, mover, &mut moves),
            PieceKind::Knight => {
                leaper_moves(board, from, mover, &KNIGHT_DELTAS, &mut moves);
            }
            PieceKind::King => {
                leaper_moves(board, from, mover, &KING_DELTAS, &mut moves);
                castle_moves(board, from, mover, &mut moves);
            }
            PieceKind::Bishop => slider_moves(board, from, mover, &BISHOP_DIRS, &mut moves),
            PieceKind::Rook => slider_moves(board, from, mover, &ROOK_DIRS, &mut moves),
            PieceKind::Queen => {
                slider_moves(board, from, mover, &BISHOP_DIRS, &mut moves);
                slider_moves(board, from, mover, &ROOK_DIRS, &mut moves);
            }
        }
    }
    moves
}

fn leaper_moves(board: &Board, from: u8, mover: Color, deltas: &[(i8, i8)], out: &mut Vec<Move>) {
    for &(df, dr) in deltas {
        if let Some(to) = offset(from, df, dr) {
            match board.piece_at(to) {
                Some(piece) if piece.color == mover => {}
                _ => out.push(Move::new(from, to)),
            }
        }
    }
}

fn slider_moves(board: &Board, from: u8, mover: Color, dirs: &[(i8, i8)], out: &mut Vec<Move>) {
    for &(df, dr) in dirs {
        let mut cur = from;
        while let Some(to) = offset(cur, df, dr) {
            match board.piece_at(to) {
                None => out.push(Move::new(from, to)),
                Some(piece) => {
                    if piece.color != mover {
                        out.push(Move::new(from, to));
                    }
                    break;
                }
            }
            cur = to;
        }
    }
}

fn pawn_moves(board: &Board, from: u8, mover: Color, out: &mut Vec<Move>) {
    let (dr, start_rank): (i8, u8) = match mover {
        Color::White => (1, 1),
        Color::Black => (-1, 6),
    };

    if let Some(to) = offset(from, 0, dr) {
        if board.piece_at(to).is_none() {
            out.push(Move::new(from, to));
            if rank_of(from) == start_rank {
                if let Some(double) = offset(from, 0, dr * 2) {
                    if board.piece_at(double).is_none() {
                        out.push(Move::new(from, double));
                    }
                }
            }
        }
    }

    for df in [-1i8, 1] {
        if let Some(to) = offset(from, df, dr) {
            let capturable = matches!(board.piece_at(to), Some(p) if p.color != mover);
            let en_passant = board.ep_square() == Some(to);
            if capturable || en_passant {
                out.push(Move::new(from, to));
            }
        }
    }
}

fn castle_moves(board: &Board, from: u8, mover: Color, out: &mut Vec<Move>) {
    let (home_rank, king_bit, queen_bit) = match mover {
        Color::White => (0u8, CASTLE_WK, CASTLE_WQ),
        Color::Black => (7u8, CASTLE_BK, CASTLE_BQ),
    };
    if from != square(4, home_rank) {
        return;
    }
    let enemy = mover.opposite();
    if is_square_attacked(board, from, enemy) {
        return;
    }

    if board.castling_rights() & king_bit != 0 {
        let path = [square(5, home_rank), square(6, home_rank)];
        if path.iter().all(|&sq| board.piece_at(sq).is_none())
            && path.iter().all(|&sq| !is_square_attacked(board, sq, enemy))
        {
            out.push(Move::new(from, square(6, home_rank)));
        }
    }
    if board.castling_rights() & queen_bit != 0 {
        let empty = [
            square(1, home_rank),
            square(2, home_rank),
            square(3, home_rank),
        ];
        let safe = [square(2, home_rank), square(3, home_rank)];
        if empty.iter().all(|&sq| board.piece_at(sq).is_none())
            && safe.iter().all(|&sq| !is_square_attacked(board, sq, enemy))
        {
            out.push(Move::new(from, square(2, home_rank)));
        }
    }
}
