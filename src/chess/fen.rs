//! FEN parsing and formatting.
//!
//! Used by error reporting (`IllegalActionError` carries the position),
//! checkpoint tooling, and tests. The six standard fields are supported;
//! repetition history naturally restarts at the parsed position.

use super::board::{
    file_of, rank_of, square, Board, Color, Piece, PieceKind, CASTLE_BK, CASTLE_BQ, CASTLE_WK,
    CASTLE_WQ,
};

/// Render the position as a FEN string.
pub fn board_to_fen(board: &Board) -> String {
    let mut fen = String::new();
    for rank in (0..8u8).rev() {
        let mut empty = 0;
        for file in 0..8u8 {
            match board.piece_at(square(file, rank)) {
                None => empty += 1,
                Some(piece) => {
                    if empty > 0 {
                        fen.push_str(&empty.to_string());
                        empty = 0;
                    }
                    fen.push(piece_char(piece));
                }
            }
        }
        if empty > 0 {
            fen.push_str(&empty.to_string());
        }
        if rank > 0 {
            fen.push('/');
        }
    }

    fen.push(' ');
    fen.push(match board.side_to_move() {
        Color::White => 'w',
        Color::Black => 'b',
    });

    fen.push(' ');
    let rights = board.castling_rights();
    if rights == 0 {
        fen.push('-');
    } else {
        for (bit, c) in [
            (CASTLE_WK, 'K'),
            (CASTLE_WQ, 'Q'),
            (CASTLE_BK, 'k'),
            (CASTLE_BQ, 'q'),
        ] {
            if rights & bit != 0 {
                fen.push(c);
            }
        }
    }

    fen.push(' ');
    match board.ep_square() {
        None => fen.push('-'),
        Some(sq) => {
            fen.push((b'a' + file_of(sq)) as char);
            fen.push((b'1' + rank_of(sq)) as char);
        }
    }

    fen.push_str(&format!(
        " {} {}",
        board.halfmove_clock(),
        board.fullmove_number()
    ));
    fen
}

/// Parse a FEN string into a board.
pub fn board_from_fen(fen: &str) -> Result<Board, String> {
    let fields: Vec<&str> = fen.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(format!("FEN needs 6 fields, got {}", fields.len()));
    }

    let mut squares = [None; 64];
    let ranks: Vec<&str> = fields[0].split('/').collect();
    if ranks.len() != 8 {
        return Err(format!("FEN needs 8 ranks, got {}", ranks.len()));
    }
    for (row, rank_str) in ranks.iter().enumerate() {
        let rank = 7 - row as u8;
        let mut file = 0u8;
        for c in rank_str.chars() {
            if let Some(skip) = c.to_digit(10) {
                file += skip as u8;
            } else {
                if file >= 8 {
                    return Err(format!("rank overflow in '{rank_str}'"));
                }
                squares[square(file, rank) as usize] = Some(piece_from_char(c)?);
                file += 1;
            }
        }
        if file != 8 {
            return Err(format!("rank '{rank_str}' covers {file} files"));
        }
    }

    let side_to_move = match fields[1] {
        "w" => Color::White,
        "b" => Color::Black,
        other => return Err(format!("bad side to move '{other}'")),
    };

    let mut castling = 0u8;
    if fields[2] != "-" {
        for c in fields[2].chars() {
            castling |= match c {
                'K' => CASTLE_WK,
                'Q' => CASTLE_WQ,
                'k' => CASTLE_BK,
                'q' => CASTLE_BQ,
                other => return Err(format!("bad castling flag '{other}'")),
            };
        }
    }

    let ep_square = match fields[3] {
        "-" => None,
        alg => {
            let bytes = alg.as_bytes();
            if bytes.len() != 2
                || !(b'a'..=b'h').contains(&bytes[0])
                || !(b'1'..=b'8').contains(&bytes[1])
            {
                return Err(format!("bad en passant square '{alg}'"));
            }
            Some(square(bytes[0] - b'a', bytes[1] - b'1'))
        }
    };

    let halfmove_clock = fields[4]
        .parse::<u32>()
        .map_err(|_| format!("bad halfmove clock '{}'", fields[4]))?;
    let fullmove_number = fields[5]
        .parse::<u32>()
        .map_err(|_| format!("bad fullmove number '{}'", fields[5]))?;

    Ok(Board::from_parts(
        squares,
        side_to_move,
        castling,
        ep_square,
        halfmove_clock,
        fullmove_number,
    ))
}

fn piece_char(piece: Piece) -> char {
    let c = match piece.kind {
        PieceKind::Pawn => 'p',
        PieceKind::Knight => 'n',
        PieceKind::Bishop => 'b',
        PieceKind::Rook => 'r',
        PieceKind::Queen => 'q',
        PieceKind::King => 'k',
    };
    match piece.color {
        Color::White => c.to_ascii_uppercase(),
        Color::Black => c,
    }
}

fn piece_from_char(c: char) -> Result<Piece, String> {
    let kind = match c.to_ascii_lowercase() {
        'p' => PieceKind::Pawn,
        'n' => PieceKind::Knight,
        'b' => PieceKind::Bishop,
        'r' => PieceKind::Rook,
        'q' => PieceKind::Queen,
        'k' => PieceKind::King,
        other => return Err(format!("bad piece char '{other}'")),
    };
    let color = if c.is_ascii_uppercase() {
        Color::White
    } else {
        Color::Black
    };
    Ok(Piece { color, kind })
}

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_position_round_trip() {
        let board = Board::starting();
        assert_eq!(board_to_fen(&board), STARTING_FEN);
        let parsed = board_from_fen(STARTING_FEN).unwrap();
        assert_eq!(board_to_fen(&parsed), STARTING_FEN);
        assert_eq!(parsed.zobrist_key(), board.zobrist_key());
    }

    #[test]
    fn arbitrary_position_round_trip() {
        let fen = "r1bqk2r/pppp1ppp/2n2n2/2b1p3/2B1P3/5N2/PPPP1PPP/RNBQ1RK1 b kq - 5 4";
        let board = board_from_fen(fen).unwrap();
        assert_eq!(board_to_fen(&board), fen);
    }

    #[test]
    fn malformed_fens_rejected() {
        for bad in [
            "",
            "8/8/8/8/8/8/8/8",
            "9/8/8/8/8/8/8/8 w - - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR x KQkq - 0 1",
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq z9 0 1",
        ] {
            assert!(board_from_fen(bad).is_err(), "accepted: {bad}");
        }
    }
}
