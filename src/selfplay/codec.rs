//! Binary batch files on the worker wire.
//!
//! One file per completed game: a fixed header followed by
//! length-prefixed transition records
//! `(ply, action, reward, done, state, next_state, bit-packed next mask)`,
//! all little-endian. Workers write to a temp name and rename, so the
//! parent never observes a half-written file; anything that fails to
//! parse drops exactly that game.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::game::{GameOutcome, GameResult, TerminationReason};
use crate::chess::Color;
use crate::env::{ActionMask, MASK_BYTES, STATE_LEN};
use crate::error::{Result, TrainingError};
use crate::replay::Transition;

const MAGIC: &[u8; 4] = b"CDQT";
const VERSION: u8 = 1;

/// ply + action + reward + done + two states + packed mask.
const RECORD_LEN: usize = 2 + 2 + 4 + 1 + 2 * 4 * STATE_LEN + MASK_BYTES;

/// Serialize one game, atomically (`.tmp` + rename).
pub fn write_game(path: &Path, game: &GameResult) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(MAGIC)?;
        w.write_all(&[VERSION])?;
        w.write_all(&game.episode_id.to_le_bytes())?;
        w.write_all(&[
            match game.learner_color {
                Color::White => 0u8,
                Color::Black => 1,
            },
            game.outcome.code(),
            game.termination.code(),
        ])?;
        w.write_all(&game.length_plies.to_le_bytes())?;
        w.write_all(&(game.transitions.len() as u32).to_le_bytes())?;

        for t in &game.transitions {
            w.write_all(&(RECORD_LEN as u32).to_le_bytes())?;
            w.write_all(&t.ply.to_le_bytes())?;
            w.write_all(&t.action.to_le_bytes())?;
            w.write_all(&t.reward.to_le_bytes())?;
            w.write_all(&[t.done as u8])?;
            for value in &t.state {
                w.write_all(&value.to_le_bytes())?;
            }
            for value in &t.next_state {
                w.write_all(&value.to_le_bytes())?;
            }
            w.write_all(&t.next_mask.pack())?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse one game file. Every transition is re-validated on the way in;
/// a malformed file yields an error and the parent drops the game.
pub fn read_game(path: &Path) -> Result<GameResult> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(malformed(path, "bad magic"));
    }
    let version = read_u8(&mut r)?;
    if version != VERSION {
        return Err(malformed(path, &format!("unsupported version {version}")));
    }

    let episode_id = read_u64(&mut r)?;
    let learner_color = match read_u8(&mut r)? {
        0 => Color::White,
        1 => Color::Black,
        other => return Err(malformed(path, &format!("bad color code {other}"))),
    };
    let outcome = GameOutcome::from_code(read_u8(&mut r)?)
        .ok_or_else(|| malformed(path, "bad outcome code"))?;
    let termination = TerminationReason::from_code(read_u8(&mut r)?)
        .ok_or_else(|| malformed(path, "bad termination code"))?;
    let length_plies = read_u16(&mut r)?;
    let count = read_u32(&mut r)? as usize;

    let mut transitions = Vec::with_capacity(count);
    for i in 0..count {
        let record_len = read_u32(&mut r)? as usize;
        if record_len != RECORD_LEN {
            return Err(malformed(
                path,
                &format!("record {i} length {record_len}, expected {RECORD_LEN}"),
            ));
        }
        let ply = read_u16(&mut r)?;
        let action = read_u16(&mut r)?;
        let reward = f32::from_le_bytes(read_array::<4>(&mut r)?);
        let done = match read_u8(&mut r)? {
            0 => false,
            1 => true,
            other => return Err(malformed(path, &format!("bad done flag {other}"))),
        };
        let state = read_f32_vec(&mut r, STATE_LEN)?;
        let next_state = read_f32_vec(&mut r, STATE_LEN)?;
        let mut mask_bytes = vec![0u8; MASK_BYTES];
        r.read_exact(&mut mask_bytes)?;
        let next_mask = ActionMask::unpack(&mask_bytes)
            .ok_or_else(|| malformed(path, &format!("record {i} mask malformed")))?;

        let transition = Transition {
            state,
            action,
            reward,
            next_state,
            next_mask,
            done,
            quality: 0.0,
            episode_id,
            ply,
        };
        transition.validate()?;
        transitions.push(transition);
    }

    // Trailing bytes mean a writer bug or corruption.
    let mut trailer = [0u8; 1];
    if r.read(&mut trailer)? != 0 {
        return Err(malformed(path, "trailing bytes after last record"));
    }

    Ok(GameResult {
        episode_id,
        transitions,
        outcome,
        termination,
        length_plies,
        learner_color,
    })
}

fn malformed(path: &Path, what: &str) -> TrainingError {
    TrainingError::Worker {
        worker_id: usize::MAX,
        reason: format!("malformed batch file {}: {what}", path.display()),
    }
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    Ok(read_array::<1>(r)?[0])
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array::<2>(r)?))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4>(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array::<8>(r)?))
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_f32_vec(r: &mut impl Read, len: usize) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::replay::test_transition;

    fn sample_game() -> GameResult {
        let mut transitions: Vec<Transition> =
            (0..5u16).map(|p| test_transition(9, p, false)).collect();
        transitions.push(test_transition(9, 5, true));
        GameResult {
            episode_id: 9,
            transitions,
            outcome: GameOutcome::WhiteWins,
            termination: TerminationReason::Checkmate,
            length_plies: 11,
            learner_color: Color::White,
        }
    }

    #[test]
    fn game_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game-0.bin");
        let game = sample_game();
        write_game(&path, &game).unwrap();

        let loaded = read_game(&path).unwrap();
        assert_eq!(loaded.episode_id, game.episode_id);
        assert_eq!(loaded.outcome, game.outcome);
        assert_eq!(loaded.termination, game.termination);
        assert_eq!(loaded.length_plies, game.length_plies);
        assert_eq!(loaded.learner_color, game.learner_color);
        assert_eq!(loaded.transitions.len(), game.transitions.len());
        for (a, b) in loaded.transitions.iter().zip(&game.transitions) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game-0.bin");
        write_game(&path, &sample_game()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game-0.bin");
        write_game(&path, &sample_game()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let cut = dir.path().join("cut.bin");
        std::fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();
        assert!(read_game(&cut).is_err());
    }

    #[test]
    fn garbage_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"not a batch file at all").unwrap();
        assert_matches!(
            read_game(&path).unwrap_err(),
            TrainingError::Worker { .. }
        );
    }
}
