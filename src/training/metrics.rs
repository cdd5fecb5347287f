//! Per-cycle metrics, appended as NDJSON.
//!
//! One JSON object per cycle in `<checkpointDirectory>/metrics.ndjson`;
//! the file is append-only so partial runs remain auditable.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chess::Color;
use crate::error::Result;
use crate::selfplay::{GameOutcome, GameResult, TerminationReason};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle: usize,
    pub loss_mean: f64,
    pub td_mean: f64,
    pub grad_norm_mean: f64,
    pub entropy_mean: f64,
    pub games: usize,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
    pub step_limit: usize,
    pub avg_length: f64,
    pub outcome_score: f64,
    pub promoted: bool,
    pub wall_seconds: f64,
    pub failed_workers: usize,
    /// Hash of the cross-worker ingestion order, for audits.
    pub ingest_fingerprint: String,
    /// Present on aborted cycles; training metrics are zero then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

/// Append one cycle's line.
pub fn append_metrics(path: &Path, metrics: &CycleMetrics) -> Result<()> {
    let line = serde_json::to_string(metrics)?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Win/draw/loss tallies from the learner's seat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GameStats {
    pub games: usize,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
    pub step_limit: usize,
    pub avg_length: f64,
}

pub fn summarize_games(results: &[GameResult]) -> GameStats {
    let mut stats = GameStats {
        games: results.len(),
        ..Default::default()
    };
    let mut total_length = 0u64;
    for game in results {
        total_length += game.length_plies as u64;
        if game.termination == TerminationReason::StepLimit
            || game.termination == TerminationReason::Timeout
        {
            stats.step_limit += 1;
        }
        match (game.outcome, game.learner_color) {
            (GameOutcome::WhiteWins, Color::White) | (GameOutcome::BlackWins, Color::Black) => {
                stats.wins += 1;
            }
            (GameOutcome::WhiteWins, Color::Black) | (GameOutcome::BlackWins, Color::White) => {
                stats.losses += 1;
            }
            (GameOutcome::Draw | GameOutcome::StepLimit, _) => stats.draws += 1,
        }
    }
    if !results.is_empty() {
        stats.avg_length = total_length as f64 / results.len() as f64;
    }
    stats
}
