//! Error taxonomy for the training core.
//!
//! Every non-fatal failure travels as a [`TrainingError`]; the pipeline maps
//! each kind onto a cycle-level policy (skip the update, retry once, abort
//! the cycle, abort the run). Encoding violations are programming bugs and
//! abort the run.

use std::path::PathBuf;

/// Main error type for the chess DQN library
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    /// Invalid configuration; reported before any state is allocated.
    #[error("configuration error: {0}")]
    Config(String),

    /// A state/mask/shape invariant was violated. Always fatal.
    #[error("encoding invariant violated: {0}")]
    Encoding(String),

    /// An action outside the legal mask reached the environment.
    #[error("illegal action {action} in position {fen}")]
    IllegalAction { action: u16, fen: String },

    /// A training batch carried a non-terminal transition with an empty
    /// next-action mask.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A self-play worker crashed, timed out, or produced malformed output.
    #[error("worker {worker_id} failed: {reason}")]
    Worker { worker_id: usize, reason: String },

    /// NaN/Inf in loss or gradients; three in a row abort the cycle.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Checkpoint architecture does not match the live network.
    #[error("architecture mismatch loading {path}: {detail}")]
    ArchitectureMismatch { path: PathBuf, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Tch(#[from] tch::TchError),
}

impl TrainingError {
    /// Process exit code per the CLI contract: 2 config, 3 IO, 1 other.
    pub fn exit_code(&self) -> i32 {
        match self {
            TrainingError::Config(_) => 2,
            TrainingError::Io(_) => 3,
            _ => 1,
        }
    }

    /// Fatal errors terminate the run instead of aborting one cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrainingError::Encoding(_))
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TrainingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(TrainingError::Config("bad lr".into()).exit_code(), 2);
        assert_eq!(
            TrainingError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .exit_code(),
            3
        );
        assert_eq!(TrainingError::Numerical("nan".into()).exit_code(), 1);
    }

    #[test]
    fn only_encoding_is_fatal() {
        assert!(TrainingError::Encoding("state length".into()).is_fatal());
        assert!(!TrainingError::InvalidBatch("empty mask".into()).is_fatal());
    }
}
