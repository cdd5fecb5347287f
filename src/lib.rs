//! # Chess Self-Play DQN Training Core
//!
//! A reinforcement-learning training system that produces a chess agent
//! via self-play deep Q-learning.
//!
//! ## Features
//!
//! - **Chess Engine**: Compact legal-move rules engine behind the
//!   environment adapter
//! - **DQN Learner**: Masked Bellman targets, Double-DQN, target network,
//!   serializable Adam state
//! - **Self-Play Orchestration**: Process-isolated workers with a
//!   sequential in-process fallback
//! - **Experience Pipeline**: Bounded replay ring, prioritized mode,
//!   quality-based routing
//! - **Checkpointing**: Atomic persistence with a head-to-head best-model
//!   promotion protocol
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chess_dqn::{config::TrainingConfig, training::TrainingPipeline};
//!
//! let cfg = TrainingConfig::fast_debug();
//! let mut pipeline = TrainingPipeline::new(cfg).unwrap();
//! pipeline.run().unwrap();
//! ```

// ============================================================================
// PUBLIC API MODULES
// ============================================================================

/// ε-greedy policy over legal actions
pub mod agent;

/// Checkpoint persistence and the best-model protocol
pub mod checkpoint;

/// Chess rules engine (moves, terminals, FEN)
pub mod chess;

/// Run configuration and named profiles
pub mod config;

/// Environment adapter: states, masks, rewards
pub mod env;

/// Error taxonomy
pub mod error;

/// Q-network, DQN learner, model I/O
pub mod neural;

/// Experience storage and routing
pub mod replay;

/// Self-play orchestration, workers, wire codec
pub mod selfplay;

/// Training pipeline, evaluation, metrics
pub mod training;

/// Log setup for the control plane and workers
pub mod logging;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::TrainingConfig;
pub use error::{Result, TrainingError};
pub use training::TrainingPipeline;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static TORCH_SEED_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    /// Serializes tests that reseed the global torch RNG and compare the
    /// resulting parameters.
    pub fn torch_seed_lock() -> MutexGuard<'static, ()> {
        TORCH_SEED_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
