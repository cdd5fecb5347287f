//! Training configuration and named profiles.
//!
//! A single flat struct carries every tunable of the run. Profiles are named
//! bundles (`fast-debug`, `long-train`, `eval-only`); CLI flags override
//! profile values. Validation runs before any network or buffer is
//! allocated, so a bad config exits with code 2 and no side effects.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};

/// Replay sampling mode for the primary ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplayType {
    Uniform,
    Prioritized,
}

/// How training batches are drawn across the experience sub-buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SamplingStrategy {
    /// Primary ring only.
    Uniform,
    /// Last M transitions only.
    Recent,
    /// α·primary + (1−α)·recent.
    Mixed,
}

/// Full training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingConfig {
    // ========== Network ==========
    /// Hidden layer widths of the Q-network MLP.
    /// Default: [512, 256, 128]
    pub hidden_layers: Vec<i64>,

    /// Adam step size.
    /// Default: 5e-4
    pub learning_rate: f64,

    /// DQN minibatch size.
    /// Default: 64
    pub batch_size: usize,

    // ========== Exploration ==========
    /// ε for the learner during self-play.
    /// Default: 0.05
    pub exploration_rate: f64,

    /// ε for the frozen self-play opponent.
    /// Default: 0.1
    pub opponent_exploration_rate: f64,

    // ========== DQN update ==========
    /// Hard target sync cadence, in gradient steps.
    /// Default: 200
    pub target_update_frequency: usize,

    /// Select next action with the online net, evaluate with the target net.
    /// Default: true
    pub double_dqn: bool,

    /// Discount factor.
    /// Default: 0.99
    pub gamma: f64,

    /// Global-norm gradient clip.
    /// Default: 10.0
    pub gradient_clip_norm: f64,

    // ========== Replay ==========
    /// Primary ring capacity.
    /// Default: 50000
    pub max_experience_buffer: usize,

    /// UNIFORM or PRIORITIZED sampling in the primary ring.
    pub replay_type: ReplayType,

    /// Prioritization exponent α ∈ [0,1].
    /// Default: 0.6
    pub priority_alpha: f64,

    /// Importance-sampling exponent β ∈ [0,1].
    /// Default: 0.4
    pub priority_beta: f64,

    /// UNIFORM / RECENT / MIXED batch routing across sub-buffers.
    pub sampling_strategy: SamplingStrategy,

    /// Fraction of a MIXED batch drawn from the recent tail (1−α).
    /// Default: 0.25
    pub mixed_recent_fraction: f64,

    /// Recent tail capacity.
    /// Default: 2000
    pub recent_buffer_size: usize,

    /// High-quality tail capacity.
    /// Default: 5000
    pub high_quality_buffer_size: usize,

    // ========== Self-play ==========
    /// Self-play games per outer cycle.
    /// Default: 30
    pub games_per_cycle: usize,

    /// Worker parallelism; a warning is emitted above physical core count.
    /// Default: 4
    pub max_concurrent_games: usize,

    /// Truncation threshold in plies.
    /// Default: 120
    pub max_steps_per_game: usize,

    /// Per-game wall-clock budget for a worker.
    /// Default: 60
    pub game_timeout_secs: u64,

    /// Per-cycle wall-clock budget for the whole worker fleet.
    /// Default: 600
    pub cycle_timeout_secs: u64,

    // ========== Rewards ==========
    /// Terminal reward for the side that delivered mate.
    pub win_reward: f32,
    /// Terminal reward for the mated side.
    pub loss_reward: f32,
    /// Reward for every legitimate draw type.
    pub draw_reward: f32,
    /// One-shot penalty to the side to move at the step-limit cutoff.
    pub step_limit_penalty: f32,
    /// Optional per-step shaping term; 0.0 disables it. When enabled its
    /// episode sum must stay within |winReward|.
    pub step_reward: f32,

    // ========== Pipeline ==========
    /// Stop condition on the outer loop.
    /// Default: 100
    pub max_cycles: usize,

    /// Gradient-step cap per cycle.
    /// Default: 200
    pub max_batches_per_cycle: usize,

    /// Ingested transitions per gradient step.
    /// Default: 4.0
    pub train_ratio: f64,

    /// Run seed; random when absent, always logged.
    pub seed: Option<u64>,

    /// Cycles between regular checkpoints.
    /// Default: 5
    pub checkpoint_interval: usize,

    /// Root output directory for checkpoints and metrics.
    pub checkpoint_directory: String,

    /// Head-to-head games per promotion check.
    /// Default: 20
    pub evaluation_games: usize,

    /// Retention: keep the last K cycle checkpoints.
    /// Default: 3
    pub keep_last_checkpoints: usize,

    /// Retention: keep every Nth cycle checkpoint.
    /// Default: 10
    pub keep_every_nth_checkpoint: usize,

    // ========== Convergence ==========
    /// Rolling window (cycles) for the stall detector.
    /// Default: 10
    pub stall_window: usize,

    /// Convergence requires mean entropy above this floor.
    /// Default: 0.1
    pub entropy_floor: f64,

    // ========== Logging ==========
    /// Directory for rotated run logs.
    pub log_directory: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![512, 256, 128],
            learning_rate: 5e-4,
            batch_size: 64,
            exploration_rate: 0.05,
            opponent_exploration_rate: 0.1,
            target_update_frequency: 200,
            double_dqn: true,
            gamma: 0.99,
            gradient_clip_norm: 10.0,
            max_experience_buffer: 50_000,
            replay_type: ReplayType::Uniform,
            priority_alpha: 0.6,
            priority_beta: 0.4,
            sampling_strategy: SamplingStrategy::Mixed,
            mixed_recent_fraction: 0.25,
            recent_buffer_size: 2000,
            high_quality_buffer_size: 5000,
            games_per_cycle: 30,
            max_concurrent_games: 4,
            max_steps_per_game: 120,
            game_timeout_secs: 60,
            cycle_timeout_secs: 600,
            win_reward: 1.0,
            loss_reward: -1.0,
            draw_reward: 0.0,
            step_limit_penalty: -0.5,
            step_reward: 0.0,
            max_cycles: 100,
            max_batches_per_cycle: 200,
            train_ratio: 4.0,
            seed: None,
            checkpoint_interval: 5,
            checkpoint_directory: "checkpoints".to_string(),
            evaluation_games: 20,
            keep_last_checkpoints: 3,
            keep_every_nth_checkpoint: 10,
            stall_window: 10,
            entropy_floor: 0.1,
            log_directory: "logs".to_string(),
        }
    }
}

impl TrainingConfig {
    /// Load a named profile, or fail with a config error.
    pub fn profile(name: &str) -> Result<Self> {
        match name {
            "fast-debug" => Ok(Self::fast_debug()),
            "long-train" => Ok(Self::long_train()),
            "eval-only" => Ok(Self::eval_only()),
            other => Err(TrainingError::Config(format!("unknown profile '{other}'"))),
        }
    }

    /// Small everything: quick smoke runs and CI.
    pub fn fast_debug() -> Self {
        Self {
            hidden_layers: vec![64, 32],
            batch_size: 32,
            games_per_cycle: 10,
            max_concurrent_games: 2,
            max_steps_per_game: 40,
            max_cycles: 3,
            max_experience_buffer: 2000,
            recent_buffer_size: 500,
            high_quality_buffer_size: 500,
            target_update_frequency: 20,
            max_batches_per_cycle: 40,
            evaluation_games: 4,
            checkpoint_interval: 1,
            game_timeout_secs: 20,
            cycle_timeout_secs: 120,
            ..Self::default()
        }
    }

    /// Long unattended run with a larger buffer.
    pub fn long_train() -> Self {
        Self {
            max_cycles: 1000,
            max_experience_buffer: 200_000,
            games_per_cycle: 60,
            max_batches_per_cycle: 400,
            checkpoint_interval: 10,
            ..Self::default()
        }
    }

    /// No training: evaluation entry points only.
    pub fn eval_only() -> Self {
        Self {
            max_cycles: 0,
            games_per_cycle: 0,
            evaluation_games: 20,
            ..Self::default()
        }
    }

    /// Validate every invariant before any allocation.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_layers.is_empty() || self.hidden_layers.iter().any(|&w| w <= 0) {
            return Err(TrainingError::Config(format!(
                "hiddenLayers must be non-empty positive widths, got {:?}",
                self.hidden_layers
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainingError::Config(format!(
                "learningRate must be finite and positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Config("batchSize must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(TrainingError::Config(format!(
                "gamma must lie in [0,1], got {}",
                self.gamma
            )));
        }
        for (name, eps) in [
            ("explorationRate", self.exploration_rate),
            ("opponentExplorationRate", self.opponent_exploration_rate),
        ] {
            if !(0.0..=1.0).contains(&eps) {
                return Err(TrainingError::Config(format!(
                    "{name} must lie in [0,1], got {eps}"
                )));
            }
        }
        for (name, exp) in [
            ("priorityAlpha", self.priority_alpha),
            ("priorityBeta", self.priority_beta),
            ("mixedRecentFraction", self.mixed_recent_fraction),
        ] {
            if !(0.0..=1.0).contains(&exp) {
                return Err(TrainingError::Config(format!(
                    "{name} must lie in [0,1], got {exp}"
                )));
            }
        }
        if self.max_experience_buffer < self.batch_size {
            return Err(TrainingError::Config(format!(
                "maxExperienceBuffer ({}) smaller than batchSize ({})",
                self.max_experience_buffer, self.batch_size
            )));
        }
        if self.target_update_frequency == 0 {
            return Err(TrainingError::Config(
                "targetUpdateFrequency must be at least 1".into(),
            ));
        }
        if self.max_concurrent_games == 0 {
            return Err(TrainingError::Config(
                "maxConcurrentGames must be at least 1".into(),
            ));
        }
        if self.max_steps_per_game == 0 {
            return Err(TrainingError::Config(
                "maxStepsPerGame must be at least 1".into(),
            ));
        }
        if !self.gradient_clip_norm.is_finite() || self.gradient_clip_norm <= 0.0 {
            return Err(TrainingError::Config(format!(
                "gradientClipNorm must be finite and positive, got {}",
                self.gradient_clip_norm
            )));
        }
        for (name, r) in [
            ("winReward", self.win_reward),
            ("lossReward", self.loss_reward),
            ("drawReward", self.draw_reward),
            ("stepLimitPenalty", self.step_limit_penalty),
            ("stepReward", self.step_reward),
        ] {
            if !r.is_finite() {
                return Err(TrainingError::Config(format!("{name} must be finite")));
            }
        }
        // Shaping must not be able to outweigh the terminal signal.
        let shaping_sum = self.step_reward.abs() * self.max_steps_per_game as f32;
        if self.step_reward != 0.0 && shaping_sum > self.win_reward.abs() {
            return Err(TrainingError::Config(format!(
                "stepReward shaping sum over an episode ({shaping_sum}) exceeds |winReward| ({})",
                self.win_reward.abs()
            )));
        }
        if self.train_ratio <= 0.0 || !self.train_ratio.is_finite() {
            return Err(TrainingError::Config(format!(
                "trainRatio must be finite and positive, got {}",
                self.train_ratio
            )));
        }
        if self.keep_every_nth_checkpoint == 0 {
            return Err(TrainingError::Config(
                "keepEveryNthCheckpoint must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Stable fingerprint over the canonical JSON form; stored in checkpoint
    /// metadata so a resume can detect config drift.
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        fnv1a(canonical.as_bytes())
    }
}

/// FNV-1a, 64-bit. Stable across runs and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn profiles_are_valid() {
        for name in ["fast-debug", "long-train", "eval-only"] {
            let cfg = TrainingConfig::profile(name).unwrap();
            assert!(cfg.validate().is_ok(), "profile {name} failed validation");
        }
        assert!(TrainingConfig::profile("no-such-profile").is_err());
    }

    #[test]
    fn invalid_learning_rate_rejected() {
        let mut cfg = TrainingConfig::default();
        cfg.learning_rate = -1.0;
        assert!(cfg.validate().is_err());
        cfg.learning_rate = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shaping_bound_enforced() {
        let mut cfg = TrainingConfig::default();
        cfg.step_reward = 0.1; // 0.1 * 120 steps > |1.0|
        assert!(cfg.validate().is_err());
        cfg.step_reward = 0.005;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = TrainingConfig::default();
        let mut b = TrainingConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.gamma = 0.95;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let json = r#"{"learningRate":0.001,"batchSize":16,"replayType":"PRIORITIZED"}"#;
        let cfg: TrainingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.learning_rate, 0.001);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.replay_type, ReplayType::Prioritized);
    }
}
