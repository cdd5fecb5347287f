//! Experience routing and buffer health.
//!
//! Scores each transition's usefulness, routes it into the primary ring
//! plus the high-quality and recent tails, and serves training batches
//! according to the configured sampling strategy. Quality is a routing
//! signal only; Bellman targets never see it.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::prioritized::PrioritizedReplay;
use super::{ReplayBuffer, Transition, TransitionBatch};
use crate::config::{ReplayType, SamplingStrategy, TrainingConfig};
use crate::error::Result;
use crate::selfplay::game::{GameOutcome, GameResult};

/// Salt for the manager's private RNG stream (tail sampling).
const EXPERIENCE_SALT: u64 = 0x00ab_5a1a_d335_c0de;

/// Plies counted as "opening" for the rarity term.
const OPENING_PLIES: u16 = 8;

/// Primary storage behind the manager, uniform or prioritized.
pub enum ReplayMemory {
    Uniform(ReplayBuffer),
    Prioritized(PrioritizedReplay),
}

impl ReplayMemory {
    pub fn len(&self) -> usize {
        match self {
            ReplayMemory::Uniform(b) => b.len(),
            ReplayMemory::Prioritized(b) => b.len(),
        }
    }

    pub fn push(&mut self, t: &Transition) -> Result<()> {
        match self {
            ReplayMemory::Uniform(b) => b.push(t),
            ReplayMemory::Prioritized(b) => b.push(t),
        }
    }

    pub fn sample(&mut self, batch_size: usize) -> TransitionBatch {
        match self {
            ReplayMemory::Uniform(b) => b.sample(batch_size),
            ReplayMemory::Prioritized(b) => b.sample(batch_size),
        }
    }

    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f32]) {
        if let ReplayMemory::Prioritized(b) = self {
            b.update_priorities(indices, td_errors);
        }
    }
}

pub struct ExperienceManager {
    primary: ReplayMemory,
    recent: VecDeque<Transition>,
    high_quality: Vec<Transition>,
    strategy: SamplingStrategy,
    mixed_recent_fraction: f64,
    recent_capacity: usize,
    high_quality_capacity: usize,
    /// Opening-action counts feeding the rarity term.
    opening_counts: HashMap<u16, u32>,
    opening_total: u64,
    rng: StdRng,
}

impl ExperienceManager {
    pub fn new(cfg: &TrainingConfig, run_seed: u64) -> Self {
        let primary = match cfg.replay_type {
            ReplayType::Uniform => {
                ReplayMemory::Uniform(ReplayBuffer::new(cfg.max_experience_buffer, run_seed))
            }
            ReplayType::Prioritized => ReplayMemory::Prioritized(PrioritizedReplay::new(
                cfg.max_experience_buffer,
                run_seed,
                cfg.priority_alpha,
                cfg.priority_beta,
            )),
        };
        ExperienceManager {
            primary,
            recent: VecDeque::with_capacity(cfg.recent_buffer_size),
            high_quality: Vec::with_capacity(cfg.high_quality_buffer_size),
            strategy: cfg.sampling_strategy,
            mixed_recent_fraction: cfg.mixed_recent_fraction,
            recent_capacity: cfg.recent_buffer_size,
            high_quality_capacity: cfg.high_quality_buffer_size,
            opening_counts: HashMap::new(),
            opening_total: 0,
            rng: StdRng::seed_from_u64(run_seed ^ EXPERIENCE_SALT),
        }
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn high_quality_len(&self) -> usize {
        self.high_quality.len()
    }

    /// Score and store every transition of a finished game. Returns the
    /// number ingested.
    pub fn ingest(&mut self, game: &GameResult) -> Result<usize> {
        let decisiveness = match game.outcome {
            GameOutcome::WhiteWins | GameOutcome::BlackWins => 1.0f32,
            GameOutcome::Draw => 0.5,
            GameOutcome::StepLimit => 0.2,
        };
        let length = game.length_plies.max(1) as f32;

        let mut ingested = 0usize;
        for t in &game.transitions {
            let mut scored = t.clone();
            scored.quality = self.quality_score(decisiveness, scored.ply, length, scored.action);
            self.track_opening(&scored);
            self.primary.push(&scored)?;
            self.push_recent(scored.clone());
            self.push_high_quality(scored);
            ingested += 1;
        }
        Ok(ingested)
    }

    /// Bounded score in [0,1]: decisive terminals beat draws beat
    /// step-limit truncations; late plies beat early ones (credit
    /// assignment); rare openings beat overrepresented ones.
    fn quality_score(&self, decisiveness: f32, ply: u16, length: f32, action: u16) -> f32 {
        let proximity = (ply as f32 + 1.0) / length;
        let rarity = if ply < OPENING_PLIES {
            let freq = *self.opening_counts.get(&action).unwrap_or(&0) as f32
                / self.opening_total.max(1) as f32;
            (1.0 - freq * OPENING_PLIES as f32).clamp(0.0, 1.0)
        } else {
            0.5
        };
        (0.5 * decisiveness + 0.3 * proximity.min(1.0) + 0.2 * rarity).clamp(0.0, 1.0)
    }

    fn track_opening(&mut self, t: &Transition) {
        if t.ply < OPENING_PLIES {
            *self.opening_counts.entry(t.action).or_insert(0) += 1;
            self.opening_total += 1;
        }
    }

    fn push_recent(&mut self, t: Transition) {
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(t);
    }

    /// The tail keeps the best-scored items seen so far; when full, the
    /// worst resident gives way only to a better candidate.
    fn push_high_quality(&mut self, t: Transition) {
        if self.high_quality.len() < self.high_quality_capacity {
            self.high_quality.push(t);
            return;
        }
        if let Some((worst_idx, worst)) = self
            .high_quality
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.quality.total_cmp(&b.1.quality))
        {
            if t.quality > worst.quality {
                self.high_quality[worst_idx] = t;
            }
        }
    }

    /// Draw a training batch per the configured strategy. An empty batch
    /// means "not enough experience yet".
    pub fn sample(&mut self, batch_size: usize) -> TransitionBatch {
        match self.strategy {
            SamplingStrategy::Uniform => self.primary.sample(batch_size),
            SamplingStrategy::Recent => self.sample_recent(batch_size),
            SamplingStrategy::Mixed => {
                let want_recent = ((batch_size as f64 * self.mixed_recent_fraction).round()
                    as usize)
                    .min(self.recent.len());
                let want_primary = batch_size - want_recent;
                if self.primary.len() < want_primary {
                    // Not enough history yet; fall back to the primary-only
                    // contract (empty below batch_size).
                    return self.primary.sample(batch_size);
                }
                let mut batch = self.primary.sample(want_primary);
                if batch.len() != want_primary {
                    return TransitionBatch::empty();
                }
                self.extend_from_recent(&mut batch, want_recent);
                batch
            }
        }
    }

    fn sample_recent(&mut self, batch_size: usize) -> TransitionBatch {
        if self.recent.len() < batch_size || batch_size == 0 {
            return TransitionBatch::empty();
        }
        let mut batch = TransitionBatch::with_capacity(batch_size);
        self.extend_from_recent(&mut batch, batch_size);
        batch
    }

    fn extend_from_recent(&mut self, batch: &mut TransitionBatch, count: usize) {
        for _ in 0..count {
            let idx = self.rng.random_range(0..self.recent.len());
            let t = &self.recent[idx];
            // Tail rows carry the sentinel index: priority updates skip them.
            batch.push_row(
                &t.state,
                t.action,
                t.reward,
                &t.next_state,
                t.next_mask,
                t.done,
                usize::MAX,
                1.0,
            );
        }
    }

    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f32]) {
        self.primary.update_priorities(indices, td_errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Color;
    use crate::replay::test_transition;
    use crate::selfplay::game::TerminationReason;

    fn game(episode_id: u64, outcome: GameOutcome, plies: u16) -> GameResult {
        let transitions = (0..plies)
            .map(|p| {
                let mut t = test_transition(episode_id, p, p + 1 == plies);
                t.episode_id = episode_id;
                t
            })
            .collect();
        GameResult {
            episode_id,
            transitions,
            outcome,
            termination: TerminationReason::StepLimit,
            length_plies: plies,
            learner_color: Color::White,
        }
    }

    fn manager(strategy: SamplingStrategy) -> ExperienceManager {
        let mut cfg = TrainingConfig::fast_debug();
        cfg.sampling_strategy = strategy;
        ExperienceManager::new(&cfg, 11)
    }

    #[test]
    fn ingest_scores_and_stores() {
        let mut mgr = manager(SamplingStrategy::Uniform);
        let n = mgr.ingest(&game(1, GameOutcome::WhiteWins, 10)).unwrap();
        assert_eq!(n, 10);
        assert_eq!(mgr.len(), 10);
        assert_eq!(mgr.recent_len(), 10);
    }

    #[test]
    fn decisive_games_score_higher_than_step_limit() {
        let mut mgr = manager(SamplingStrategy::Uniform);
        mgr.ingest(&game(1, GameOutcome::WhiteWins, 4)).unwrap();
        mgr.ingest(&game(2, GameOutcome::StepLimit, 4)).unwrap();
        let decisive = mgr.high_quality.iter().find(|t| t.episode_id == 1).unwrap();
        let truncated = mgr.high_quality.iter().find(|t| t.episode_id == 2).unwrap();
        assert!(decisive.quality > truncated.quality);
    }

    #[test]
    fn terminal_proximity_raises_quality() {
        let mut mgr = manager(SamplingStrategy::Uniform);
        mgr.ingest(&game(1, GameOutcome::WhiteWins, 20)).unwrap();
        // Same episode: a late ply outranks an early ply beyond the
        // opening-rarity region.
        let q_mid = mgr
            .high_quality
            .iter()
            .find(|t| t.ply == 10)
            .unwrap()
            .quality;
        let q_late = mgr
            .high_quality
            .iter()
            .find(|t| t.ply == 19)
            .unwrap()
            .quality;
        assert!(q_late > q_mid);
    }

    #[test]
    fn mixed_sampling_blends_primary_and_recent() {
        let mut mgr = manager(SamplingStrategy::Mixed);
        for e in 0..10 {
            mgr.ingest(&game(e, GameOutcome::Draw, 20)).unwrap();
        }
        let batch = mgr.sample(32);
        assert_eq!(batch.len(), 32);
        let tail_rows = batch.indices.iter().filter(|&&i| i == usize::MAX).count();
        assert_eq!(tail_rows, 8); // 32 * 0.25
    }

    #[test]
    fn empty_until_batch_size_reached() {
        let mut mgr = manager(SamplingStrategy::Mixed);
        mgr.ingest(&game(1, GameOutcome::Draw, 10)).unwrap();
        assert!(mgr.sample(32).is_empty());
    }
}
