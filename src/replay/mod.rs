//! Bounded experience storage with deterministic sampling.
//!
//! The primary ring preallocates flat arrays for every transition column,
//! so the hot ingest path never heap-allocates. Sampling runs on an RNG
//! seeded at construction from the run seed, which makes replay order a
//! pure function of (seed, ingest order).

pub mod experience;
pub mod prioritized;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::env::encoding::MASK_WORD_COUNT;
use crate::env::{ActionMask, STATE_LEN};
use crate::error::{Result, TrainingError};

/// Salt folded into the run seed for the buffer's private RNG stream.
pub const BUFFER_SALT: u64 = 0x5e1f_9a7e_b0ff_e12d;

/// One experience tuple. `quality` is the experience manager's routing
/// signal and never feeds Bellman targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: u16,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub next_mask: ActionMask,
    pub done: bool,
    pub quality: f32,
    pub episode_id: u64,
    pub ply: u16,
}

impl Transition {
    /// Structural invariants; violations are programming errors.
    pub fn validate(&self) -> Result<()> {
        if self.state.len() != STATE_LEN || self.next_state.len() != STATE_LEN {
            return Err(TrainingError::Encoding(format!(
                "transition state lengths {}/{} (expected {STATE_LEN})",
                self.state.len(),
                self.next_state.len()
            )));
        }
        if !self.reward.is_finite() {
            return Err(TrainingError::Encoding(format!(
                "non-finite reward {} in episode {}",
                self.reward, self.episode_id
            )));
        }
        if !self.done && self.next_mask.is_empty() {
            return Err(TrainingError::Encoding(format!(
                "non-terminal transition with empty next mask (episode {}, ply {})",
                self.episode_id, self.ply
            )));
        }
        Ok(())
    }
}

/// A sampled minibatch in tensor-ready column form. `indices` point back
/// into the primary ring for priority updates; `usize::MAX` marks items
/// drawn from an auxiliary tail.
#[derive(Debug, Clone)]
pub struct TransitionBatch {
    pub states: Vec<f32>,
    pub actions: Vec<i64>,
    pub rewards: Vec<f32>,
    pub next_states: Vec<f32>,
    pub next_masks: Vec<ActionMask>,
    pub dones: Vec<f32>,
    pub indices: Vec<usize>,
    pub weights: Vec<f32>,
}

impl TransitionBatch {
    pub fn empty() -> Self {
        TransitionBatch {
            states: Vec::new(),
            actions: Vec::new(),
            rewards: Vec::new(),
            next_states: Vec::new(),
            next_masks: Vec::new(),
            dones: Vec::new(),
            indices: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        TransitionBatch {
            states: Vec::with_capacity(n * STATE_LEN),
            actions: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            next_states: Vec::with_capacity(n * STATE_LEN),
            next_masks: Vec::with_capacity(n),
            dones: Vec::with_capacity(n),
            indices: Vec::with_capacity(n),
            weights: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Dense batch straight from owned transitions (worker replays,
    /// synthetic test batches). Rows carry the tail sentinel index.
    pub fn from_transitions(transitions: &[Transition]) -> Self {
        let mut batch = TransitionBatch::with_capacity(transitions.len());
        for t in transitions {
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
        batch
    }

    pub fn push_row(
        &mut self,
        state: &[f32],
        action: u16,
        reward: f32,
        next_state: &[f32],
        next_mask: ActionMask,
        done: bool,
        index: usize,
        weight: f32,
    ) {
        self.states.extend_from_slice(state);
        self.actions.push(action as i64);
        self.rewards.push(reward);
        self.next_states.extend_from_slice(next_state);
        self.next_masks.push(next_mask);
        self.dones.push(if done { 1.0 } else { 0.0 });
        self.indices.push(index);
        self.weights.push(weight);
    }
}

/// FIFO ring of at most `capacity` transitions over preallocated columns.
pub struct ReplayBuffer {
    capacity: usize,
    len: usize,
    head: usize,
    states: Vec<f32>,
    next_states: Vec<f32>,
    masks: Vec<u64>,
    actions: Vec<u16>,
    rewards: Vec<f32>,
    dones: Vec<bool>,
    qualities: Vec<f32>,
    episode_ids: Vec<u64>,
    plies: Vec<u16>,
    rng: StdRng,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, run_seed: u64) -> Self {
        assert!(capacity > 0, "replay capacity must be positive");
        ReplayBuffer {
            capacity,
            len: 0,
            head: 0,
            states: vec![0.0; capacity * STATE_LEN],
            next_states: vec![0.0; capacity * STATE_LEN],
            masks: vec![0; capacity * MASK_WORD_COUNT],
            actions: vec![0; capacity],
            rewards: vec![0.0; capacity],
            dones: vec![false; capacity],
            qualities: vec![0.0; capacity],
            episode_ids: vec![0; capacity],
            plies: vec![0; capacity],
            rng: StdRng::seed_from_u64(run_seed ^ BUFFER_SALT),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// O(1) amortized insert; the oldest slot is overwritten when full.
    pub fn push(&mut self, t: &Transition) -> Result<()> {
        t.validate()?;
        let slot = self.head;
        self.states[slot * STATE_LEN..(slot + 1) * STATE_LEN].copy_from_slice(&t.state);
        self.next_states[slot * STATE_LEN..(slot + 1) * STATE_LEN].copy_from_slice(&t.next_state);
        self.masks[slot * MASK_WORD_COUNT..(slot + 1) * MASK_WORD_COUNT]
            .copy_from_slice(t.next_mask.words());
        self.actions[slot] = t.action;
        self.rewards[slot] = t.reward;
        self.dones[slot] = t.done;
        self.qualities[slot] = t.quality;
        self.episode_ids[slot] = t.episode_id;
        self.plies[slot] = t.ply;

        self.head = (self.head + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
        Ok(())
    }

    /// Uniform sample without replacement; empty batch below `batch_size`.
    pub fn sample(&mut self, batch_size: usize) -> TransitionBatch {
        if self.len < batch_size || batch_size == 0 {
            return TransitionBatch::empty();
        }
        let indices = self.draw_indices(batch_size);
        self.gather(&indices, None)
    }

    /// Partial Fisher-Yates over the live slots: deterministic for a fixed
    /// RNG state and buffer length.
    fn draw_indices(&mut self, batch_size: usize) -> Vec<usize> {
        let mut pool: Vec<usize> = (0..self.len).collect();
        for i in 0..batch_size {
            let j = self.rng.random_range(i..pool.len());
            pool.swap(i, j);
        }
        pool.truncate(batch_size);
        pool
    }

    /// Copy the selected slots into a dense batch. Sampled batches own
    /// their data, so later evictions cannot invalidate them.
    pub(crate) fn gather(&self, indices: &[usize], weights: Option<&[f32]>) -> TransitionBatch {
        let mut batch = TransitionBatch::with_capacity(indices.len());
        for (row, &slot) in indices.iter().enumerate() {
            debug_assert!(slot < self.len);
            let mut words = [0u64; MASK_WORD_COUNT];
            words.copy_from_slice(&self.masks[slot * MASK_WORD_COUNT..(slot + 1) * MASK_WORD_COUNT]);
            batch.push_row(
                &self.states[slot * STATE_LEN..(slot + 1) * STATE_LEN],
                self.actions[slot],
                self.rewards[slot],
                &self.next_states[slot * STATE_LEN..(slot + 1) * STATE_LEN],
                ActionMask::from_words(words),
                self.dones[slot],
                slot,
                weights.map_or(1.0, |w| w[row]),
            );
        }
        batch
    }

    /// Copy one slot back out as an owned transition (tests, tails).
    pub fn get(&self, slot: usize) -> Option<Transition> {
        if slot >= self.len {
            return None;
        }
        let mut words = [0u64; MASK_WORD_COUNT];
        words.copy_from_slice(&self.masks[slot * MASK_WORD_COUNT..(slot + 1) * MASK_WORD_COUNT]);
        Some(Transition {
            state: self.states[slot * STATE_LEN..(slot + 1) * STATE_LEN].to_vec(),
            action: self.actions[slot],
            reward: self.rewards[slot],
            next_state: self.next_states[slot * STATE_LEN..(slot + 1) * STATE_LEN].to_vec(),
            next_mask: ActionMask::from_words(words),
            done: self.dones[slot],
            quality: self.qualities[slot],
            episode_id: self.episode_ids[slot],
            ply: self.plies[slot],
        })
    }
}

#[cfg(test)]
pub(crate) fn test_transition(episode_id: u64, ply: u16, done: bool) -> Transition {
    use crate::chess::Board;
    use crate::env::encode_board;

    let board = Board::starting();
    let state = encode_board(&board);
    let mut mask = ActionMask::empty();
    if !done {
        mask.set(ply % 4096);
    }
    Transition {
        state: state.clone(),
        action: 796, // e2e4 in from*64+to
        reward: if done { 1.0 } else { 0.0 },
        next_state: state,
        next_mask: mask,
        done,
        quality: 0.5,
        episode_id,
        ply,
    }
}
