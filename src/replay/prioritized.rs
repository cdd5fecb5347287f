//! Proportional prioritized replay.
//!
//! Each live slot carries a priority `p = |td|^α + ε`; sampling draws
//! proportionally to `p` and returns importance-sampling weights
//! `w_i = (1/(N·P(i)))^β / max_w`. `update_priorities` is the only path
//! that changes priorities after insertion.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ReplayBuffer, Transition, TransitionBatch, BUFFER_SALT};
use crate::error::Result;

const PRIORITY_EPS: f64 = 1e-3;

/// Priority given to fresh transitions so they are sampled at least once.
const NEW_PRIORITY: f64 = 1.0;

pub struct PrioritizedReplay {
    ring: ReplayBuffer,
    /// Raw priorities aligned with ring slots (already exponentiated).
    priorities: Vec<f64>,
    head: usize,
    alpha: f64,
    beta: f64,
    rng: StdRng,
}

impl PrioritizedReplay {
    pub fn new(capacity: usize, run_seed: u64, alpha: f64, beta: f64) -> Self {
        PrioritizedReplay {
            ring: ReplayBuffer::new(capacity, run_seed),
            priorities: vec![0.0; capacity],
            head: 0,
            alpha,
            beta,
            // A distinct stream from the ring's own RNG.
            rng: StdRng::seed_from_u64(run_seed ^ BUFFER_SALT.rotate_left(17)),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// α/β are schedulable in [0,1] over the course of a run.
    pub fn set_exponents(&mut self, alpha: f64, beta: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
        self.beta = beta.clamp(0.0, 1.0);
    }

    pub fn push(&mut self, t: &Transition) -> Result<()> {
        self.ring.push(t)?;
        self.priorities[self.head] = NEW_PRIORITY;
        self.head = (self.head + 1) % self.priorities.len();
        Ok(())
    }

    /// Proportional draw with replacement across slots, IS-weighted.
    pub fn sample(&mut self, batch_size: usize) -> TransitionBatch {
        let n = self.ring.len();
        if n < batch_size || batch_size == 0 {
            return TransitionBatch::empty();
        }

        let total: f64 = self.priorities[..n].iter().sum();
        if total <= 0.0 {
            return TransitionBatch::empty();
        }

        let mut indices = Vec::with_capacity(batch_size);
        let mut probs = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let mut target = self.rng.random::<f64>() * total;
            let mut chosen = n - 1;
            for (slot, &p) in self.priorities[..n].iter().enumerate() {
                if target < p {
                    chosen = slot;
                    break;
                }
                target -= p;
            }
            indices.push(chosen);
            probs.push(self.priorities[chosen] / total);
        }

        let mut weights: Vec<f32> = probs
            .iter()
            .map(|&p| ((1.0 / (n as f64 * p)).powf(self.beta)) as f32)
            .collect();
        let max_w = weights.iter().cloned().fold(f32::MIN, f32::max).max(1e-12);
        for w in &mut weights {
            *w /= max_w;
        }

        self.ring.gather(&indices, Some(&weights))
    }

    /// Fold fresh TD errors back into the sampled slots. Slots marked
    /// `usize::MAX` (auxiliary-tail rows) are skipped.
    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f32]) {
        for (&slot, &td) in indices.iter().zip(td_errors) {
            if slot == usize::MAX || slot >= self.ring.len() {
                continue;
            }
            self.priorities[slot] = (td.abs() as f64).powf(self.alpha) + PRIORITY_EPS;
        }
    }

    pub fn get(&self, slot: usize) -> Option<Transition> {
        self.ring.get(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::test_transition;

    fn filled(seed: u64) -> PrioritizedReplay {
        let mut buf = PrioritizedReplay::new(64, seed, 0.6, 0.4);
        for i in 0..32u16 {
            buf.push(&test_transition(i as u64, i, false)).unwrap();
        }
        buf
    }

    #[test]
    fn weights_are_normalized() {
        let mut buf = filled(9);
        let batch = buf.sample(16);
        assert_eq!(batch.len(), 16);
        let max = batch.weights.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
        assert!(batch.weights.iter().all(|&w| w > 0.0 && w <= 1.0));
    }

    #[test]
    fn high_priority_slots_dominate_sampling() {
        let mut buf = filled(9);
        // Blow up the priority of slot 3.
        buf.update_priorities(&[3], &[100.0]);
        let mut hits = 0;
        for _ in 0..20 {
            let batch = buf.sample(8);
            hits += batch.indices.iter().filter(|&&i| i == 3).count();
        }
        assert!(hits > 40, "slot 3 drawn only {hits} times");
    }

    #[test]
    fn deterministic_given_seed() {
        let mut a = filled(77);
        let mut b = filled(77);
        assert_eq!(a.sample(8).indices, b.sample(8).indices);
    }

    #[test]
    fn tail_sentinel_indices_are_ignored() {
        let mut buf = filled(9);
        buf.update_priorities(&[usize::MAX, 999, 0], &[1.0, 1.0, 2.0]);
        // Only slot 0 changed; no panic on the sentinels.
        let batch = buf.sample(4);
        assert_eq!(batch.len(), 4);
    }
}
