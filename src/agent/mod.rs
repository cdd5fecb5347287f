//! ε-greedy policy over the legal action set.
//!
//! The agent owns its network copy. The RNG is consumed only by the
//! ε-branch, and greedy ties break toward the lowest action index, so a
//! seeded agent replays identically.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::{nn, Device};

use crate::env::ActionMask;
use crate::error::{Result, TrainingError};
use crate::neural::model_io;
use crate::neural::QNetwork;

/// Greedy argmax restricted to the mask; `None` on an empty mask.
/// Ties break toward the lowest index.
pub fn greedy_action(q: &[f32], mask: &ActionMask) -> Option<u16> {
    let mut best: Option<(u16, f32)> = None;
    for action in mask.legal_actions() {
        let value = q[action as usize];
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((action, value)),
        }
    }
    best.map(|(action, _)| action)
}

/// A mutable agent: ε-greedy with its own RNG stream.
pub struct Agent {
    vs: nn::VarStore,
    net: QNetwork,
    epsilon: f64,
    rng: StdRng,
}

impl Agent {
    /// Fresh network under the current torch seed.
    pub fn new(hidden: &[i64], epsilon: f64, seed: u64) -> Self {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = QNetwork::new(&vs, hidden);
        Agent {
            vs,
            net,
            epsilon,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Agent initialized from saved parameters (worker entry point).
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        hidden: &[i64],
        epsilon: f64,
        seed: u64,
    ) -> Result<Self> {
        let mut agent = Agent::new(hidden, epsilon, seed);
        agent.load(path)?;
        Ok(agent)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) {
        self.epsilon = epsilon;
    }

    pub fn q_values(&self, state: &[f32]) -> Vec<f32> {
        self.net.q_values(state)
    }

    /// ε-greedy over the legal set. An empty mask here is a bug: the
    /// environment must already have reported the terminal.
    pub fn select_action(&mut self, state: &[f32], mask: &ActionMask) -> Result<u16> {
        select_with(
            &self.net,
            state,
            mask,
            self.epsilon,
            &mut self.rng,
        )
    }

    /// Freeze the current parameters with a fixed ε. The frozen copy is
    /// independent of this agent's further training.
    pub fn snapshot(&self, epsilon: f64) -> Result<FrozenAgent> {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let net = QNetwork::new(&vs, self.net.hidden_layers());
        vs.copy(&self.vs)?;
        Ok(FrozenAgent { vs, net, epsilon })
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        model_io::save_varstore(&self.vs, path)
    }

    pub fn load(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        model_io::load_varstore(&mut self.vs, path)
    }
}

/// A read-only parameter snapshot. Selection needs an external RNG for
/// its ε-branch, so `&self` stays shareable.
pub struct FrozenAgent {
    #[allow(dead_code)] // VarStore must stay alive to keep weights loaded
    vs: nn::VarStore,
    net: QNetwork,
    epsilon: f64,
}

impl FrozenAgent {
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        hidden: &[i64],
        epsilon: f64,
    ) -> Result<Self> {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let net = QNetwork::new(&vs, hidden);
        model_io::load_varstore(&mut vs, path)?;
        Ok(FrozenAgent { vs, net, epsilon })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn q_values(&self, state: &[f32]) -> Vec<f32> {
        self.net.q_values(state)
    }

    pub fn select_action(
        &self,
        state: &[f32],
        mask: &ActionMask,
        rng: &mut StdRng,
    ) -> Result<u16> {
        select_with(&self.net, state, mask, self.epsilon, rng)
    }
}

fn select_with(
    net: &QNetwork,
    state: &[f32],
    mask: &ActionMask,
    epsilon: f64,
    rng: &mut StdRng,
) -> Result<u16> {
    let legal = mask.legal_actions();
    if legal.is_empty() {
        return Err(TrainingError::Encoding(
            "action selection reached with an empty legal set".into(),
        ));
    }
    if epsilon > 0.0 && rng.random::<f64>() < epsilon {
        return Ok(legal[rng.random_range(0..legal.len())]);
    }
    let q = net.q_values(state);
    Ok(greedy_action(&q, mask).expect("legal set checked non-empty"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn mask_of(actions: &[u16]) -> ActionMask {
        let mut mask = ActionMask::empty();
        for &a in actions {
            mask.set(a);
        }
        mask
    }

    #[test]
    fn greedy_breaks_ties_toward_lowest_index() {
        let mut q = vec![0.0f32; 4096];
        q[10] = 1.0;
        q[20] = 1.0;
        q[30] = 0.5;
        let mask = mask_of(&[10, 20, 30]);
        assert_eq!(greedy_action(&q, &mask), Some(10));
    }

    #[test]
    fn greedy_ignores_illegal_maxima() {
        let mut q = vec![0.0f32; 4096];
        q[5] = 100.0; // illegal
        q[11] = 0.1;
        let mask = mask_of(&[11, 12]);
        assert_eq!(greedy_action(&q, &mask), Some(11));
    }

    #[test]
    fn empty_mask_is_a_bug() {
        tch::manual_seed(8);
        let mut agent = Agent::new(&[8], 0.0, 1);
        let state = vec![0.0f32; crate::env::STATE_LEN];
        let err = agent.select_action(&state, &ActionMask::empty()).unwrap_err();
        assert_matches!(err, TrainingError::Encoding(_));
    }

    #[test]
    fn zero_epsilon_is_deterministic_without_rng() {
        tch::manual_seed(8);
        let mut agent = Agent::new(&[8], 0.0, 1);
        let state = vec![0.1f32; crate::env::STATE_LEN];
        let mask = mask_of(&[100, 200, 300]);
        let first = agent.select_action(&state, &mask).unwrap();
        for _ in 0..5 {
            assert_eq!(agent.select_action(&state, &mask).unwrap(), first);
        }
    }

    #[test]
    fn exploration_stays_within_the_legal_set() {
        tch::manual_seed(8);
        let mut agent = Agent::new(&[8], 1.0, 42);
        let state = vec![0.0f32; crate::env::STATE_LEN];
        let legal = [7u16, 77, 777];
        let mask = mask_of(&legal);
        for _ in 0..50 {
            let action = agent.select_action(&state, &mask).unwrap();
            assert!(legal.contains(&action));
        }
    }

    #[test]
    fn snapshot_is_independent_of_later_updates() {
        tch::manual_seed(8);
        let agent = Agent::new(&[8], 0.1, 1);
        let frozen = agent.snapshot(0.0).unwrap();
        let state = vec![0.2f32; crate::env::STATE_LEN];
        assert_eq!(agent.q_values(&state), frozen.q_values(&state));
    }

    #[test]
    fn seeded_agents_replay_identically() {
        let _guard = crate::test_support::torch_seed_lock();
        let run = || {
            tch::manual_seed(9);
            let mut agent = Agent::new(&[8], 0.5, 123);
            let state = vec![0.3f32; crate::env::STATE_LEN];
            let mask = mask_of(&[1, 2, 3, 4, 5]);
            (0..20)
                .map(|_| agent.select_action(&state, &mask).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
