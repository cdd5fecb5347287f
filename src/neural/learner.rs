//! The DQN learner: masked Bellman targets, Huber loss, global-norm
//! gradient clipping, hard target sync, and a hand-stepped Adam whose
//! moments are named tensors (so optimizer state checkpoints alongside
//! the parameters).

use std::collections::BTreeMap;

use tch::{nn, Device, Kind, Tensor};

use super::model_io;
use super::qnet::QNetwork;
use crate::config::TrainingConfig;
use crate::env::{ActionMask, ACTION_SPACE, STATE_LEN};
use crate::error::{Result, TrainingError};
use crate::replay::TransitionBatch;

/// Finite stand-in for −∞ when masking logits; keeps `0 · masked` finite.
const MASK_NEG: f64 = -1e9;

/// Consecutive numerical failures tolerated before the cycle aborts.
const MAX_NUMERICAL_FAILURES: usize = 3;

/// Legacy fallback when a batch row carries no stored next-mask.
pub type NextActionProvider = Box<dyn Fn(&[f32]) -> ActionMask + Send>;

/// What one gradient step produced.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdateResult {
    pub loss: f64,
    pub grad_norm: f64,
    pub mean_entropy: f64,
    pub td_abs_mean: f64,
    /// Fresh |TD| per batch row, for prioritized replay.
    pub updated_priorities: Option<Vec<f32>>,
    /// False for empty batches and numerically skipped updates.
    pub applied: bool,
    /// True when this step triggered a hard target sync.
    pub synced_target: bool,
}

pub struct DqnLearner {
    vs_online: nn::VarStore,
    vs_target: nn::VarStore,
    online: QNetwork,
    target: QNetwork,
    optimizer: AdamState,
    gamma: f64,
    double_dqn: bool,
    clip_norm: f64,
    target_update_frequency: usize,
    train_steps: usize,
    consecutive_failures: usize,
    next_action_provider: Option<NextActionProvider>,
}

impl DqnLearner {
    /// Allocate online and target networks; `θ̂ ← θ` immediately. Network
    /// initialization derives from the run seed.
    pub fn new(cfg: &TrainingConfig, run_seed: u64) -> Result<Self> {
        tch::manual_seed(run_seed as i64);
        let vs_online = nn::VarStore::new(Device::Cpu);
        let online = QNetwork::new(&vs_online, &cfg.hidden_layers);
        let mut vs_target = nn::VarStore::new(Device::Cpu);
        let target = QNetwork::new(&vs_target, &cfg.hidden_layers);
        vs_target.copy(&vs_online)?;

        Ok(DqnLearner {
            optimizer: AdamState::new(cfg.learning_rate, &vs_online),
            vs_online,
            vs_target,
            online,
            target,
            gamma: cfg.gamma,
            double_dqn: cfg.double_dqn,
            clip_norm: cfg.gradient_clip_norm,
            target_update_frequency: cfg.target_update_frequency,
            train_steps: 0,
            consecutive_failures: 0,
            next_action_provider: None,
        })
    }

    /// Successful gradient steps so far.
    pub fn train_steps(&self) -> usize {
        self.train_steps
    }

    pub fn online_net(&self) -> &QNetwork {
        &self.online
    }

    /// Register the legacy mask provider. Preferred path is a stored
    /// per-transition mask; every use of the provider logs a warning.
    pub fn set_next_action_provider(&mut self, provider: NextActionProvider) {
        self.next_action_provider = Some(provider);
    }

    /// Atomic `θ̂ ← θ`. Runs strictly between gradient updates.
    pub fn sync_target(&mut self) -> Result<()> {
        self.vs_target.copy(&self.vs_online)?;
        Ok(())
    }

    /// One batched update. Empty batches are deterministic no-ops; a batch
    /// with a live transition and an empty next-mask is rejected before
    /// any parameter changes.
    pub fn train_batch(&mut self, mut batch: TransitionBatch) -> Result<PolicyUpdateResult> {
        if batch.is_empty() {
            return Ok(PolicyUpdateResult::default());
        }
        self.validate_batch(&mut batch)?;

        let b = batch.len() as i64;
        if batch.states.len() != (b as usize) * STATE_LEN {
            return Err(TrainingError::Encoding(format!(
                "batch states length {} does not match {}x{STATE_LEN}",
                batch.states.len(),
                b
            )));
        }

        let states = Tensor::from_slice(&batch.states).view([b, STATE_LEN as i64]);
        let actions = Tensor::from_slice(&batch.actions).view([b, 1]);
        let rewards = Tensor::from_slice(&batch.rewards);
        let next_states = Tensor::from_slice(&batch.next_states).view([b, STATE_LEN as i64]);
        let dones = Tensor::from_slice(&batch.dones);
        let weights = Tensor::from_slice(&batch.weights);
        let next_mask = mask_tensor(&batch.next_masks);

        // Bellman targets; the max ranges only over legal next actions.
        let targets = tch::no_grad(|| {
            let next_q = if self.double_dqn {
                let online_next = self.online.forward(&next_states);
                let masked = &online_next + (&next_mask - 1.0) * (-MASK_NEG);
                let best = masked.argmax(1, false).unsqueeze(1);
                self.target
                    .forward(&next_states)
                    .gather(1, &best, false)
                    .squeeze_dim(1)
            } else {
                let target_next = self.target.forward(&next_states);
                let masked = &target_next + (&next_mask - 1.0) * (-MASK_NEG);
                masked.max_dim(1, false).0
            };
            let live = &dones * (-1.0) + 1.0;
            &rewards + next_q * live * self.gamma
        });

        let q_sa = self
            .online
            .forward(&states)
            .gather(1, &actions, false)
            .squeeze_dim(1);
        let td = (&q_sa - &targets).detach();

        // Huber δ=1.0, importance-weighted.
        let elementwise =
            q_sa.smooth_l1_loss(&targets, tch::Reduction::None, 1.0) * &weights;
        let loss = elementwise.mean(Kind::Float);

        if !tensor_is_finite(&loss) {
            return self.numerical_failure("NaN/Inf in loss");
        }

        self.optimizer.zero_grad(&self.vs_online);
        loss.backward();

        let grad_norm = clip_global_norm(&self.vs_online, self.clip_norm);
        if !grad_norm.is_finite() {
            self.optimizer.zero_grad(&self.vs_online);
            return self.numerical_failure("NaN/Inf in gradients");
        }

        self.optimizer.step(&self.vs_online);
        self.optimizer.zero_grad(&self.vs_online);
        self.consecutive_failures = 0;
        self.train_steps += 1;

        let synced_target = self.train_steps % self.target_update_frequency == 0;
        if synced_target {
            self.sync_target()?;
            log::debug!("target network synced at step {}", self.train_steps);
        }

        let td_abs: Vec<f32> = Vec::<f32>::try_from(&td.abs())?;
        let td_abs_mean = td_abs.iter().map(|&t| t as f64).sum::<f64>() / td_abs.len() as f64;

        Ok(PolicyUpdateResult {
            loss: loss.double_value(&[]),
            grad_norm,
            mean_entropy: self.mean_entropy(&next_states, &next_mask, &dones),
            td_abs_mean,
            updated_priorities: Some(td_abs),
            applied: true,
            synced_target,
        })
    }

    /// Reject live rows with empty masks, or repair them through the
    /// legacy provider when one is registered.
    fn validate_batch(&self, batch: &mut TransitionBatch) -> Result<()> {
        for i in 0..batch.len() {
            if batch.dones[i] == 0.0 && batch.next_masks[i].is_empty() {
                let Some(provider) = &self.next_action_provider else {
                    return Err(TrainingError::InvalidBatch(format!(
                        "row {i} is non-terminal with an all-zero next mask"
                    )));
                };
                log::warn!(
                    "row {i} carried no next mask; falling back to the legacy next-action provider"
                );
                let mask = provider(&batch.next_states[i * STATE_LEN..(i + 1) * STATE_LEN]);
                if mask.is_empty() {
                    return Err(TrainingError::InvalidBatch(format!(
                        "legacy provider returned an empty mask for row {i}"
                    )));
                }
                batch.next_masks[i] = mask;
            }
        }
        Ok(())
    }

    fn numerical_failure(&mut self, what: &str) -> Result<PolicyUpdateResult> {
        self.consecutive_failures += 1;
        log::warn!(
            "numerical failure ({what}); skipping update ({}/{MAX_NUMERICAL_FAILURES})",
            self.consecutive_failures
        );
        if self.consecutive_failures >= MAX_NUMERICAL_FAILURES {
            return Err(TrainingError::Numerical(format!(
                "{MAX_NUMERICAL_FAILURES} consecutive failures, last: {what}"
            )));
        }
        Ok(PolicyUpdateResult::default())
    }

    /// Entropy of the masked softmax policy over successor states,
    /// averaged over live rows. The convergence detector reads this.
    fn mean_entropy(&self, next_states: &Tensor, next_mask: &Tensor, dones: &Tensor) -> f64 {
        tch::no_grad(|| {
            let live = dones * (-1.0) + 1.0;
            let live_count = live.sum(Kind::Float).double_value(&[]);
            if live_count < 1.0 {
                return 0.0;
            }
            let logits = self.online.forward(next_states) + (next_mask - 1.0) * (-MASK_NEG);
            let log_probs = logits.log_softmax(1, Kind::Float);
            let probs = log_probs.exp();
            let per_row = -(probs * log_probs * next_mask).sum_dim_intlist(
                [1i64].as_slice(),
                false,
                Kind::Float,
            );
            (per_row * live).sum(Kind::Float).double_value(&[]) / live_count
        })
    }

    /// Persist `θ` (snapshot and checkpoint path).
    pub fn save_params(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        model_io::save_varstore(&self.vs_online, path)
    }

    /// Restore `θ` and reset `θ̂ ← θ`. Fails without side effects on an
    /// architecture mismatch.
    pub fn load_params(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        model_io::load_varstore(&mut self.vs_online, path)?;
        self.sync_target()
    }

    /// Persist Adam moments and step counter.
    pub fn save_optimizer(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        model_io::save_named_tensors(&self.optimizer.entries(), path)
    }

    pub fn load_optimizer(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let entries = model_io::load_named_tensors(path)?;
        self.optimizer.restore(entries, &self.vs_online)
    }
}

/// Global-norm clipping over every trainable gradient. Returns the
/// pre-clip norm.
fn clip_global_norm(vs: &nn::VarStore, max_norm: f64) -> f64 {
    let mut total_sq = 0.0f64;
    let variables = vs.variables();
    tch::no_grad(|| {
        for var in variables.values() {
            let grad = var.grad();
            if grad.defined() {
                let norm = grad.norm().double_value(&[]);
                total_sq += norm * norm;
            }
        }
        let total = total_sq.sqrt();
        if total.is_finite() && total > max_norm {
            let scale = max_norm / (total + 1e-6);
            for var in variables.values() {
                let mut grad = var.grad();
                if grad.defined() {
                    let scaled = &grad * scale;
                    grad.copy_(&scaled);
                }
            }
        }
    });
    total_sq.sqrt()
}

fn tensor_is_finite(t: &Tensor) -> bool {
    t.isnan().any().double_value(&[]) == 0.0 && t.isinf().any().double_value(&[]) == 0.0
}

/// Dense `[B, A]` f32 view over a batch of masks.
fn mask_tensor(masks: &[ActionMask]) -> Tensor {
    let mut flat = Vec::with_capacity(masks.len() * ACTION_SPACE);
    for mask in masks {
        flat.extend_from_slice(&mask.to_f32());
    }
    Tensor::from_slice(&flat).view([masks.len() as i64, ACTION_SPACE as i64])
}

/// Adam with explicitly owned first/second moments, keyed by variable
/// name. Stepping by hand keeps the state serializable.
struct AdamState {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i64,
    m: BTreeMap<String, Tensor>,
    v: BTreeMap<String, Tensor>,
}

impl AdamState {
    fn new(lr: f64, vs: &nn::VarStore) -> Self {
        let mut m = BTreeMap::new();
        let mut v = BTreeMap::new();
        for (name, var) in vs.variables() {
            m.insert(name.clone(), Tensor::zeros_like(&var));
            v.insert(name, Tensor::zeros_like(&var));
        }
        AdamState {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            m,
            v,
        }
    }

    fn zero_grad(&self, vs: &nn::VarStore) {
        tch::no_grad(|| {
            for var in vs.variables().values() {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.zero_();
                }
            }
        });
    }

    fn step(&mut self, vs: &nn::VarStore) {
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step as i32);
        let bc2 = 1.0 - self.beta2.powi(self.step as i32);
        // Name order fixes the update sequence for reproducibility.
        let sorted: BTreeMap<String, Tensor> = vs.variables().into_iter().collect();
        tch::no_grad(|| {
            for (name, mut var) in sorted {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let m = self.m.get_mut(&name).expect("moment matches variable set");
                let v = self.v.get_mut(&name).expect("moment matches variable set");
                let new_m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
                m.copy_(&new_m);
                let new_v = &*v * self.beta2 + (&grad * &grad) * (1.0 - self.beta2);
                v.copy_(&new_v);
                let m_hat = &*m / bc1;
                let v_hat = &*v / bc2;
                let update = m_hat * self.lr / (v_hat.sqrt() + self.eps);
                let new_val = &var - update;
                var.copy_(&new_val);
            }
        });
    }

    /// Named tensors for checkpointing: `m.<var>`, `v.<var>`, `step`.
    fn entries(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(self.m.len() * 2 + 1);
        out.push(("step".to_string(), Tensor::from_slice(&[self.step])));
        for (name, t) in &self.m {
            out.push((format!("m.{name}"), t.shallow_clone()));
        }
        for (name, t) in &self.v {
            out.push((format!("v.{name}"), t.shallow_clone()));
        }
        out
    }

    fn restore(
        &mut self,
        entries: BTreeMap<String, Tensor>,
        vs: &nn::VarStore,
    ) -> Result<()> {
        let step = entries
            .get("step")
            .ok_or_else(|| TrainingError::Encoding("optimizer state missing 'step'".into()))?;
        let mut m = BTreeMap::new();
        let mut v = BTreeMap::new();
        for name in vs.variables().keys() {
            let m_t = entries.get(&format!("m.{name}")).ok_or_else(|| {
                TrainingError::Encoding(format!("optimizer state missing 'm.{name}'"))
            })?;
            let v_t = entries.get(&format!("v.{name}")).ok_or_else(|| {
                TrainingError::Encoding(format!("optimizer state missing 'v.{name}'"))
            })?;
            m.insert(name.clone(), m_t.shallow_clone());
            v.insert(name.clone(), v_t.shallow_clone());
        }
        self.step = step.flatten(0, -1).int64_value(&[0]);
        self.m = m;
        self.v = v;
        Ok(())
    }
}
