//! Q-value network.
//!
//! A plain MLP over the flat state encoding: `STATE_LEN → hiddenLayers →
//! ACTION_SPACE` with ReLU activations and a linear head. One Q-value per
//! action index; masking happens in the consumers, never here.

use tch::{nn, Tensor};

use crate::env::{ACTION_SPACE, STATE_LEN};

pub struct QNetwork {
    layers: Vec<nn::Linear>,
    head: nn::Linear,
    hidden: Vec<i64>,
}

impl QNetwork {
    /// Build the network under `vs`. Initialization is deterministic once
    /// the owner has called `tch::manual_seed`.
    pub fn new(vs: &nn::VarStore, hidden: &[i64]) -> Self {
        let p = vs.root();
        let mut layers = Vec::with_capacity(hidden.len());
        let mut in_dim = STATE_LEN as i64;
        for (i, &width) in hidden.iter().enumerate() {
            layers.push(nn::linear(
                &p / format!("l{}", i + 1),
                in_dim,
                width,
                Default::default(),
            ));
            in_dim = width;
        }
        let head = nn::linear(&p / "q_head", in_dim, ACTION_SPACE as i64, Default::default());
        QNetwork {
            layers,
            head,
            hidden: hidden.to_vec(),
        }
    }

    /// `[B, STATE_LEN] → [B, ACTION_SPACE]`.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mut h = x.shallow_clone();
        for layer in &self.layers {
            h = h.apply(layer).relu();
        }
        h.apply(&self.head)
    }

    /// Q-values for a single state.
    pub fn q_values(&self, state: &[f32]) -> Vec<f32> {
        let input = Tensor::from_slice(state).view([1, STATE_LEN as i64]);
        let out = tch::no_grad(|| self.forward(&input));
        Vec::<f32>::try_from(&out.view([ACTION_SPACE as i64])).expect("q head is f32")
    }

    pub fn hidden_layers(&self) -> &[i64] {
        &self.hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn forward_shape() {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let net = QNetwork::new(&vs, &[32, 16]);
        let x = Tensor::zeros([5, STATE_LEN as i64], tch::kind::FLOAT_CPU);
        let y = net.forward(&x);
        assert_eq!(y.size(), vec![5, ACTION_SPACE as i64]);
    }

    #[test]
    fn init_is_deterministic_under_manual_seed() {
        let _guard = crate::test_support::torch_seed_lock();
        let build = || {
            tch::manual_seed(17);
            let vs = nn::VarStore::new(Device::Cpu);
            let net = QNetwork::new(&vs, &[16]);
            net.q_values(&vec![0.25; STATE_LEN])
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn q_values_cover_the_action_space() {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let net = QNetwork::new(&vs, &[8]);
        assert_eq!(net.q_values(&vec![0.0; STATE_LEN]).len(), ACTION_SPACE);
    }
}
