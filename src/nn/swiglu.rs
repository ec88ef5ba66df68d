//! Gated MLP with SiLU activation (ChatGLM-2's FC, §4.5.2), grounded on
//! `SwiGLU` in
//! `examples/imonoonoko-Bit-TTT-Engine/crates/rust_engine/src/layers/swiglu.rs`
//! (gate/up/down projections, `silu(gate) * up` then `down`).

use crate::nn::{Context, Module};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{Tensor, TensorMap};

use super::Linear;

pub struct SwiGlu {
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl SwiGlu {
    pub fn new(hidden_dim: i64, intermediate_dim: i64) -> Self {
        Self {
            gate: Linear::new(hidden_dim, intermediate_dim),
            up: Linear::new(hidden_dim, intermediate_dim),
            down: Linear::new(intermediate_dim, hidden_dim),
        }
    }

    pub fn forward(&self, pm: &mut PMPack, x: &Tensor) -> Tensor {
        let gated = ops::silu(&self.gate.forward(pm, x));
        let up = self.up.forward(pm, x);
        let hidden = ops::mul_tensors(&gated, &up);
        self.down.forward(pm, &hidden)
    }
}

impl Module for SwiGlu {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.gate.init_parameters(&ctx.child("gate_proj"), params);
        self.up.init_parameters(&ctx.child("up_proj"), params);
        self.down.init_parameters(&ctx.child("down_proj"), params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::collections::HashMap;

    #[test]
    fn forward_matches_manual_gate_up_down() {
        runtime::init();
        let mut pm = PMPack::new();
        let mut mlp = SwiGlu::new(2, 2);
        let mut params = HashMap::new();
        for name in ["gate_proj", "up_proj", "down_proj"] {
            params.insert(format!("{name}.weight"), Tensor::from_f32_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]));
            params.insert(format!("{name}.bias"), Tensor::zeros_f32(&[2]));
        }
        mlp.init_parameters(&Context::root(), &params);

        let x = Tensor::from_f32_vec(&[1, 2], vec![1.0, 2.0]);
        let y = mlp.forward(&mut pm, &x);
        // gate == up == x (identity weights), so hidden = silu(x) * x.
        let expected: Vec<f32> = x.raw_f32().iter().map(|&v| (v / (1.0 + (-v).exp())) * v).collect();
        for (got, want) in y.raw_f32().iter().zip(expected) {
            assert!((got - want).abs() < 1e-5);
        }
    }
}
