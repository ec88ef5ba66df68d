use crate::nn::{fetch, Context, Module};
use crate::ops;
use crate::tensor::{Tensor, TensorMap};

/// `LayerNorm(d, eps)`: normalizes over the innermost `d` elements, then
/// scales and shifts by learned `weight[d]`/`bias[d]`.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    d: i64,
    eps: f32,
}

impl LayerNorm {
    pub fn new(d: i64, eps: f32) -> Self {
        Self {
            weight: Tensor::from_f32_vec(&[d], vec![1.0; d as usize]),
            bias: Tensor::zeros_f32(&[d]),
            d,
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        assert_eq!(x.dim(-1), self.d, "LayerNorm: input's innermost dim must equal d");
        ops::layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

impl Module for LayerNorm {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        let weight = fetch(params, &ctx.name("weight"));
        assert_eq!(weight.dim(0), self.d, "LayerNorm: weight length mismatch");
        self.weight = weight.clone();

        let bias = fetch(params, &ctx.name("bias"));
        assert_eq!(bias.dim(0), self.d, "LayerNorm: bias length mismatch");
        self.bias = bias.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn forward_applies_learned_affine_after_normalizing() {
        let mut ln = LayerNorm::new(4, 1e-5);
        let mut params = HashMap::new();
        params.insert("weight".to_string(), Tensor::from_f32_vec(&[4], vec![2.0, 2.0, 2.0, 2.0]));
        params.insert("bias".to_string(), Tensor::from_f32_vec(&[4], vec![1.0, 1.0, 1.0, 1.0]));
        ln.init_parameters(&Context::root(), &params);

        let x = Tensor::from_f32_vec(&[1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let y = ln.forward(&x);
        let mean: f32 = y.raw_f32().iter().sum::<f32>() / 4.0;
        // affine shifts the zero-mean normalized output by +1 per element.
        assert!((mean - 1.0).abs() < 1e-3);
    }

    #[test]
    #[should_panic(expected = "innermost dim")]
    fn forward_panics_on_dim_mismatch() {
        let ln = LayerNorm::new(4, 1e-5);
        let x = Tensor::zeros_f32(&[1, 3]);
        ln.forward(&x);
    }
}
