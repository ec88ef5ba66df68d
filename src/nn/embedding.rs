use crate::nn::{fetch, Context, Module};
use crate::ops;
use crate::tensor::{Tensor, TensorMap};

/// `Embedding(V, D)`: a lookup table, `weight[V,D]`.
pub struct Embedding {
    weight: Tensor,
    vocab_size: i64,
    dim: i64,
}

impl Embedding {
    pub fn new(vocab_size: i64, dim: i64) -> Self {
        Self {
            weight: Tensor::zeros_f32(&[vocab_size, dim]),
            vocab_size,
            dim,
        }
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, idx: &Tensor) -> Tensor {
        ops::lookup(&self.weight, idx)
    }
}

impl Module for Embedding {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        let weight = fetch(params, &ctx.name("weight"));
        assert_eq!(weight.dim(0), self.vocab_size, "Embedding: vocab_size mismatch");
        assert_eq!(weight.dim(1), self.dim, "Embedding: dim mismatch");
        self.weight = weight.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn forward_matches_spec_example() {
        let mut emb = Embedding::new(5, 2);
        let mut params = HashMap::new();
        params.insert(
            "weight".to_string(),
            Tensor::from_f32_vec(&[5, 2], vec![0.1, 0.2, 0.3, 0.4, 0.2, 0.3, 0.4, 0.5, 0.7, 0.8]),
        );
        emb.init_parameters(&Context::root(), &params);

        let idx = Tensor::from_i64_vec(&[2, 3], vec![0, 1, 2, 1, 3, 4]);
        let out = emb.forward(&idx);
        assert_eq!(out.dims(), vec![2, 3, 2]);
        assert_eq!(out.raw_f32(), &[0.1, 0.2, 0.3, 0.4, 0.2, 0.3, 0.3, 0.4, 0.4, 0.5, 0.7, 0.8]);
    }
}
