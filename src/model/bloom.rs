//! BLOOM block and model (§4.5.1): same block shape as GPT-2 but ALiBi
//! position bias instead of learned positional embeddings; reuses
//! `nn::layer_norm`/`nn::attention` directly, only swapping in the ALiBi
//! slopes at the attention step.

use crate::config::RtConfig;
use crate::nn::{alibi_slopes, Context, Embedding, LayerNorm, Linear, Module, MultiheadSelfAttention};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{Tensor, TensorMap};

pub struct BloomBlock {
    ln1: LayerNorm,
    attn: MultiheadSelfAttention,
    ln2: LayerNorm,
    fc: Linear,
    proj: Linear,
}

impl BloomBlock {
    pub fn new(n_embd: i64, n_head: i64, n_inner: i64) -> Self {
        Self {
            ln1: LayerNorm::new(n_embd, 1e-5),
            attn: MultiheadSelfAttention::new(n_head as usize, n_embd as usize),
            ln2: LayerNorm::new(n_embd, 1e-5),
            fc: Linear::new(n_embd, n_inner),
            proj: Linear::new(n_inner, n_embd),
        }
    }

    pub fn forward(
        &self,
        pm: &mut PMPack,
        ctx: &Context,
        past: Option<&mut TensorMap>,
        x: &Tensor,
        mask: &Tensor,
        slopes: &[f32],
    ) -> Tensor {
        let a = self.ln1.forward(x);
        let a = self.attn.forward(pm, &ctx.child("attn"), past, &a, Some(mask), Some(slopes));
        let x = ops::add(x, &a);

        let b = self.ln2.forward(&x);
        let b = self.fc.forward(pm, &b);
        let b = ops::gelu(&b);
        let b = self.proj.forward(pm, &b);
        ops::add(&x, &b)
    }
}

impl Module for BloomBlock {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.ln1.init_parameters(&ctx.child("ln1"), params);
        self.attn.init_parameters(&ctx.child("attn"), params);
        self.ln2.init_parameters(&ctx.child("ln2"), params);
        self.fc.init_parameters(&ctx.child("fc"), params);
        self.proj.init_parameters(&ctx.child("proj"), params);
    }
}

/// `wte[V,D]` only (no `wpe`: ALiBi carries position information through
/// the attention bias instead), `nLayer` blocks, final `LayerNorm`, logits
/// via `x @ wte^T`.
pub struct BloomModel {
    wte: Embedding,
    blocks: Vec<BloomBlock>,
    ln_f: LayerNorm,
    slopes: Vec<f32>,
    n_ctx: i64,
}

impl BloomModel {
    pub fn new(cfg: &RtConfig) -> Self {
        let blocks = (0..cfg.n_layer).map(|_| BloomBlock::new(cfg.n_embd, cfg.n_head, cfg.n_inner)).collect();
        Self {
            wte: Embedding::new(cfg.vocab_size, cfg.n_embd),
            blocks,
            ln_f: LayerNorm::new(cfg.n_embd, 1e-5),
            slopes: alibi_slopes(cfg.n_head as usize),
            n_ctx: cfg.n_ctx,
        }
    }

    pub fn forward(&self, pm: &mut PMPack, ctx: &Context, mut past: Option<&mut TensorMap>, ids: &Tensor) -> Tensor {
        let mut x = self.wte.forward(ids);
        let mask = ops::causal_mask(self.n_ctx as usize);
        for (i, block) in self.blocks.iter().enumerate() {
            let block_ctx = ctx.child("h").child(&i.to_string());
            let past_reborrow = past.as_mut().map(|p| &mut **p);
            x = block.forward(pm, &block_ctx, past_reborrow, &x, &mask, &self.slopes);
        }
        self.ln_f.forward(&x)
    }

    pub fn logits(&self, pm: &mut PMPack, x: &Tensor) -> Tensor {
        let wte_t = self.wte.weight().transpose(0, 1);
        ops::matmul(pm, x, &wte_t)
    }
}

impl Module for BloomModel {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.wte.init_parameters(&ctx.child("wte"), params);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.init_parameters(&ctx.child("h").child(&i.to_string()), params);
        }
        self.ln_f.init_parameters(&ctx.child("ln_f"), params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn test_config() -> RtConfig {
        RtConfig {
            params_file: PathBuf::new(),
            model_type: "bloom".to_string(),
            add_prefix_space: false,
            split_by_unicode: true,
            model_file: PathBuf::new(),
            n_embd: 4,
            n_ctx: 8,
            n_inner: 8,
            n_head: 2,
            n_layer: 2,
            vocab_size: 6,
            hidden_size: 4,
            n_kv_head: None,
            rotary_dim: None,
        }
    }

    fn deterministic(n: usize, seed: f32) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * 0.031 + seed).sin() * 0.1).collect()
    }

    fn init_model(model: &mut BloomModel, cfg: &RtConfig) {
        let d = cfg.n_embd;
        let mut params = HashMap::new();
        params.insert("wte.weight".to_string(), Tensor::from_f32_vec(&[cfg.vocab_size, d], deterministic((cfg.vocab_size * d) as usize, 0.0)));
        for i in 0..cfg.n_layer {
            let prefix = format!("h.{i}");
            for ln in ["ln1", "ln2"] {
                params.insert(format!("{prefix}.{ln}.weight"), Tensor::from_f32_vec(&[d], vec![1.0; d as usize]));
                params.insert(format!("{prefix}.{ln}.bias"), Tensor::zeros_f32(&[d]));
            }
            for (j, name) in ["attn.q_proj", "attn.k_proj", "attn.v_proj", "attn.out_proj"].iter().enumerate() {
                params.insert(format!("{prefix}.{name}.weight"), Tensor::from_f32_vec(&[d, d], deterministic((d * d) as usize, 2.0 + i as f32 + j as f32)));
                params.insert(format!("{prefix}.{name}.bias"), Tensor::zeros_f32(&[d]));
            }
            params.insert(format!("{prefix}.fc.weight"), Tensor::from_f32_vec(&[cfg.n_inner, d], deterministic((cfg.n_inner * d) as usize, 9.0 + i as f32)));
            params.insert(format!("{prefix}.fc.bias"), Tensor::zeros_f32(&[cfg.n_inner]));
            params.insert(format!("{prefix}.proj.weight"), Tensor::from_f32_vec(&[d, cfg.n_inner], deterministic((d * cfg.n_inner) as usize, 13.0 + i as f32)));
            params.insert(format!("{prefix}.proj.bias"), Tensor::zeros_f32(&[d]));
        }
        params.insert("ln_f.weight".to_string(), Tensor::from_f32_vec(&[d], vec![1.0; d as usize]));
        params.insert("ln_f.bias".to_string(), Tensor::zeros_f32(&[d]));
        model.init_parameters(&Context::root(), &params);
    }

    #[test]
    fn one_shot_matches_token_by_token_decode() {
        runtime::init();
        let mut pm = PMPack::new();
        let cfg = test_config();
        let mut model = BloomModel::new(&cfg);
        init_model(&mut model, &cfg);
        let ctx = Context::root();

        let ids = Tensor::from_i64_vec(&[1, 3], vec![0, 2, 4]);
        let mut past_one_shot: TensorMap = HashMap::new();
        let hidden_one_shot = model.forward(&mut pm, &ctx, Some(&mut past_one_shot), &ids);
        let logits_one_shot = model.logits(&mut pm, &hidden_one_shot);

        let mut past_decode: TensorMap = HashMap::new();
        let mut decoded_logits = Vec::new();
        let flat_ids = ids.contiguous();
        for t in 0..3 {
            let id_t = Tensor::from_i64_vec(&[1, 1], vec![flat_ids.raw_i64()[t]]);
            let h = model.forward(&mut pm, &ctx, Some(&mut past_decode), &id_t);
            decoded_logits.push(model.logits(&mut pm, &h));
        }

        let one_shot_data = logits_one_shot.raw_f32();
        let v = cfg.vocab_size as usize;
        for (t, logit) in decoded_logits.iter().enumerate() {
            let decode_data = logit.raw_f32();
            for k in 0..v {
                let a = one_shot_data[t * v + k];
                let b = decode_data[k];
                assert!((a - b).abs() < 1e-3, "mismatch at t={t} k={k}: {a} vs {b}");
            }
        }
    }
}
