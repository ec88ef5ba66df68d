//! ChatGLM-2 block and model (§4.5.2): multi-query attention
//! (`n_kv_head < n_head`) with half-head-dim RoPE, and a SwiGLU-gated FC in
//! place of GPT-2's single FC+GELU.

use crate::config::RtConfig;
use crate::nn::{Context, Embedding, LayerNorm, Module, MultiheadSelfAttention, SwiGlu};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{Tensor, TensorMap};

pub struct ChatGlm2Block {
    ln1: LayerNorm,
    attn: MultiheadSelfAttention,
    ln2: LayerNorm,
    mlp: SwiGlu,
}

impl ChatGlm2Block {
    pub fn new(n_embd: i64, n_head: i64, n_kv_head: i64, n_inner: i64, n_ctx: i64) -> Self {
        let d_k = n_embd / n_head;
        Self {
            ln1: LayerNorm::new(n_embd, 1e-5),
            attn: MultiheadSelfAttention::with_variant(n_head as usize, n_kv_head as usize, n_embd as usize, Some((d_k / 2) as usize), n_ctx as usize),
            ln2: LayerNorm::new(n_embd, 1e-5),
            mlp: SwiGlu::new(n_embd, n_inner),
        }
    }

    pub fn forward(&self, pm: &mut PMPack, ctx: &Context, past: Option<&mut TensorMap>, x: &Tensor, mask: &Tensor) -> Tensor {
        let a = self.ln1.forward(x);
        let a = self.attn.forward(pm, &ctx.child("attn"), past, &a, Some(mask), None);
        let x = ops::add(x, &a);

        let b = self.ln2.forward(&x);
        let b = self.mlp.forward(pm, &b);
        ops::add(&x, &b)
    }
}

impl Module for ChatGlm2Block {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.ln1.init_parameters(&ctx.child("ln1"), params);
        self.attn.init_parameters(&ctx.child("attn"), params);
        self.ln2.init_parameters(&ctx.child("ln2"), params);
        self.mlp.init_parameters(&ctx.child("mlp"), params);
    }
}

/// `wte[V,D]`, `nLayer` MQA+RoPE+SwiGLU blocks, final `LayerNorm`,
/// weight-tied logits. No learned positional embedding: RoPE carries
/// position information through the attention step.
pub struct ChatGlm2Model {
    wte: Embedding,
    blocks: Vec<ChatGlm2Block>,
    ln_f: LayerNorm,
    n_ctx: i64,
}

impl ChatGlm2Model {
    pub fn new(cfg: &RtConfig) -> Self {
        let n_kv_head = cfg.n_kv_head.unwrap_or(cfg.n_head);
        let blocks = (0..cfg.n_layer)
            .map(|_| ChatGlm2Block::new(cfg.n_embd, cfg.n_head, n_kv_head, cfg.n_inner, cfg.n_ctx))
            .collect();
        Self {
            wte: Embedding::new(cfg.vocab_size, cfg.n_embd),
            blocks,
            ln_f: LayerNorm::new(cfg.n_embd, 1e-5),
            n_ctx: cfg.n_ctx,
        }
    }

    pub fn forward(&self, pm: &mut PMPack, ctx: &Context, mut past: Option<&mut TensorMap>, ids: &Tensor) -> Tensor {
        let mut x = self.wte.forward(ids);
        let mask = ops::causal_mask(self.n_ctx as usize);
        for (i, block) in self.blocks.iter().enumerate() {
            let block_ctx = ctx.child("h").child(&i.to_string());
            let past_reborrow = past.as_mut().map(|p| &mut **p);
            x = block.forward(pm, &block_ctx, past_reborrow, &x, &mask);
        }
        self.ln_f.forward(&x)
    }

    pub fn logits(&self, pm: &mut PMPack, x: &Tensor) -> Tensor {
        let wte_t = self.wte.weight().transpose(0, 1);
        ops::matmul(pm, x, &wte_t)
    }
}

impl Module for ChatGlm2Model {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.wte.init_parameters(&ctx.child("wte"), params);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.init_parameters(&ctx.child("h").child(&i.to_string()), params);
        }
        self.ln_f.init_parameters(&ctx.child("ln_f"), params);
    }
}
