//! GPT-2 block and model composition (§4.5 "GPT-2 block"/"GPT-2 model"):
//! plain learned positional embeddings, GELU MLP, weight-tied logits.

use crate::config::RtConfig;
use crate::nn::{fetch, Context, Embedding, LayerNorm, Linear, Module, MultiheadSelfAttention};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{Tensor, TensorMap};

/// `residual(LN -> attn)` then `residual(LN -> FC -> GELU -> proj)`.
pub struct Gpt2Block {
    ln1: LayerNorm,
    attn: MultiheadSelfAttention,
    ln2: LayerNorm,
    fc: Linear,
    proj: Linear,
}

impl Gpt2Block {
    pub fn new(n_embd: i64, n_head: i64, n_inner: i64) -> Self {
        Self {
            ln1: LayerNorm::new(n_embd, 1e-5),
            attn: MultiheadSelfAttention::new(n_head as usize, n_embd as usize),
            ln2: LayerNorm::new(n_embd, 1e-5),
            fc: Linear::new(n_embd, n_inner),
            proj: Linear::new(n_inner, n_embd),
        }
    }

    pub fn forward(&self, pm: &mut PMPack, ctx: &Context, past: Option<&mut TensorMap>, x: &Tensor, mask: &Tensor) -> Tensor {
        let a = self.ln1.forward(x);
        let a = self.attn.forward(pm, &ctx.child("attn"), past, &a, Some(mask), None);
        let x = ops::add(x, &a);

        let b = self.ln2.forward(&x);
        let b = self.fc.forward(pm, &b);
        let b = ops::gelu(&b);
        let b = self.proj.forward(pm, &b);
        ops::add(&x, &b)
    }
}

impl Module for Gpt2Block {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.ln1.init_parameters(&ctx.child("ln1"), params);
        self.attn.init_parameters(&ctx.child("attn"), params);
        self.ln2.init_parameters(&ctx.child("ln2"), params);
        self.fc.init_parameters(&ctx.child("fc"), params);
        self.proj.init_parameters(&ctx.child("proj"), params);
    }
}

/// `wte[V,D]` + `wpe[nCtx,D]`, `nLayer` blocks, final `LayerNorm`, logits
/// via `x @ wte^T` (weight-tied).
pub struct Gpt2Model {
    wte: Embedding,
    wpe: Tensor,
    blocks: Vec<Gpt2Block>,
    ln_f: LayerNorm,
    n_ctx: i64,
    n_embd: i64,
}

impl Gpt2Model {
    pub fn new(cfg: &RtConfig) -> Self {
        let blocks = (0..cfg.n_layer).map(|_| Gpt2Block::new(cfg.n_embd, cfg.n_head, cfg.n_inner)).collect();
        Self {
            wte: Embedding::new(cfg.vocab_size, cfg.n_embd),
            wpe: Tensor::zeros_f32(&[cfg.n_ctx, cfg.n_embd]),
            blocks,
            ln_f: LayerNorm::new(cfg.n_embd, 1e-5),
            n_ctx: cfg.n_ctx,
            n_embd: cfg.n_embd,
        }
    }

    /// Runs embedding + blocks + final LN. `past["seq_len"]` (an i64 scalar
    /// tensor) tracks the running position across decode calls, advancing
    /// `wpe`'s slice window each time; absent on the first call.
    pub fn forward(&self, pm: &mut PMPack, ctx: &Context, mut past: Option<&mut TensorMap>, ids: &Tensor) -> Tensor {
        let l = ids.dim(1);
        let mut x = self.wte.forward(ids);

        let start_idx = past.as_ref().and_then(|p| p.get("seq_len")).map(|t| t.contiguous().raw_i64()[0]).unwrap_or(0);
        assert!(start_idx + l <= self.n_ctx, "Gpt2Model: sequence length exceeds n_ctx");
        let wpe_slice = self.wpe.slice(0, start_idx, start_idx + l).contiguous();
        x = ops::add(&x, &wpe_slice);

        if let Some(p) = past.as_deref_mut() {
            p.insert("seq_len".to_string(), Tensor::from_i64_vec(&[1], vec![start_idx + l]));
        }

        let mask = ops::causal_mask(self.n_ctx as usize);
        for (i, block) in self.blocks.iter().enumerate() {
            let block_ctx = ctx.child("h").child(&i.to_string());
            let past_reborrow = past.as_mut().map(|p| &mut **p);
            x = block.forward(pm, &block_ctx, past_reborrow, &x, &mask);
        }

        self.ln_f.forward(&x)
    }

    /// `logits(x) = x @ wte^T` — weight-tied output projection.
    pub fn logits(&self, pm: &mut PMPack, x: &Tensor) -> Tensor {
        let wte_t = self.wte.weight().transpose(0, 1);
        ops::matmul(pm, x, &wte_t)
    }
}

impl Module for Gpt2Model {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.wte.init_parameters(&ctx.child("wte"), params);

        let wpe = fetch(params, &ctx.name("wpe.weight"));
        assert_eq!(wpe.dim(0), self.n_ctx, "Gpt2Model: wpe n_ctx mismatch");
        assert_eq!(wpe.dim(1), self.n_embd, "Gpt2Model: wpe n_embd mismatch");
        self.wpe = wpe.clone();

        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.init_parameters(&ctx.child("h").child(&i.to_string()), params);
        }
        self.ln_f.init_parameters(&ctx.child("ln_f"), params);
    }
}
