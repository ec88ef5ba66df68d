//! Multi-head self-attention with a KV-cache state machine (Fresh /
//! Prefill / Decode), optional rotary position embedding (ChatGLM-2, half
//! of the head dim) and optional ALiBi position bias (BLOOM) in place of
//! learned positional embeddings.
//!
//! The past K/V cache is stored per-head, post-rotation —
//! `[N, n_kv_head, L, d_k]` — matching the shape
//! `examples/imonoonoko-Bit-TTT-Engine/crates/rust_engine/src/layers/kv_cache.rs`'s
//! `QuantizedKVCache` uses for its own cache tensors, rather than the
//! flat pre-reshape `[N, L, dModel]` the distilled spec's step ordering
//! suggests — equivalent since reshape never touches the length axis, and
//! RoPE must see the true past length before rotating new positions
//! regardless of which ordering is used (noted in DESIGN.md).

use crate::nn::{Context, Module};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{Tensor, TensorMap};

use super::Linear;

/// Rotary position embedding, applied to the leading `rotary_dim`
/// components of each head's dimension (all of it for plain RoPE, half for
/// ChatGLM-2). Grounded on `RotaryEmbedding` in
/// `examples/imonoonoko-Bit-TTT-Engine/crates/rust_engine/src/layers/attention.rs`,
/// translated from cached `candle` tensors to a flat `Vec<f32>` cos/sin
/// table since this runtime has no broadcast-multiply operator.
pub struct RotaryEmbedding {
    cos_cache: Vec<f32>,
    sin_cache: Vec<f32>,
    half_dim: usize,
    rotary_dim: usize,
}

impl RotaryEmbedding {
    pub fn new(rotary_dim: usize, max_seq_len: usize, theta: f64) -> Self {
        let half_dim = rotary_dim / 2;
        let inv_freq: Vec<f64> = (0..half_dim).map(|i| 1.0 / theta.powf((2 * i) as f64 / rotary_dim as f64)).collect();
        let mut cos_cache = vec![0.0f32; max_seq_len * half_dim];
        let mut sin_cache = vec![0.0f32; max_seq_len * half_dim];
        for p in 0..max_seq_len {
            for (i, &f) in inv_freq.iter().enumerate() {
                let angle = p as f64 * f;
                cos_cache[p * half_dim + i] = angle.cos() as f32;
                sin_cache[p * half_dim + i] = angle.sin() as f32;
            }
        }
        Self { cos_cache, sin_cache, half_dim, rotary_dim }
    }

    /// Rotate the first `rotary_dim` components of `x`'s head dim (`[N,H,L,dK]`,
    /// contiguous), leaving any trailing `dK - rotary_dim` components
    /// untouched. `pos_offset` is the absolute position of `x`'s first row
    /// (the cached-past length during decode).
    pub fn apply(&self, x: &Tensor, pos_offset: usize) -> Tensor {
        let dims = x.dims();
        assert_eq!(dims.len(), 4, "RotaryEmbedding::apply expects a rank-4 [N,H,L,dK] tensor");
        let (n, h, l, dk) = (dims[0] as usize, dims[1] as usize, dims[2] as usize, dims[3] as usize);
        assert!(self.rotary_dim <= dk, "rotary_dim must be <= head_dim");
        let half = self.half_dim;
        let data = x.raw_f32();
        let mut out = data.to_vec();
        for ni in 0..n {
            for hi in 0..h {
                for li in 0..l {
                    let pos = pos_offset + li;
                    let base = ((ni * h + hi) * l + li) * dk;
                    for i in 0..half {
                        let cos = self.cos_cache[pos * half + i];
                        let sin = self.sin_cache[pos * half + i];
                        let x1 = data[base + i];
                        let x2 = data[base + half + i];
                        out[base + i] = x1 * cos - x2 * sin;
                        out[base + half + i] = x1 * sin + x2 * cos;
                    }
                }
            }
        }
        Tensor::from_f32_vec(&dims, out)
    }
}

/// ALiBi slopes (BLOOM, §4.5.1): `2^(-8*(h+1)/n)` for a power-of-two head
/// count; for other counts, the standard interleaved extension from the
/// nearest smaller power of two.
pub fn alibi_slopes(n_head: usize) -> Vec<f32> {
    fn power_of_two_slopes(n: usize) -> Vec<f32> {
        (0..n).map(|h| 2f32.powf(-8.0 * (h as f32 + 1.0) / n as f32)).collect()
    }
    if n_head.is_power_of_two() {
        return power_of_two_slopes(n_head);
    }
    let closest = n_head.next_power_of_two() / 2;
    let mut slopes = power_of_two_slopes(closest);
    let extra = power_of_two_slopes(2 * closest);
    slopes.extend(extra.iter().step_by(2).take(n_head - closest));
    slopes
}

fn add_alibi_bias(scores: &Tensor, slopes: &[f32], past_len: usize, l: usize, l_kv: usize) -> Tensor {
    let h = scores.dim(1) as usize;
    assert_eq!(slopes.len(), h, "alibi slopes length must equal n_head");
    let mut bias = vec![0.0f32; h * l * l_kv];
    for head in 0..h {
        let slope = slopes[head];
        for i in 0..l {
            let q_pos = (past_len + i) as f32;
            for j in 0..l_kv {
                bias[(head * l + i) * l_kv + j] = slope * (j as f32 - q_pos);
            }
        }
    }
    let bias_t = Tensor::from_f32_vec(&[h as i64, l as i64, l_kv as i64], bias);
    ops::add(scores, &bias_t)
}

/// Grouped/multi-query repeat: `[N, n_kv_head, L, dK] -> [N, n_kv_head *
/// n_rep, L, dK]`, each KV head duplicated `n_rep` times contiguously.
/// Grounded on `BitAttention::repeat_kv` in
/// `examples/imonoonoko-Bit-TTT-Engine/crates/rust_engine/src/layers/attention.rs`,
/// expressed as a direct copy since this runtime has no broadcast-expand view.
fn repeat_kv(x: &Tensor, n_rep: usize) -> Tensor {
    if n_rep == 1 {
        return x.clone();
    }
    let dims = x.dims();
    let (n, kv, l, dk) = (dims[0] as usize, dims[1] as usize, dims[2] as usize, dims[3] as usize);
    let data = x.raw_f32();
    let mut out = vec![0.0f32; n * kv * n_rep * l * dk];
    for ni in 0..n {
        for kvh in 0..kv {
            let src = &data[(ni * kv + kvh) * l * dk..(ni * kv + kvh + 1) * l * dk];
            for r in 0..n_rep {
                let dst_head = kvh * n_rep + r;
                let dst_start = (ni * (kv * n_rep) + dst_head) * l * dk;
                out[dst_start..dst_start + l * dk].copy_from_slice(src);
            }
        }
    }
    Tensor::from_f32_vec(&[n as i64, (kv * n_rep) as i64, l as i64, dk as i64], out)
}

/// `MultiheadSelfAttention(h, dModel)`. `n_kv_head` defaults to `h` (plain
/// MHA, GPT-2/BLOOM); set lower for GQA/MQA (ChatGLM-2). `rotary` is `None`
/// for GPT-2/BLOOM (learned/ALiBi positions) and `Some` for ChatGLM-2.
pub struct MultiheadSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_head: usize,
    n_kv_head: usize,
    d_model: usize,
    d_k: usize,
    rotary: Option<RotaryEmbedding>,
}

impl MultiheadSelfAttention {
    pub fn new(n_head: usize, d_model: usize) -> Self {
        Self::with_variant(n_head, n_head, d_model, None, 1)
    }

    /// `rotary_dim = Some(d_k/2)` selects the ChatGLM-2 half-dim RoPE
    /// variant; `max_seq_len` bounds the precomputed cos/sin table.
    pub fn with_variant(
        n_head: usize,
        n_kv_head: usize,
        d_model: usize,
        rotary_dim: Option<usize>,
        max_seq_len: usize,
    ) -> Self {
        assert_eq!(d_model % n_head, 0, "MultiheadSelfAttention: d_model must divide evenly by n_head");
        assert_eq!(n_head % n_kv_head, 0, "MultiheadSelfAttention: n_head must be a multiple of n_kv_head");
        let d_k = d_model / n_head;
        let kv_dim = n_kv_head * d_k;
        let rotary = rotary_dim.map(|rd| RotaryEmbedding::new(rd, max_seq_len.max(1), 10000.0));
        Self {
            q_proj: Linear::new(d_model as i64, d_model as i64),
            k_proj: Linear::new(d_model as i64, kv_dim as i64),
            v_proj: Linear::new(d_model as i64, kv_dim as i64),
            out_proj: Linear::new(d_model as i64, d_model as i64),
            n_head,
            n_kv_head,
            d_model,
            d_k,
            rotary,
        }
    }

    /// `x: [N,L,dModel]`. `past`, when given, is looked up/updated under
    /// this module's namespace (`ctx.name("past_k")`/`"past_v"`) — Fresh
    /// (`past` absent), Prefill (`past` present but empty), and Decode
    /// (`past` already populated) are all the same code path here, since
    /// the cache lookup naturally yields `past_len == 0` for the first two.
    /// `mask`, if given, is `[nCtx,nCtx]`; the `[L, L_kv]` subregion
    /// covering the current query/key range is sliced out and added.
    /// `alibi_slopes`, if given (BLOOM), replaces the learned-position
    /// contribution with `slope[h] * (key_pos - query_pos)`.
    pub fn forward(
        &self,
        pm: &mut PMPack,
        ctx: &Context,
        past: Option<&mut TensorMap>,
        x: &Tensor,
        mask: Option<&Tensor>,
        alibi_slopes: Option<&[f32]>,
    ) -> Tensor {
        let n = x.dim(0);
        let l = x.dim(1) as usize;

        let q = self.q_proj.forward(pm, x);
        let k_new = self.k_proj.forward(pm, x);
        let v_new = self.v_proj.forward(pm, x);

        let q = q
            .view(&[n, l as i64, self.n_head as i64, self.d_k as i64])
            .transpose(1, 2)
            .contiguous();
        let mut k_new = k_new
            .view(&[n, l as i64, self.n_kv_head as i64, self.d_k as i64])
            .transpose(1, 2)
            .contiguous();
        let v_new = v_new
            .view(&[n, l as i64, self.n_kv_head as i64, self.d_k as i64])
            .transpose(1, 2)
            .contiguous();

        let k_name = ctx.name("past_k");
        let v_name = ctx.name("past_v");
        let past_len = past.as_ref().and_then(|p| p.get(&k_name)).map(|t| t.dim(2) as usize).unwrap_or(0);

        let q = match &self.rotary {
            Some(rope) => rope.apply(&q, past_len),
            None => q,
        };
        if let Some(rope) = &self.rotary {
            k_new = rope.apply(&k_new, past_len);
        }

        let (k_full, v_full) = match past {
            Some(past_map) => {
                let (k_full, v_full) = match (past_map.get(&k_name), past_map.get(&v_name)) {
                    (Some(pk), Some(pv)) => (ops::cat(pk, &k_new, 2), ops::cat(pv, &v_new, 2)),
                    _ => (k_new, v_new),
                };
                past_map.insert(k_name, k_full.clone());
                past_map.insert(v_name, v_full.clone());
                (k_full, v_full)
            }
            None => (k_new, v_new),
        };

        let n_rep = self.n_head / self.n_kv_head;
        let k_full = repeat_kv(&k_full, n_rep);
        let v_full = repeat_kv(&v_full, n_rep);
        let l_kv = k_full.dim(2) as usize;

        let scale = 1.0 / (self.d_k as f32).sqrt();
        let kt = k_full.transpose(2, 3);
        let mut scores = ops::matmul(pm, &q, &kt);
        scores = ops::mul(&scores, scale);

        if let Some(slopes) = alibi_slopes {
            scores = add_alibi_bias(&scores, slopes, past_len, l, l_kv);
        }

        if let Some(m) = mask {
            let m_slice = m.slice(0, past_len as i64, (past_len + l) as i64).slice(1, 0, l_kv as i64);
            scores = ops::add(&scores, &m_slice);
        }

        let probs = ops::softmax(&scores);
        let ctx_vec = ops::matmul(pm, &probs, &v_full);

        let merged = ctx_vec.transpose(1, 2).contiguous().view(&[n, l as i64, self.d_model as i64]);
        self.out_proj.forward(pm, &merged)
    }
}

impl Module for MultiheadSelfAttention {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        self.q_proj.init_parameters(&ctx.child("q_proj"), params);
        self.k_proj.init_parameters(&ctx.child("k_proj"), params);
        self.v_proj.init_parameters(&ctx.child("v_proj"), params);
        self.out_proj.init_parameters(&ctx.child("out_proj"), params);
    }
}
