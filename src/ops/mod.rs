//! L5 — Operators: bridge `Tensor` to PMPack and implement element-wise
//! ops, reductions, lookup, layer-norm, softmax, GELU, causal mask, concat
//! (§4.4). Every operator validates shape/dtype and panics on mismatch —
//! per §7 these are fatal programmer errors, not recoverable `Result`s.

use crate::device_utils::Backend;
use crate::pmpack::PMPack;
use crate::tensor::{DType, Tensor};

fn batch_count(dims: &[i64]) -> usize {
    if dims.len() <= 2 {
        1
    } else {
        dims[..dims.len() - 2].iter().product::<i64>() as usize
    }
}

/// `lookup(table[V,D], idx[N,L...]) -> [N,L...,D]`: per-row copy.
pub fn lookup(table: &Tensor, idx: &Tensor) -> Tensor {
    assert_eq!(table.rank(), 2, "lookup: table must be rank 2, got rank {}", table.rank());
    assert_eq!(idx.dtype(), DType::I64, "lookup: idx must be i64");
    let d = table.dim(1);
    let v = table.dim(0);

    let table_c = table.contiguous();
    let table_data = table_c.raw_f32();
    let idx_c = idx.contiguous();
    let idx_data = idx_c.raw_i64();

    let mut out = vec![0.0f32; idx_data.len() * d as usize];
    for (row, &token) in idx_data.iter().enumerate() {
        assert!((0..v).contains(&token), "lookup: index {token} out of range [0,{v})");
        let src_start = (token as usize) * d as usize;
        let dst_start = row * d as usize;
        out[dst_start..dst_start + d as usize].copy_from_slice(&table_data[src_start..src_start + d as usize]);
    }

    let mut out_shape = idx.dims();
    out_shape.push(d);
    Tensor::from_f32_vec(&out_shape, out)
}

/// `matmul(A,B)`: `A.rank >= 2`, `B.rank >= 2`, `A.rank >= B.rank`. `B`'s
/// leading (batch) dims broadcast against a trailing slice of `A`'s leading
/// dims — in practice (and as validated here) `B`'s batch count must be `1`
/// or equal to `A`'s.
pub fn matmul(pm: &mut PMPack, a: &Tensor, b: &Tensor) -> Tensor {
    assert!(a.rank() >= 2, "matmul: A.rank must be >= 2, got {}", a.rank());
    assert!(b.rank() >= 2, "matmul: B.rank must be >= 2, got {}", b.rank());
    assert!(a.rank() >= b.rank(), "matmul: A.rank must be >= B.rank");

    let a_c = a.contiguous();
    let b_c = b.contiguous();
    let a_dims = a_c.dims();
    let b_dims = b_c.dims();
    let ar = a_dims.len();
    let br = b_dims.len();

    let m = a_dims[ar - 2] as usize;
    let k = a_dims[ar - 1] as usize;
    let k_b = b_dims[br - 2] as usize;
    let n = b_dims[br - 1] as usize;
    assert_eq!(k, k_b, "matmul: contracting dims disagree (A[-1]={k}, B[-2]={k_b})");

    let a_batch = batch_count(&a_dims);
    let b_batch = batch_count(&b_dims);
    assert!(
        b_batch == 1 || b_batch == a_batch,
        "matmul: B's batch count ({b_batch}) must broadcast (1) or match A's ({a_batch})"
    );

    let mut out = vec![0.0f32; a_batch * m * n];
    pm.sgemm_batched(
        false,
        false,
        a_batch,
        b_batch,
        m,
        n,
        k,
        a_c.raw_f32(),
        k,
        b_c.raw_f32(),
        n,
        &mut out,
        n,
    );

    let mut out_shape = a_dims[..ar - 2].to_vec();
    out_shape.push(m as i64);
    out_shape.push(n as i64);
    Tensor::from_f32_vec(&out_shape, out)
}

/// `matmul` against a `QInt4F32` weight matrix (`B`, stored transposed —
/// `N` rows of `K` packed values, `group_size == K`). Used by `nn::Linear`
/// when loaded with quantized weights.
pub fn matmul_qint4(pm: &mut PMPack, a: &Tensor, b: &Tensor) -> crate::error::RtResult<Tensor> {
    assert!(a.rank() >= 2, "matmul_qint4: A.rank must be >= 2");
    assert_eq!(b.dtype(), DType::QInt4F32, "matmul_qint4: B must be QInt4F32");
    assert_eq!(b.rank(), 2, "matmul_qint4: B must be rank 2 ([out,in])");

    let a_c = a.contiguous();
    let a_dims = a_c.dims();
    let ar = a_dims.len();
    let m = a_dims[ar - 2] as usize;
    let k = a_dims[ar - 1] as usize;
    let n = b.dim(0) as usize;
    assert_eq!(k, b.dim(1) as usize, "matmul_qint4: contracting dims disagree");

    let qstorage = b.storage().as_qint4();
    let mut out = vec![0.0f32; (batch_count(&a_dims) * m) * n];
    pm.sgemm_qint4(
        m * batch_count(&a_dims),
        n,
        k,
        a_c.raw_f32(),
        qstorage.packed.as_slice(),
        qstorage.scales.as_slice(),
        qstorage.group_size,
        &mut out,
    )?;

    let mut out_shape = a_dims[..ar - 2].to_vec();
    out_shape.push(m as i64);
    out_shape.push(n as i64);
    Ok(Tensor::from_f32_vec(&out_shape, out))
}

/// `add(A,B)`: `B.rank <= A.rank`, trailing shapes equal; `B` broadcasts by
/// wrap-around index over `A`'s leading dims.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert!(b.rank() <= a.rank(), "add: B.rank must be <= A.rank");
    let a_c = a.contiguous();
    let b_c = b.contiguous();
    let a_dims = a_c.dims();
    let b_dims = b_c.dims();
    let br = b_dims.len();
    assert_eq!(
        &a_dims[a_dims.len() - br..],
        &b_dims[..],
        "add: trailing shapes must match (A trailing {:?}, B {:?})",
        &a_dims[a_dims.len() - br..],
        b_dims
    );

    let a_data = a_c.raw_f32();
    let b_data = b_c.raw_f32();
    let b_len = b_data.len().max(1);
    let mut out = vec![0.0f32; a_data.len()];
    for i in 0..out.len() {
        out[i] = a_data[i] + b_data[i % b_len];
    }
    Tensor::from_f32_vec(&a_dims, out)
}

/// `mul(A, scalar)`.
pub fn mul(a: &Tensor, scalar: f32) -> Tensor {
    let a_c = a.contiguous();
    let out: Vec<f32> = a_c.raw_f32().iter().map(|&x| x * scalar).collect();
    Tensor::from_f32_vec(&a_c.dims(), out)
}

/// Elementwise `A * B`, same shape (no broadcast) — the gating multiply in
/// `nn::SwiGlu`.
pub fn mul_tensors(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.dims(), b.dims(), "mul_tensors: shapes must match exactly");
    let a_c = a.contiguous();
    let b_c = b.contiguous();
    let out: Vec<f32> = a_c.raw_f32().iter().zip(b_c.raw_f32()).map(|(&x, &y)| x * y).collect();
    Tensor::from_f32_vec(&a_c.dims(), out)
}

/// `silu(x) = x * sigmoid(x)`, the gate activation in `nn::SwiGlu`.
pub fn silu(a: &Tensor) -> Tensor {
    let a_c = a.contiguous();
    let out: Vec<f32> = a_c.raw_f32().iter().map(|&x| x / (1.0 + (-x).exp())).collect();
    Tensor::from_f32_vec(&a_c.dims(), out)
}

/// `softmax(A)` over the innermost dimension, `exp(x - logsumexp(x))` form,
/// accumulating the denominator in `f64` for determinism across thread
/// counts.
pub fn softmax(a: &Tensor) -> Tensor {
    let a_c = a.contiguous();
    let dims = a_c.dims();
    let inner = *dims.last().expect("softmax: rank must be >= 1") as usize;
    let data = a_c.raw_f32();
    let mut out = vec![0.0f32; data.len()];

    for (row, chunk) in data.chunks(inner).enumerate() {
        let max = chunk.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f64;
        for &x in chunk {
            denom += ((x - max) as f64).exp();
        }
        let log_denom = denom.ln();
        let out_chunk = &mut out[row * inner..(row + 1) * inner];
        for (o, &x) in out_chunk.iter_mut().zip(chunk) {
            *o = (((x - max) as f64) - log_denom).exp() as f32;
        }
    }
    Tensor::from_f32_vec(&dims, out)
}

/// `gelu(A)`: tanh approximation, `0.5x(1+tanh(sqrt(2/pi)(x+0.044715x^3)))`.
pub fn gelu(a: &Tensor) -> Tensor {
    const SQRT_2_OVER_PI: f32 = 0.7978845608028654;
    let a_c = a.contiguous();
    let out: Vec<f32> = a_c
        .raw_f32()
        .iter()
        .map(|&x| 0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh()))
        .collect();
    Tensor::from_f32_vec(&a_c.dims(), out)
}

/// `layerNorm(A, weight, bias, eps)`: normalize over the innermost `D`
/// dims, unbiased variance, `f64` accumulation, then scale+bias.
pub fn layer_norm(a: &Tensor, weight: &Tensor, bias: &Tensor, eps: f32) -> Tensor {
    let a_c = a.contiguous();
    let dims = a_c.dims();
    let d = *dims.last().expect("layerNorm: rank must be >= 1");
    assert_eq!(weight.rank(), 1, "layerNorm: weight must be 1-D");
    assert_eq!(weight.dim(0), d, "layerNorm: weight length must equal A's innermost dim");
    assert_eq!(bias.rank(), 1, "layerNorm: bias must be 1-D");
    assert_eq!(bias.dim(0), d, "layerNorm: bias length must equal A's innermost dim");

    let d_usize = d as usize;
    let data = a_c.raw_f32();
    let w = weight.contiguous();
    let b = bias.contiguous();
    let w_data = w.raw_f32();
    let b_data = b.raw_f32();
    let mut out = vec![0.0f32; data.len()];

    for (row, chunk) in data.chunks(d_usize).enumerate() {
        let mut mean = 0.0f64;
        for &x in chunk {
            mean += x as f64;
        }
        mean /= d_usize as f64;

        let mut var = 0.0f64;
        for &x in chunk {
            let diff = x as f64 - mean;
            var += diff * diff;
        }
        let divisor = if d_usize > 1 { (d_usize - 1) as f64 } else { 1.0 };
        var /= divisor;

        let inv_std = 1.0 / (var + eps as f64).sqrt();
        let out_chunk = &mut out[row * d_usize..(row + 1) * d_usize];
        for i in 0..d_usize {
            let normalized = ((chunk[i] as f64 - mean) * inv_std) as f32;
            out_chunk[i] = normalized * w_data[i] + b_data[i];
        }
    }
    Tensor::from_f32_vec(&dims, out)
}

/// `causalMask(L) -> [L,L]`: `0` on/below the diagonal, `-inf` above.
pub fn causal_mask(l: usize) -> Tensor {
    let mut out = vec![0.0f32; l * l];
    for i in 0..l {
        for j in (i + 1)..l {
            out[i * l + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_f32_vec(&[l as i64, l as i64], out)
}

/// `cat(A,B,dim)`: ranks equal, all dims but `dim` equal, concatenated
/// along `dim`.
pub fn cat(a: &Tensor, b: &Tensor, dim: i64) -> Tensor {
    assert_eq!(a.rank(), b.rank(), "cat: ranks must match");
    let a_c = a.contiguous();
    let b_c = b.contiguous();
    let a_dims = a_c.dims();
    let b_dims = b_c.dims();
    let d = dim.rem_euclid(a_dims.len() as i64) as usize;
    for i in 0..a_dims.len() {
        if i != d {
            assert_eq!(a_dims[i], b_dims[i], "cat: dims other than {d} must match");
        }
    }

    let outer: i64 = a_dims[..d].iter().product();
    let outer = outer.max(1) as usize;
    let inner: i64 = a_dims[d + 1..].iter().product();
    let inner = inner.max(1) as usize;
    let a_d = a_dims[d] as usize;
    let b_d = b_dims[d] as usize;

    let a_data = a_c.raw_f32();
    let b_data = b_c.raw_f32();
    let mut out = vec![0.0f32; outer * (a_d + b_d) * inner];
    for o in 0..outer {
        let a_src = &a_data[o * a_d * inner..(o + 1) * a_d * inner];
        let b_src = &b_data[o * b_d * inner..(o + 1) * b_d * inner];
        let dst_start = o * (a_d + b_d) * inner;
        out[dst_start..dst_start + a_d * inner].copy_from_slice(a_src);
        out[dst_start + a_d * inner..dst_start + (a_d + b_d) * inner].copy_from_slice(b_src);
    }

    let mut out_shape = a_dims.clone();
    out_shape[d] = (a_d + b_d) as i64;
    Tensor::from_f32_vec(&out_shape, out)
}

/// `contiguous(A)`: no-op if already contiguous, else materializes a
/// row-major copy.
pub fn contiguous(a: &Tensor) -> Tensor {
    a.contiguous()
}

/// Backend selected for this process's PMPack instances — exposed so
/// callers can log or branch on it without constructing a `PMPack`.
pub fn backend() -> Backend {
    crate::runtime::backend()
}
