//! AVX-512 micro-kernels. Callers must confirm `avx512f` support before
//! calling into this module.

use std::arch::x86_64::*;

pub const MR: usize = 12;
pub const NR: usize = 32;

/// `sgemm 12×32`: holds the `C` tile in 24 ZMM registers (12 rows × 2 regs
/// of 16 lanes each).
///
/// # Safety
/// Caller must have verified AVX-512F support.
#[target_feature(enable = "avx512f")]
pub unsafe fn sgemm_micro_kernel(kc: usize, a: &[f32], b: &[f32], c: &mut [f32], rs_c: usize) {
    debug_assert!(a.len() >= kc * MR);
    debug_assert!(b.len() >= kc * NR);
    debug_assert!(c.len() >= (MR - 1) * rs_c + NR);

    let mut acc = [[_mm512_setzero_ps(); 2]; MR];
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for k in 0..kc {
        let b0 = _mm512_loadu_ps(b_ptr.add(k * NR));
        let b1 = _mm512_loadu_ps(b_ptr.add(k * NR + 16));
        for m in 0..MR {
            let a_val = *a_ptr.add(k * MR + m);
            let a_bcast = _mm512_set1_ps(a_val);
            acc[m][0] = _mm512_fmadd_ps(a_bcast, b0, acc[m][0]);
            acc[m][1] = _mm512_fmadd_ps(a_bcast, b1, acc[m][1]);
        }
    }

    let c_ptr = c.as_mut_ptr();
    for m in 0..MR {
        let row = c_ptr.add(m * rs_c);
        let c0 = _mm512_loadu_ps(row);
        let c1 = _mm512_loadu_ps(row.add(16));
        _mm512_storeu_ps(row, _mm512_add_ps(c0, acc[m][0]));
        _mm512_storeu_ps(row.add(16), _mm512_add_ps(c1, acc[m][1]));
    }
}

/// `y += a * x`, 16-wide FMA with a scalar remainder loop.
///
/// # Safety
/// Caller must have verified AVX-512F support.
#[target_feature(enable = "avx512f")]
pub unsafe fn saxpy(n: usize, a: f32, x: &[f32], y: &mut [f32]) {
    let a_vec = _mm512_set1_ps(a);
    let chunks = n / 16;
    let x_ptr = x.as_ptr();
    let y_ptr = y.as_mut_ptr();
    for i in 0..chunks {
        let xv = _mm512_loadu_ps(x_ptr.add(i * 16));
        let yv = _mm512_loadu_ps(y_ptr.add(i * 16));
        let r = _mm512_fmadd_ps(a_vec, xv, yv);
        _mm512_storeu_ps(y_ptr.add(i * 16), r);
    }
    for i in (chunks * 16)..n {
        y[i] += a * x[i];
    }
}

/// Dot product with a 16-wide FMA accumulator, horizontal reduction via
/// `_mm512_reduce_add_ps`, and a scalar remainder loop.
///
/// # Safety
/// Caller must have verified AVX-512F support.
#[target_feature(enable = "avx512f")]
pub unsafe fn sdot(n: usize, x: &[f32], y: &[f32]) -> f32 {
    let mut acc = _mm512_setzero_ps();
    let chunks = n / 16;
    let x_ptr = x.as_ptr();
    let y_ptr = y.as_ptr();
    for i in 0..chunks {
        let xv = _mm512_loadu_ps(x_ptr.add(i * 16));
        let yv = _mm512_loadu_ps(y_ptr.add(i * 16));
        acc = _mm512_fmadd_ps(xv, yv, acc);
    }
    let mut sum = _mm512_reduce_add_ps(acc);
    for i in (chunks * 16)..n {
        sum += x[i] * y[i];
    }
    sum
}

/// Dot product of a dense `x` against a dequantized QInt4F32 column, 16
/// lanes (8 packed bytes = 16 nibbles) at a time.
///
/// # Safety
/// Caller must have verified AVX-512F support.
#[target_feature(enable = "avx512f")]
pub unsafe fn dot_f32_int4(k: usize, x: &[f32], packed: &[u8], scale: f32) -> f32 {
    let mut acc = _mm512_setzero_ps();
    let scale_vec = _mm512_set1_ps(scale);
    let groups = k / 16;
    let x_ptr = x.as_ptr();

    for g in 0..groups {
        let elem_start = g * 16;
        let mut coeffs = [0.0f32; 16];
        for (lane, coeff) in coeffs.iter_mut().enumerate() {
            let elem_idx = elem_start + lane;
            let byte = packed[elem_idx / 2];
            let nibble = if elem_idx % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f };
            *coeff = (nibble as i32 - 8) as f32;
        }
        let w_vec = _mm512_loadu_ps(coeffs.as_ptr());
        let w_scaled = _mm512_mul_ps(w_vec, scale_vec);
        let xv = _mm512_loadu_ps(x_ptr.add(elem_start));
        acc = _mm512_fmadd_ps(xv, w_scaled, acc);
    }

    let mut sum = _mm512_reduce_add_ps(acc);
    for i in (groups * 16)..k {
        let byte = packed[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f };
        sum += x[i] * ((nibble as i32 - 8) as f32) * scale;
    }
    sum
}
