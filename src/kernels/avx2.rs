//! AVX-2 + FMA micro-kernels. Callers (the PMPack backend dispatch) must
//! confirm `avx2`/`fma` support before calling into this module — these
//! functions assume it and use intrinsics unconditionally.

use std::arch::x86_64::*;

pub const MR: usize = 6;
pub const NR: usize = 16;

/// `sgemm 6×16`: holds the `C` tile in 12 YMM registers (6 rows × 2 regs of
/// 8 lanes each), broadcasting one `A` element per row and FMA-ing across
/// both `B` vectors.
///
/// # Safety
/// Caller must have verified AVX2+FMA support (`is_x86_feature_detected!`).
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn sgemm_micro_kernel(kc: usize, a: &[f32], b: &[f32], c: &mut [f32], rs_c: usize) {
    debug_assert!(a.len() >= kc * MR);
    debug_assert!(b.len() >= kc * NR);
    debug_assert!(c.len() >= (MR - 1) * rs_c + NR);

    let mut acc = [[_mm256_setzero_ps(); 2]; MR];
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for k in 0..kc {
        let b0 = _mm256_loadu_ps(b_ptr.add(k * NR));
        let b1 = _mm256_loadu_ps(b_ptr.add(k * NR + 8));
        for m in 0..MR {
            let a_val = *a_ptr.add(k * MR + m);
            let a_bcast = _mm256_set1_ps(a_val);
            acc[m][0] = _mm256_fmadd_ps(a_bcast, b0, acc[m][0]);
            acc[m][1] = _mm256_fmadd_ps(a_bcast, b1, acc[m][1]);
        }
    }

    let c_ptr = c.as_mut_ptr();
    for m in 0..MR {
        let row = c_ptr.add(m * rs_c);
        let c0 = _mm256_loadu_ps(row);
        let c1 = _mm256_loadu_ps(row.add(8));
        _mm256_storeu_ps(row, _mm256_add_ps(c0, acc[m][0]));
        _mm256_storeu_ps(row.add(8), _mm256_add_ps(c1, acc[m][1]));
    }
}

/// `y += a * x`, 8-wide FMA with a scalar remainder loop.
///
/// # Safety
/// Caller must have verified AVX2+FMA support.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn saxpy(n: usize, a: f32, x: &[f32], y: &mut [f32]) {
    let a_vec = _mm256_set1_ps(a);
    let chunks = n / 8;
    let x_ptr = x.as_ptr();
    let y_ptr = y.as_mut_ptr();
    for i in 0..chunks {
        let xv = _mm256_loadu_ps(x_ptr.add(i * 8));
        let yv = _mm256_loadu_ps(y_ptr.add(i * 8));
        let r = _mm256_fmadd_ps(a_vec, xv, yv);
        _mm256_storeu_ps(y_ptr.add(i * 8), r);
    }
    for i in (chunks * 8)..n {
        y[i] += a * x[i];
    }
}

/// Dot product with an 8-wide FMA accumulator, horizontal reduction, and a
/// scalar remainder loop.
///
/// # Safety
/// Caller must have verified AVX2+FMA support.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn sdot(n: usize, x: &[f32], y: &[f32]) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let chunks = n / 8;
    let x_ptr = x.as_ptr();
    let y_ptr = y.as_ptr();
    for i in 0..chunks {
        let xv = _mm256_loadu_ps(x_ptr.add(i * 8));
        let yv = _mm256_loadu_ps(y_ptr.add(i * 8));
        acc = _mm256_fmadd_ps(xv, yv, acc);
    }
    let mut lanes = [0.0f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut sum: f32 = lanes.iter().sum();
    for i in (chunks * 8)..n {
        sum += x[i] * y[i];
    }
    sum
}

/// Dot product of a dense `x` against a dequantized QInt4F32 column.
/// Loads 16 packed bytes (32 nibbles = 4 groups of 8 f32) at a time,
/// scale-multiplies, and FMAs into the running sum; remainder handled
/// scalar.
///
/// # Safety
/// Caller must have verified AVX2+FMA support.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn dot_f32_int4(k: usize, x: &[f32], packed: &[u8], scale: f32) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let scale_vec = _mm256_set1_ps(scale);
    let groups = k / 8;
    let x_ptr = x.as_ptr();

    for g in 0..groups {
        let elem_start = g * 8;
        let mut coeffs = [0.0f32; 8];
        for (lane, coeff) in coeffs.iter_mut().enumerate() {
            let elem_idx = elem_start + lane;
            let byte = packed[elem_idx / 2];
            let nibble = if elem_idx % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f };
            *coeff = (nibble as i32 - 8) as f32;
        }
        let w_vec = _mm256_loadu_ps(coeffs.as_ptr());
        let w_scaled = _mm256_mul_ps(w_vec, scale_vec);
        let xv = _mm256_loadu_ps(x_ptr.add(elem_start));
        acc = _mm256_fmadd_ps(xv, w_scaled, acc);
    }

    let mut lanes = [0.0f32; 8];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    let mut sum: f32 = lanes.iter().sum();
    for i in (groups * 8)..k {
        let byte = packed[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f };
        sum += x[i] * ((nibble as i32 - 8) as f32) * scale;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::scalar;

    fn has_avx2() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    #[test]
    fn micro_kernel_matches_scalar() {
        if !has_avx2() {
            return;
        }
        let kc = 5;
        let a: Vec<f32> = (0..kc * MR).map(|x| (x as f32) * 0.1).collect();
        let b: Vec<f32> = (0..kc * NR).map(|x| (x as f32) * 0.2 - 1.0).collect();
        let rs_c = NR;
        let mut c_avx = vec![0.0f32; MR * rs_c];
        let mut c_scalar = vec![0.0f32; MR * rs_c];
        unsafe { sgemm_micro_kernel(kc, &a, &b, &mut c_avx, rs_c) };
        scalar::sgemm_micro_kernel(kc, &a, &b, &mut c_scalar, rs_c);
        for i in 0..c_avx.len() {
            assert!((c_avx[i] - c_scalar[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn saxpy_matches_scalar() {
        if !has_avx2() {
            return;
        }
        let x: Vec<f32> = (0..37).map(|i| i as f32 * 0.3).collect();
        let mut y_avx = vec![1.0f32; 37];
        let mut y_scalar = vec![1.0f32; 37];
        unsafe { saxpy(37, 2.5, &x, &mut y_avx) };
        scalar::saxpy(37, 2.5, &x, &mut y_scalar);
        for i in 0..37 {
            assert!((y_avx[i] - y_scalar[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn sdot_matches_scalar() {
        if !has_avx2() {
            return;
        }
        let x: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.001).sin()).collect();
        let y: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.002).cos()).collect();
        let got = unsafe { sdot(1024, &x, &y) };
        let want = scalar::sdot(1024, &x, &y);
        assert!((got - want).abs() / want.abs().max(1.0) < 1e-3);
    }

    #[test]
    fn dot_f32_int4_matches_scalar() {
        if !has_avx2() {
            return;
        }
        let k = 1024;
        let x: Vec<f32> = (0..k).map(|i| (i as f32 * 0.01).sin()).collect();
        let packed: Vec<u8> = (0..k / 2).map(|i| (i % 256) as u8).collect();
        let scale = 0.37f32;
        let got = unsafe { dot_f32_int4(k, &x, &packed, scale) };
        let want = scalar::dot_f32_int4(k, &x, &packed, scale);
        assert!((got - want).abs() < 1e-2);
    }
}
