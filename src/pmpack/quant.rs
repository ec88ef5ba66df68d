//! Mixed-precision f32×int4→f32 matmul (§4.3's "Mixed-precision GEMM"):
//! dense `A` (f32) against a `QInt4F32` `B`, with the precondition
//! `trans_b == true` and `group_size == k` (one scale per output column).

use crate::error::{RtError, RtResult};
use crate::kernels;
use crate::pmpack::gemm::GemmDriver;

/// Caches the dequantization scratch buffer used by the `M > 1` path,
/// reused across calls while its element count (`n * k`) is unchanged — the
/// scratch holds one dequantized copy of all of `B`, not of `C`, so it is
/// keyed on `B`'s element count rather than `C`'s (see DESIGN.md).
pub struct QuantMatmul {
    scratch: Vec<f32>,
}

impl Default for QuantMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantMatmul {
    pub fn new() -> Self {
        Self { scratch: Vec::new() }
    }

    /// `C[m,n] = sum_k A[m,k] * dequant(B)[n,k]`, where `B` is stored as `N`
    /// rows of `K` packed nibbles (`trans_b = true`) with one scale per row
    /// (`group_size == k`).
    ///
    /// - `a`: `M×K` row-major, `lda == k`.
    /// - `b_packed`: `N` rows of `k.div_ceil(2)` bytes each, concatenated.
    /// - `b_scales`: one scale per row (length `n`).
    /// - `c`: `M×N` row-major output, `ldc == n`.
    pub fn matmul(
        &mut self,
        driver: &mut GemmDriver,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b_packed: &[u8],
        b_scales: &[f32],
        group_size: usize,
        c: &mut [f32],
    ) -> RtResult<()> {
        if group_size != k {
            return Err(RtError::aborted(format!(
                "matmul_f32_int4: group_size ({group_size}) must equal k ({k})"
            )));
        }
        let row_bytes = k.div_ceil(2);
        if b_packed.len() != row_bytes * n {
            return Err(RtError::aborted(format!(
                "matmul_f32_int4: b_packed has {} bytes, expected {}",
                b_packed.len(),
                row_bytes * n
            )));
        }
        if b_scales.len() != n {
            return Err(RtError::aborted(format!(
                "matmul_f32_int4: b_scales has {} entries, expected {n}",
                b_scales.len()
            )));
        }

        if m == 1 {
            let backend = driver.backend();
            for col in 0..n {
                let row = &b_packed[col * row_bytes..(col + 1) * row_bytes];
                // SAFETY: backend came from Backend::detect(); row has
                // row_bytes bytes covering k nibbles as dot_f32_int4 expects.
                c[col] = unsafe { kernels::dot_f32_int4(backend, k, &a[..k], row, b_scales[col]) };
            }
            return Ok(());
        }

        let needed = n * k;
        if self.scratch.len() != needed {
            self.scratch = vec![0.0f32; needed];
        }
        for row in 0..n {
            let packed_row = &b_packed[row * row_bytes..(row + 1) * row_bytes];
            let scale = b_scales[row];
            let out = &mut self.scratch[row * k..(row + 1) * k];
            for i in 0..k {
                let byte = packed_row[i / 2];
                let nibble = if i % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f };
                out[i] = (nibble as i32 - 8) as f32 * scale;
            }
        }

        driver.matmul(false, true, m, n, k, a, k, &self.scratch, k, c, n);
        Ok(())
    }

    /// Batched variant. `b_batch` must be `1` (the same quantized `B`
    /// broadcast to every item in the `A` batch) or equal to `a_batch`
    /// (matched per-item); any other value is rejected (§9 open-question
    /// resolution).
    #[allow(clippy::too_many_arguments)]
    pub fn matmul_batched(
        &mut self,
        driver: &mut GemmDriver,
        a_batch: usize,
        b_batch: usize,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b_packed: &[u8],
        b_scales: &[f32],
        group_size: usize,
        c: &mut [f32],
    ) -> RtResult<()> {
        if b_batch != 1 && b_batch != a_batch {
            return Err(RtError::aborted(format!(
                "matmul_f32_int4 batched: b_batch ({b_batch}) must be 1 or equal to a_batch ({a_batch})"
            )));
        }
        let row_bytes = k.div_ceil(2);
        let a_item = m * k;
        let b_item = n * row_bytes;
        let scale_item = n;
        let c_item = m * n;

        for i in 0..a_batch {
            let b_idx = if b_batch == 1 { 0 } else { i };
            self.matmul(
                driver,
                m,
                n,
                k,
                &a[i * a_item..(i + 1) * a_item],
                &b_packed[b_idx * b_item..(b_idx + 1) * b_item],
                &b_scales[b_idx * scale_item..(b_idx + 1) * scale_item],
                group_size,
                &mut c[i * c_item..(i + 1) * c_item],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_utils::Backend;

    fn pack_row(values: &[i32]) -> Vec<u8> {
        let mut out = vec![0u8; values.len().div_ceil(2)];
        for (i, &v) in values.iter().enumerate() {
            let nibble = (v + 8) as u8 & 0x0f;
            if i % 2 == 0 {
                out[i / 2] |= nibble;
            } else {
                out[i / 2] |= nibble << 4;
            }
        }
        out
    }

    #[test]
    fn rejects_group_size_not_equal_k() {
        let mut qm = QuantMatmul::new();
        let mut driver = GemmDriver::new(Backend::Scalar, 1);
        let mut c = vec![0.0f32; 1];
        let err = qm.matmul(&mut driver, 1, 1, 4, &[1.0; 4], &[0u8; 2], &[1.0], 2, &mut c);
        assert!(err.is_err());
    }

    #[test]
    fn m_equals_1_matches_manual_dequant_dot() {
        let k = 4;
        let n = 2;
        let a = vec![1.0f32, 2.0, 3.0, 4.0];
        let row0 = pack_row(&[-8, -1, 0, 7]);
        let row1 = pack_row(&[1, 1, 1, 1]);
        let mut b_packed = row0.clone();
        b_packed.extend_from_slice(&row1);
        let scales = vec![2.0f32, 0.5f32];

        let mut qm = QuantMatmul::new();
        let mut driver = GemmDriver::new(Backend::Scalar, 1);
        let mut c = vec![0.0f32; n];
        qm.matmul(&mut driver, 1, n, k, &a, &b_packed, &scales, k, &mut c).unwrap();

        // col0: (-8*1 + -1*2 + 0*3 + 7*4) * 2.0 = (-8-2+0+28)*2 = 36
        assert!((c[0] - 36.0).abs() < 1e-3);
        // col1: (1+2+3+4) * 0.5 = 5.0
        assert!((c[1] - 5.0).abs() < 1e-3);
    }

    #[test]
    fn m_greater_than_1_matches_m_equals_1_per_row() {
        let k = 8;
        let n = 3;
        let m = 2;
        let a: Vec<f32> = (0..m * k).map(|i| (i as f32) * 0.1 - 0.3).collect();
        let rows: Vec<Vec<i32>> = (0..n).map(|r| (0..k as i32).map(|i| (i + r as i32) % 16 - 8).collect()).collect();
        let mut b_packed = Vec::new();
        for row in &rows {
            b_packed.extend(pack_row(row));
        }
        let scales = vec![0.3f32, 0.7, 1.1];

        let mut qm = QuantMatmul::new();
        let mut driver = GemmDriver::new(Backend::Scalar, 1);
        let mut c = vec![0.0f32; m * n];
        qm.matmul(&mut driver, m, n, k, &a, &b_packed, &scales, k, &mut c).unwrap();

        for row_idx in 0..m {
            let mut c1 = vec![0.0f32; n];
            qm.matmul(&mut driver, 1, n, k, &a[row_idx * k..(row_idx + 1) * k], &b_packed, &scales, k, &mut c1)
                .unwrap();
            for col in 0..n {
                assert!((c[row_idx * n + col] - c1[col]).abs() < 1e-2);
            }
        }
    }

    #[test]
    fn batched_rejects_mismatched_batch() {
        let mut qm = QuantMatmul::new();
        let mut driver = GemmDriver::new(Backend::Scalar, 1);
        let mut c = vec![0.0f32; 4];
        let err = qm.matmul_batched(&mut driver, 2, 3, 1, 2, 4, &[0.0; 8], &[0u8; 4], &[1.0; 6], 4, &mut c);
        assert!(err.is_err());
    }
}
