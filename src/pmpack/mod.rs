//! L3 — PMPack facade: process-wide backend selection (via
//! [`crate::runtime`]) plus the GEMM driver and mixed-precision matmul,
//! bundled into one handle operators can own for the lifetime of a forward
//! pass.

pub mod gemm;
pub mod packing;
pub mod quant;

pub use gemm::GemmDriver;
pub use quant::QuantMatmul;

use crate::device_utils::Backend;
use crate::error::RtResult;
use crate::runtime;

/// One GEMM driver plus one quantized-matmul scratch cache, selected
/// against whatever backend `Runtime::init` chose. Cheap to construct
/// relative to the matmuls it will run; operators typically own one per
/// forward pass.
pub struct PMPack {
    driver: GemmDriver,
    quant: QuantMatmul,
}

impl Default for PMPack {
    fn default() -> Self {
        Self::new()
    }
}

impl PMPack {
    pub fn new() -> Self {
        Self {
            driver: GemmDriver::new(runtime::backend(), runtime::get_num_threads()),
            quant: QuantMatmul::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.driver.backend()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sgemm(
        &mut self,
        trans_a: bool,
        trans_b: bool,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        lda: usize,
        b: &[f32],
        ldb: usize,
        c: &mut [f32],
        ldc: usize,
    ) {
        self.driver.matmul(trans_a, trans_b, m, n, k, a, lda, b, ldb, c, ldc);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sgemm_batched(
        &mut self,
        trans_a: bool,
        trans_b: bool,
        a_batch: usize,
        b_batch: usize,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        lda: usize,
        b: &[f32],
        ldb: usize,
        c: &mut [f32],
        ldc: usize,
    ) {
        gemm::matmul_batched(&mut self.driver, trans_a, trans_b, a_batch, b_batch, m, n, k, a, lda, b, ldb, c, ldc);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sgemm_qint4(
        &mut self,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b_packed: &[u8],
        b_scales: &[f32],
        group_size: usize,
        c: &mut [f32],
    ) -> RtResult<()> {
        self.quant.matmul(&mut self.driver, m, n, k, a, b_packed, b_scales, group_size, c)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sgemm_qint4_batched(
        &mut self,
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
        self.quant
            .matmul_batched(&mut self.driver, a_batch, b_batch, m, n, k, a, b_packed, b_scales, group_size, c)
    }
}
