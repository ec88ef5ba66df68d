//! L1 — Micro-kernels: the innermost register-blocked tiles PMPack's 5-loop
//! driver calls into. One implementation per `Backend`; `scalar` is always
//! available, `avx2`/`avx512` are x86_64-only and gated behind
//! `Backend::detect()` at call sites.

pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub mod avx2;
#[cfg(target_arch = "x86_64")]
pub mod avx512;

use crate::device_utils::Backend;

/// Register-tile dimensions for `backend`. PMPack's packing routines pad
/// panels up to these so every micro-kernel call operates on a full tile.
pub fn tile_dims(backend: Backend) -> (usize, usize) {
    match backend {
        Backend::Scalar => (scalar::MR, scalar::NR),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx2 => (avx2::MR, avx2::NR),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx512 => (avx512::MR, avx512::NR),
        #[cfg(not(target_arch = "x86_64"))]
        Backend::Avx2 | Backend::Avx512 => (scalar::MR, scalar::NR),
    }
}

/// Dispatch one `MR×NR` micro-kernel tile update to `backend`.
///
/// # Safety
/// If `backend` is `Avx2`/`Avx512`, the caller must have already confirmed
/// the corresponding CPU features are present (normally true by
/// construction: `backend` only takes those values when `Backend::detect()`
/// found the features). `a`, `b`, `c` must be sized per that backend's
/// `tile_dims`.
pub unsafe fn sgemm_micro_kernel(
    backend: Backend,
    kc: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    rs_c: usize,
) {
    match backend {
        Backend::Scalar => scalar::sgemm_micro_kernel(kc, a, b, c, rs_c),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx2 => avx2::sgemm_micro_kernel(kc, a, b, c, rs_c),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx512 => avx512::sgemm_micro_kernel(kc, a, b, c, rs_c),
        #[cfg(not(target_arch = "x86_64"))]
        Backend::Avx2 | Backend::Avx512 => scalar::sgemm_micro_kernel(kc, a, b, c, rs_c),
    }
}

/// Dispatch `y += a * x` to `backend`.
///
/// # Safety
/// See [`sgemm_micro_kernel`].
pub unsafe fn saxpy(backend: Backend, n: usize, a: f32, x: &[f32], y: &mut [f32]) {
    match backend {
        Backend::Scalar => scalar::saxpy(n, a, x, y),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx2 => avx2::saxpy(n, a, x, y),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx512 => avx512::saxpy(n, a, x, y),
        #[cfg(not(target_arch = "x86_64"))]
        Backend::Avx2 | Backend::Avx512 => scalar::saxpy(n, a, x, y),
    }
}

/// Dispatch a dot product to `backend`.
///
/// # Safety
/// See [`sgemm_micro_kernel`].
pub unsafe fn sdot(backend: Backend, n: usize, x: &[f32], y: &[f32]) -> f32 {
    match backend {
        Backend::Scalar => scalar::sdot(n, x, y),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx2 => avx2::sdot(n, x, y),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx512 => avx512::sdot(n, x, y),
        #[cfg(not(target_arch = "x86_64"))]
        Backend::Avx2 | Backend::Avx512 => scalar::sdot(n, x, y),
    }
}

/// Dispatch a dense-times-QInt4F32-column dot product to `backend`.
///
/// # Safety
/// See [`sgemm_micro_kernel`].
pub unsafe fn dot_f32_int4(backend: Backend, k: usize, x: &[f32], packed: &[u8], scale: f32) -> f32 {
    match backend {
        Backend::Scalar => scalar::dot_f32_int4(k, x, packed, scale),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx2 => avx2::dot_f32_int4(k, x, packed, scale),
        #[cfg(target_arch = "x86_64")]
        Backend::Avx512 => avx512::dot_f32_int4(k, x, packed, scale),
        #[cfg(not(target_arch = "x86_64"))]
        Backend::Avx2 | Backend::Avx512 => scalar::dot_f32_int4(k, x, packed, scale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_dispatch_matches_direct_call() {
        let x = vec![1.0f32, 2.0, 3.0];
        let y = vec![4.0f32, 5.0, 6.0];
        let direct = scalar::sdot(3, &x, &y);
        let dispatched = unsafe { sdot(Backend::Scalar, 3, &x, &y) };
        assert_eq!(direct, dispatched);
    }

    #[test]
    fn tile_dims_scalar_matches_constants() {
        assert_eq!(tile_dims(Backend::Scalar), (scalar::MR, scalar::NR));
    }
}
