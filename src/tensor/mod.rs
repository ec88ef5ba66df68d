//! L4 — Tensor: rank-*n* shape+stride over shared refcounted storage.

mod dtype;
mod shape;
mod storage;

pub use dtype::DType;
pub use shape::{Elem, ShapeStride};
pub use storage::{QInt4Storage, StorageData, TensorStorage};

use std::collections::HashMap;
use std::sync::Arc;

/// String-keyed mapping from dotted parameter names to tensors: the frozen
/// parameter dictionary loaded from a model file, and the mutable
/// past-key/value cache threaded through autoregressive decoding.
pub type TensorMap = HashMap<String, Tensor>;

/// A view into a `TensorStorage`: a strong reference to the storage, an
/// element offset into it, and a shape/stride describing how to walk it.
/// Multiple tensors may share one storage while exposing different shapes,
/// strides, and offsets (transpose/slice/view never copy data).
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<TensorStorage>,
    offset: usize,
    shape: ShapeStride,
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    pub fn shape(&self) -> &ShapeStride {
        &self.shape
    }

    pub fn rank(&self) -> i64 {
        self.shape.rank()
    }

    pub fn dims(&self) -> Vec<i64> {
        self.shape.shape_vec()
    }

    pub fn dim(&self, d: i64) -> i64 {
        self.shape.shape_at(d)
    }

    pub fn numel(&self) -> i64 {
        self.shape.numel()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn storage(&self) -> &Arc<TensorStorage> {
        &self.storage
    }

    pub fn is_contiguous(&self) -> bool {
        self.shape.is_contiguous()
    }

    // --- Factories ---------------------------------------------------

    pub fn zeros_f32(shape: &[i64]) -> Self {
        let numel = shape.iter().product::<i64>() as usize;
        Self {
            storage: Arc::new(TensorStorage::zeros_f32(numel)),
            offset: 0,
            shape: ShapeStride::contiguous(shape),
        }
    }

    pub fn from_f32_vec(shape: &[i64], data: Vec<f32>) -> Self {
        let expected: i64 = shape.iter().product();
        assert_eq!(
            expected as usize,
            data.len(),
            "from_f32_vec: shape {shape:?} implies {expected} elements, got {}",
            data.len()
        );
        Self {
            storage: Arc::new(TensorStorage::from_f32_vec(data)),
            offset: 0,
            shape: ShapeStride::contiguous(shape),
        }
    }

    pub fn from_i64_vec(shape: &[i64], data: Vec<i64>) -> Self {
        let expected: i64 = shape.iter().product();
        assert_eq!(
            expected as usize,
            data.len(),
            "from_i64_vec: shape {shape:?} implies {expected} elements, got {}",
            data.len()
        );
        Self {
            storage: Arc::new(TensorStorage::from_i64_vec(data)),
            offset: 0,
            shape: ShapeStride::contiguous(shape),
        }
    }

    pub fn qint4(shape: &[i64], packed: Vec<u8>, scales: Vec<f32>, group_size: usize) -> Self {
        let numel = shape.iter().product::<i64>() as usize;
        Self {
            storage: Arc::new(TensorStorage::qint4(packed, scales, numel, group_size)),
            offset: 0,
            shape: ShapeStride::contiguous(shape),
        }
    }

    // --- Views ---------------------------------------------------------

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Self {
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape: self.shape.transpose(dim0, dim1),
        }
    }

    pub fn unsqueeze(&self, dim: i64) -> Self {
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape: self.shape.unsqueeze(dim),
        }
    }

    pub fn squeeze(&self, dim: i64) -> Self {
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape: self.shape.squeeze(dim),
        }
    }

    pub fn slice(&self, dim: i64, lo: i64, hi: i64) -> Self {
        let (shape, rel_offset) = self.shape.slice(dim, lo, hi);
        Self {
            storage: self.storage.clone(),
            offset: (self.offset as i64 + rel_offset) as usize,
            shape,
        }
    }

    /// Reshape into `new_shape`, which must have the same element count.
    /// Requires the tensor to be contiguous (callers should call
    /// `contiguous()` first if unsure).
    pub fn view(&self, new_shape: &[i64]) -> Self {
        assert!(
            self.is_contiguous(),
            "view() requires a contiguous tensor; call contiguous() first"
        );
        let expected: i64 = new_shape.iter().product();
        assert_eq!(
            expected,
            self.numel(),
            "view: cannot reshape {:?} ({} elements) into {:?} ({} elements)",
            self.dims(),
            self.numel(),
            new_shape,
            expected
        );
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape: ShapeStride::contiguous(new_shape),
        }
    }

    // --- Data access -----------------------------------------------------

    /// Read the element at `indices` (length must equal rank). F32 only.
    pub fn get_f32(&self, indices: &[i64]) -> f32 {
        assert_eq!(indices.len() as i64, self.rank());
        let mut off = self.offset as i64;
        for (d, &idx) in indices.iter().enumerate() {
            off += idx * self.shape.stride_at(d as i64);
        }
        self.storage.as_f32_slice()[off as usize]
    }

    /// Borrow the full backing f32 slice (ignores this view's offset/shape
    /// — callers index with this tensor's own offset/strides).
    pub fn raw_f32(&self) -> &[f32] {
        self.storage.as_f32_slice()
    }

    pub fn raw_i64(&self) -> &[i64] {
        self.storage.as_i64_slice()
    }

    /// Materialize a row-major contiguous copy of this tensor's data. A
    /// no-op (clone of the view) only when already contiguous *and*
    /// `offset == 0` — `raw_f32`/`raw_i64` read from the start of backing
    /// storage, so a contiguous view at a nonzero offset (e.g. a slice of a
    /// larger tensor) still needs to be materialized down to its own data.
    pub fn contiguous(&self) -> Self {
        if self.is_contiguous() && self.offset == 0 {
            return self.clone();
        }
        match self.dtype() {
            DType::F32 => {
                let dims = self.dims();
                let numel = self.numel() as usize;
                let mut out = vec![0.0f32; numel];
                let src = self.storage.as_f32_slice();
                let strides = self.shape.stride_vec();
                let mut idx = vec![0i64; dims.len()];
                for out_slot in out.iter_mut() {
                    let mut off = self.offset as i64;
                    for (d, &i) in idx.iter().enumerate() {
                        off += i * strides[d];
                    }
                    *out_slot = src[off as usize];
                    increment_index(&mut idx, &dims);
                }
                Tensor::from_f32_vec(&dims, out)
            }
            DType::I64 => {
                let dims = self.dims();
                let numel = self.numel() as usize;
                let mut out = vec![0i64; numel];
                let src = self.storage.as_i64_slice();
                let strides = self.shape.stride_vec();
                let mut idx = vec![0i64; dims.len()];
                for out_slot in out.iter_mut() {
                    let mut off = self.offset as i64;
                    for (d, &i) in idx.iter().enumerate() {
                        off += i * strides[d];
                    }
                    *out_slot = src[off as usize];
                    increment_index(&mut idx, &dims);
                }
                Tensor::from_i64_vec(&dims, out)
            }
            DType::QInt4F32 => panic!("contiguous() is not defined for QInt4F32 views"),
            DType::Unknown => panic!("contiguous() on Unknown dtype"),
        }
    }
}

/// Odometer-style multi-index increment in row-major order.
fn increment_index(idx: &mut [i64], dims: &[i64]) {
    for d in (0..idx.len()).rev() {
        idx[d] += 1;
        if idx[d] < dims[d] {
            return;
        }
        idx[d] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_then_contiguous_matches_row_major_strides() {
        let t = Tensor::zeros_f32(&[2, 3]);
        assert!(t.is_contiguous());
        assert_eq!(t.shape().stride_vec(), vec![3, 1]);
    }

    #[test]
    fn transpose_roundtrip_is_identity() {
        let t = Tensor::from_f32_vec(&[2, 3], (0..6).map(|x| x as f32).collect());
        let tt = t.transpose(0, 1).transpose(0, 1);
        assert_eq!(tt.dims(), t.dims());
        assert_eq!(tt.shape().stride_vec(), t.shape().stride_vec());
    }

    #[test]
    fn slice_matches_elementwise_reference() {
        let t = Tensor::from_f32_vec(&[4, 2], (0..8).map(|x| x as f32).collect());
        let s = t.slice(0, 1, 3);
        assert_eq!(s.dims(), vec![2, 2]);
        for k in 0..2 {
            for j in 0..2 {
                assert_eq!(s.get_f32(&[k, j]), t.get_f32(&[1 + k, j]));
            }
        }
    }

    #[test]
    fn contiguous_of_transposed_materializes_row_major() {
        let t = Tensor::from_f32_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let tt = t.transpose(0, 1);
        assert!(!tt.is_contiguous());
        let c = tt.contiguous();
        assert!(c.is_contiguous());
        assert_eq!(c.dims(), vec![3, 2]);
        // tt[i][j] == t[j][i]
        for i in 0..3 {
            for j in 0..2 {
                assert_eq!(c.get_f32(&[i, j]), t.get_f32(&[j, i]));
            }
        }
    }
}
