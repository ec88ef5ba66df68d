//! Shape/stride bookkeeping for `Tensor` (L4).

/// A single `(dim, stride)` pair. Strides are in elements, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elem {
    pub shape: i64,
    pub stride: i64,
}

/// Ordered sequence of `(dim, stride)` pairs describing a tensor's shape and
/// memory layout. Rank is `dims.len()`; an empty tensor is the sentinel
/// `ShapeStride::empty()`, which has rank `-1` and is distinct from a rank-0
/// scalar (`ShapeStride { dims: vec![] }` with nonzero numel of 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeStride {
    dims: Vec<Elem>,
    is_empty_sentinel: bool,
}

impl ShapeStride {
    pub const EMPTY_RANK: i64 = -1;

    /// The empty-tensor sentinel: rank -1, zero elements.
    pub fn empty() -> Self {
        Self {
            dims: Vec::new(),
            is_empty_sentinel: true,
        }
    }

    /// A rank-0 scalar shape (single element, no dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: Vec::new(),
            is_empty_sentinel: false,
        }
    }

    /// Build a contiguous row-major shape from a list of dimension sizes.
    pub fn contiguous(shape: &[i64]) -> Self {
        let mut dims = Vec::with_capacity(shape.len());
        let mut stride = 1i64;
        let mut strides = vec![1i64; shape.len()];
        for i in (0..shape.len()).rev() {
            strides[i] = stride;
            stride *= shape[i].max(0);
        }
        for (i, &s) in shape.iter().enumerate() {
            dims.push(Elem {
                shape: s,
                stride: strides[i],
            });
        }
        Self {
            dims,
            is_empty_sentinel: false,
        }
    }

    pub fn from_elems(dims: Vec<Elem>) -> Self {
        Self {
            dims,
            is_empty_sentinel: false,
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.is_empty_sentinel
    }

    /// Rank: `-1` for the empty sentinel, otherwise `dims.len()` (0 for
    /// scalars).
    pub fn rank(&self) -> i64 {
        if self.is_empty_sentinel {
            Self::EMPTY_RANK
        } else {
            self.dims.len() as i64
        }
    }

    pub fn dims(&self) -> &[Elem] {
        &self.dims
    }

    pub fn shape_vec(&self) -> Vec<i64> {
        self.dims.iter().map(|e| e.shape).collect()
    }

    pub fn stride_vec(&self) -> Vec<i64> {
        self.dims.iter().map(|e| e.stride).collect()
    }

    /// Resolve a possibly-negative dimension index to a positive one.
    pub fn real_dim(&self, dim: i64) -> usize {
        let rank = self.dims.len() as i64;
        let d = if dim < 0 { dim + rank } else { dim };
        assert!(d >= 0 && d < rank, "dimension {dim} out of range for rank {rank}");
        d as usize
    }

    pub fn shape_at(&self, dim: i64) -> i64 {
        self.dims[self.real_dim(dim)].shape
    }

    pub fn stride_at(&self, dim: i64) -> i64 {
        self.dims[self.real_dim(dim)].stride
    }

    /// Number of elements: 0 for the empty sentinel, 1 for a rank-0 scalar,
    /// otherwise the product of all dimension sizes.
    pub fn numel(&self) -> i64 {
        if self.is_empty_sentinel {
            return 0;
        }
        self.dims.iter().map(|e| e.shape).product()
    }

    /// `true` when the rightmost stride is 1 and each preceding stride
    /// equals the product of shape and stride to its right.
    pub fn is_contiguous(&self) -> bool {
        if self.is_empty_sentinel {
            return true;
        }
        let mut expected = 1i64;
        for e in self.dims.iter().rev() {
            if e.shape > 1 && e.stride != expected {
                return false;
            }
            expected *= e.shape;
        }
        true
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Self {
        let mut dims = self.dims.clone();
        let d0 = self.real_dim(dim0);
        let d1 = self.real_dim(dim1);
        dims.swap(d0, d1);
        Self {
            dims,
            is_empty_sentinel: false,
        }
    }

    pub fn unsqueeze(&self, dim: i64) -> Self {
        let rank = self.dims.len() as i64;
        let d = if dim < 0 { dim + rank + 1 } else { dim };
        assert!(d >= 0 && d <= rank, "unsqueeze dim {dim} out of range");
        let insert_at = d as usize;
        // New dim has stride equal to the stride of the dim it displaces
        // (or 1 at the tail), matching a contiguous insertion of size 1.
        let stride = if insert_at < self.dims.len() {
            self.dims[insert_at].stride * self.dims[insert_at].shape.max(1)
        } else {
            1
        };
        let mut dims = self.dims.clone();
        dims.insert(insert_at, Elem { shape: 1, stride });
        Self {
            dims,
            is_empty_sentinel: false,
        }
    }

    pub fn squeeze(&self, dim: i64) -> Self {
        let d = self.real_dim(dim);
        assert_eq!(self.dims[d].shape, 1, "squeeze on non-unit dimension {dim}");
        let mut dims = self.dims.clone();
        dims.remove(d);
        Self {
            dims,
            is_empty_sentinel: false,
        }
    }

    /// Slice dimension `d` to `[lo, hi)`. Returns the new shape and the
    /// element offset to add to the data pointer.
    pub fn slice(&self, dim: i64, lo: i64, hi: i64) -> (Self, i64) {
        let d = self.real_dim(dim);
        assert!(
            lo >= 0 && hi <= self.dims[d].shape && lo <= hi,
            "slice [{lo}, {hi}) out of range for dim {dim} of size {}",
            self.dims[d].shape
        );
        let mut dims = self.dims.clone();
        let stride = dims[d].stride;
        dims[d].shape = hi - lo;
        let offset = lo * stride;
        (
            Self {
                dims,
                is_empty_sentinel: false,
            },
            offset,
        )
    }

    pub fn set_shape(&mut self, dim: i64, shape: i64) {
        let d = self.real_dim(dim);
        assert!(shape <= self.dims[d].shape, "setShape may only shrink a dimension");
        self.dims[d].shape = shape;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_are_row_major() {
        let s = ShapeStride::contiguous(&[2, 3, 4]);
        assert_eq!(s.stride_vec(), vec![12, 4, 1]);
        assert!(s.is_contiguous());
        assert_eq!(s.numel(), 24);
    }

    #[test]
    fn transpose_is_involutive() {
        let s = ShapeStride::contiguous(&[2, 3, 4]);
        let t = s.transpose(0, 2).transpose(0, 2);
        assert_eq!(t, s);
        assert!(!s.transpose(0, 2).is_contiguous());
    }

    #[test]
    fn slice_narrows_shape_and_offsets() {
        let s = ShapeStride::contiguous(&[4, 5]);
        let (sliced, offset) = s.slice(0, 1, 3);
        assert_eq!(sliced.shape_vec(), vec![2, 5]);
        assert_eq!(offset, 5);
    }

    #[test]
    fn unsqueeze_then_squeeze_roundtrips() {
        let s = ShapeStride::contiguous(&[3, 4]);
        let u = s.unsqueeze(1);
        assert_eq!(u.shape_vec(), vec![3, 1, 4]);
        let sq = u.squeeze(1);
        assert_eq!(sq.shape_vec(), s.shape_vec());
    }

    #[test]
    fn empty_sentinel_distinct_from_scalar() {
        let empty = ShapeStride::empty();
        let scalar = ShapeStride::scalar();
        assert_eq!(empty.rank(), -1);
        assert_eq!(scalar.rank(), 0);
        assert_ne!(empty.rank(), scalar.rank());
    }
}
