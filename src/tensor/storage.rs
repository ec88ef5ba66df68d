//! Refcounted, 32-byte-aligned tensor storage (§3).

use crate::device_utils::AlignedBuf;
use crate::tensor::dtype::DType;

/// The raw element data backing a `TensorStorage`. One variant per dtype;
/// `QInt4F32` additionally carries the per-group scale array.
pub enum StorageData {
    F32(AlignedBuf<f32>),
    I64(AlignedBuf<i64>),
    QInt4(QInt4Storage),
}

/// Packed 4-bit storage: `numel` signed nibbles packed two per byte, plus
/// one f32 scale per `group_size` consecutive elements (§4.1).
pub struct QInt4Storage {
    pub packed: AlignedBuf<u8>,
    pub scales: AlignedBuf<f32>,
    pub group_size: usize,
}

/// Refcounted owner of a single aligned allocation (plus, for `QInt4F32`, a
/// second aligned allocation for scales). Destroyed when the last `Tensor`
/// referencing it drops its `Arc`.
pub struct TensorStorage {
    pub data: StorageData,
    pub numel: usize,
    pub dtype: DType,
}

impl TensorStorage {
    pub fn zeros_f32(numel: usize) -> Self {
        Self {
            data: StorageData::F32(AlignedBuf::new_zeroed(numel)),
            numel,
            dtype: DType::F32,
        }
    }

    pub fn uninit_f32(numel: usize) -> Self {
        Self {
            data: StorageData::F32(AlignedBuf::new_uninit(numel)),
            numel,
            dtype: DType::F32,
        }
    }

    pub fn from_f32_vec(v: Vec<f32>) -> Self {
        let mut storage = Self::uninit_f32(v.len());
        if let StorageData::F32(buf) = &mut storage.data {
            buf.as_mut_slice().copy_from_slice(&v);
        }
        storage
    }

    pub fn zeros_i64(numel: usize) -> Self {
        Self {
            data: StorageData::I64(AlignedBuf::new_zeroed(numel)),
            numel,
            dtype: DType::I64,
        }
    }

    pub fn from_i64_vec(v: Vec<i64>) -> Self {
        let mut storage = Self {
            data: StorageData::I64(AlignedBuf::new_uninit(v.len())),
            numel: v.len(),
            dtype: DType::I64,
        };
        if let StorageData::I64(buf) = &mut storage.data {
            buf.as_mut_slice().copy_from_slice(&v);
        }
        storage
    }

    /// `numel` signed 4-bit values packed into `ceil(numel/2)` bytes, with
    /// one f32 scale per `group_size` elements. `group_size` must be even
    /// and divide `numel`.
    pub fn qint4(packed: Vec<u8>, scales: Vec<f32>, numel: usize, group_size: usize) -> Self {
        assert_eq!(group_size % 2, 0, "QInt4F32 group_size must be even");
        assert_eq!(numel % group_size, 0, "QInt4F32 numel must divide evenly by group_size");
        assert_eq!(packed.len(), numel.div_ceil(2));
        assert_eq!(scales.len(), numel / group_size);

        let mut packed_buf = AlignedBuf::new_uninit(packed.len());
        packed_buf.as_mut_slice().copy_from_slice(&packed);
        let mut scale_buf = AlignedBuf::new_uninit(scales.len());
        scale_buf.as_mut_slice().copy_from_slice(&scales);

        Self {
            data: StorageData::QInt4(QInt4Storage {
                packed: packed_buf,
                scales: scale_buf,
                group_size,
            }),
            numel,
            dtype: DType::QInt4F32,
        }
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        match &self.data {
            StorageData::F32(b) => b.as_slice(),
            _ => panic!("TensorStorage: not an F32 storage"),
        }
    }

    pub fn as_f32_mut_slice(&mut self) -> &mut [f32] {
        match &mut self.data {
            StorageData::F32(b) => b.as_mut_slice(),
            _ => panic!("TensorStorage: not an F32 storage"),
        }
    }

    pub fn as_i64_slice(&self) -> &[i64] {
        match &self.data {
            StorageData::I64(b) => b.as_slice(),
            _ => panic!("TensorStorage: not an I64 storage"),
        }
    }

    pub fn as_qint4(&self) -> &QInt4Storage {
        match &self.data {
            StorageData::QInt4(q) => q,
            _ => panic!("TensorStorage: not a QInt4F32 storage"),
        }
    }

    /// Dequantize one group (`group_size` elements starting at `group_idx *
    /// group_size`) into the f32 output slice.
    pub fn dequantize_group(&self, group_idx: usize, out: &mut [f32]) {
        let q = self.as_qint4();
        assert_eq!(out.len(), q.group_size);
        let scale = q.scales.as_slice()[group_idx];
        let start_elem = group_idx * q.group_size;
        let packed = q.packed.as_slice();
        for i in 0..q.group_size {
            let elem_idx = start_elem + i;
            let byte = packed[elem_idx / 2];
            let nibble = if elem_idx % 2 == 0 {
                byte & 0x0f
            } else {
                (byte >> 4) & 0x0f
            };
            let signed = nibble as i32 - 8;
            out[i] = signed as f32 * scale;
        }
    }

    /// Dequantize the entire storage into a freshly allocated f32 vector.
    pub fn dequantize_all(&self) -> Vec<f32> {
        let q = self.as_qint4();
        let mut out = vec![0.0f32; self.numel];
        let num_groups = self.numel / q.group_size;
        for g in 0..num_groups {
            let start = g * q.group_size;
            self.dequantize_group(g, &mut out[start..start + q.group_size]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequantize_group_matches_nibble_encoding() {
        // group_size=4: values [-8, -1, 0, 7] packed as nibbles, scale=2.0
        // byte0: low nibble = 0 (->-8), high nibble = 7 (->-1)
        // byte1: low nibble = 8 (->0), high nibble = 15 (->7)
        let packed = vec![0x70u8, 0xF8u8];
        let scales = vec![2.0f32];
        let storage = TensorStorage::qint4(packed, scales, 4, 4);
        let mut out = [0.0f32; 4];
        storage.dequantize_group(0, &mut out);
        assert_eq!(out, [-16.0, -2.0, 0.0, 14.0]);
    }

    #[test]
    fn dequantize_all_covers_every_group() {
        let packed = vec![0x70u8, 0xF8u8, 0x00u8, 0x00u8];
        let scales = vec![2.0f32, 1.0f32];
        let storage = TensorStorage::qint4(packed, scales, 8, 4);
        let out = storage.dequantize_all();
        assert_eq!(out.len(), 8);
        assert_eq!(&out[0..4], &[-16.0, -2.0, 0.0, 14.0]);
    }
}
