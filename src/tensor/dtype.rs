//! Tagged element-type enumeration (§3).

/// Tagged dtype enumeration. `QInt4F32` packs two signed 4-bit values per
/// byte with a parallel f32 per-group scale array (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum DType {
    Unknown = 0,
    F32 = 1,
    I64 = 2,
    QInt4F32 = 3,
}

impl DType {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(DType::Unknown),
            1 => Some(DType::F32),
            2 => Some(DType::I64),
            3 => Some(DType::QInt4F32),
            _ => None,
        }
    }

    pub fn to_i16(self) -> i16 {
        self as i16
    }

    /// Size in bytes of one element, for dtypes with a uniform per-element
    /// size. `QInt4F32` has no well-defined per-element byte size (two
    /// values share one byte) — callers must use `TensorStorage::groupSize`
    /// accounting instead.
    pub fn elem_size(self) -> Option<usize> {
        match self {
            DType::F32 => Some(4),
            DType::I64 => Some(8),
            DType::QInt4F32 => None,
            DType::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_i16() {
        for d in [DType::Unknown, DType::F32, DType::I64, DType::QInt4F32] {
            assert_eq!(DType::from_i16(d.to_i16()), Some(d));
        }
        assert_eq!(DType::from_i16(99), None);
    }
}
