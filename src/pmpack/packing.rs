//! Packing primitives mirroring the Goto-style packed-GEMM driver's
//! `Block`/`PackedBlock` abstractions: a strided view over a raw `f32`
//! buffer (optionally logically transposed) and a destination layout the
//! micro-kernels read directly as flat `KC×MR`/`KC×NR` panels.

/// A strided view over `f32` data: row-major (`stride` = row pitch) unless
/// `transposed`, in which case `stride` is the column pitch. Borrows
/// whatever buffer it was built from for as long as the caller keeps that
/// buffer alive — there is no lifetime tracked here, matching the raw
/// pointer arithmetic of the driver this mirrors.
#[derive(Clone, Copy)]
pub struct Block {
    data: *mut f32,
    pub stride: usize,
    pub rows: usize,
    pub cols: usize,
    pub transposed: bool,
}

impl Block {
    pub fn new(data: *mut f32, stride: usize, rows: usize, cols: usize, transposed: bool) -> Self {
        Self { data, stride, rows, cols, transposed }
    }

    /// Build a read-only view over `data`. Callers must never call `set`
    /// or `fill_zero` on the result.
    pub fn from_slice(data: &[f32], stride: usize, rows: usize, cols: usize, transposed: bool) -> Self {
        Self::new(data.as_ptr() as *mut f32, stride, rows, cols, transposed)
    }

    pub fn from_slice_mut(data: &mut [f32], stride: usize, rows: usize, cols: usize, transposed: bool) -> Self {
        Self::new(data.as_mut_ptr(), stride, rows, cols, transposed)
    }

    fn elem_offset(&self, r: usize, c: usize) -> usize {
        if self.transposed {
            r + c * self.stride
        } else {
            r * self.stride + c
        }
    }

    /// # Safety
    /// `r < self.rows`, `c < self.cols`, and the resulting offset must lie
    /// within the buffer this `Block` was constructed over.
    pub unsafe fn get(&self, r: usize, c: usize) -> f32 {
        *self.data.add(self.elem_offset(r, c))
    }

    /// # Safety
    /// Same as `get`; additionally the block must not have been built from
    /// a read-only slice via `from_slice`.
    pub unsafe fn set(&self, r: usize, c: usize, v: f32) {
        *self.data.add(self.elem_offset(r, c)) = v;
    }

    pub fn row_range(&self, row: usize, nr: usize) -> Self {
        self.range(row, 0, nr, self.cols)
    }

    pub fn col_range(&self, col: usize, nc: usize) -> Self {
        self.range(0, col, self.rows, nc)
    }

    pub fn range(&self, row: usize, col: usize, nr: usize, nc: usize) -> Self {
        debug_assert!(row + nr <= self.rows);
        debug_assert!(col + nc <= self.cols);
        // SAFETY: bounds checked above against this block's own extent.
        let data = unsafe { self.data.add(self.elem_offset(row, col)) };
        Self { data, stride: self.stride, rows: nr, cols: nc, transposed: self.transposed }
    }

    pub fn ptr(&self) -> *mut f32 {
        self.data
    }

    pub fn t(&self) -> Self {
        Self {
            data: self.data,
            stride: self.stride,
            rows: self.cols,
            cols: self.rows,
            transposed: !self.transposed,
        }
    }

    /// Copy this block's logical `rows×cols` contents into `tgt`.
    ///
    /// # Safety
    /// `self` and `tgt` must describe disjoint, valid, matching-extent
    /// memory; `tgt` must not have been built from a read-only slice.
    pub unsafe fn copy_to(&self, tgt: &Block) {
        debug_assert_eq!(self.rows, tgt.rows);
        debug_assert_eq!(self.cols, tgt.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                tgt.set(r, c, self.get(r, c));
            }
        }
    }

    /// # Safety
    /// `self` must describe valid, writable memory (not a read-only view).
    pub unsafe fn fill_zero(&self) {
        for r in 0..self.rows {
            for c in 0..self.cols {
                self.set(r, c, 0.0);
            }
        }
    }
}

// SAFETY: a Block is just a pointer + shape/stride description; the driver
// that constructs one is responsible for keeping its backing buffer alive
// and for not sharing a writable Block across threads without exclusive
// column ranges (the same discipline the GEMM driver enforces on loop 4).
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

/// Destination of a `pack()` call: `num_blocks` contiguous panels of
/// `block_rows × pack_size`, laid out back-to-back so the micro-kernel can
/// read each one as a flat `KC×MR`/`KC×NR` panel.
#[derive(Clone, Copy)]
pub struct PackedBlock {
    data: *mut f32,
    pub pack_size: usize,
    pub block_rows: usize,
    pub num_blocks: usize,
}

impl PackedBlock {
    pub fn pack_block(&self, i: usize) -> Block {
        debug_assert!(i < self.num_blocks);
        // SAFETY: i < num_blocks, each block occupies pack_size*block_rows
        // contiguous elements within the buffer `pack()` validated room for.
        let data = unsafe { self.data.add(self.pack_size * self.block_rows * i) };
        Block::new(data, self.pack_size, self.block_rows, self.pack_size, false)
    }
}

unsafe impl Send for PackedBlock {}
unsafe impl Sync for PackedBlock {}

/// Pack `src` (logically `KC×N`, `N = src.cols`), column-block by
/// column-block, into `buf` as `ceil(N / pack_size)` contiguous
/// `KC×pack_size` panels, zero-padding the final partial panel.
///
/// # Safety
/// `buf` must have room for at least
/// `src.cols.div_ceil(pack_size) * src.rows * pack_size` `f32`s and must not
/// alias `src`.
pub unsafe fn pack(src: Block, buf: *mut f32, pack_size: usize) -> PackedBlock {
    let kc = src.rows;
    let num_full = src.cols / pack_size;
    let mut tgt = PackedBlock { data: buf, pack_size, block_rows: kc, num_blocks: num_full };

    for b in 0..num_full {
        let src_block = src.col_range(b * pack_size, pack_size);
        let tgt_block = tgt.pack_block(b);
        src_block.copy_to(&tgt_block);
    }

    let rem = src.cols % pack_size;
    if rem > 0 {
        tgt.num_blocks += 1;
        let src_block = src.col_range(num_full * pack_size, rem);
        let tgt_block = tgt.pack_block(num_full);
        tgt_block.fill_zero();
        let tgt_block_rem = tgt_block.col_range(0, rem);
        src_block.copy_to(&tgt_block_rem);
    }

    tgt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_full_blocks_matches_manual_transpose() {
        // src: 3 rows x 4 cols, row-major, pack_size=2 -> 2 blocks of 3x2
        let src_data = vec![
            1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0, //
            9.0, 10.0, 11.0, 12.0,
        ];
        let src = Block::from_slice(&src_data, 4, 3, 4, false);
        let mut buf = vec![0.0f32; 3 * 4];
        let packed = unsafe { pack(src, buf.as_mut_ptr(), 2) };
        assert_eq!(packed.num_blocks, 2);
        let b0 = packed.pack_block(0);
        for r in 0..3 {
            for c in 0..2 {
                assert_eq!(unsafe { b0.get(r, c) }, src_data[r * 4 + c]);
            }
        }
        let b1 = packed.pack_block(1);
        for r in 0..3 {
            for c in 0..2 {
                assert_eq!(unsafe { b1.get(r, c) }, src_data[r * 4 + 2 + c]);
            }
        }
    }

    #[test]
    fn pack_zero_pads_partial_block() {
        // src: 2 rows x 3 cols, pack_size=2 -> one full block, one block padded to 2
        let src_data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let src = Block::from_slice(&src_data, 3, 2, 3, false);
        let mut buf = vec![1.0f32; 2 * 2 * 2];
        let packed = unsafe { pack(src, buf.as_mut_ptr(), 2) };
        assert_eq!(packed.num_blocks, 2);
        let b1 = packed.pack_block(1);
        assert_eq!(unsafe { b1.get(0, 0) }, 3.0);
        assert_eq!(unsafe { b1.get(0, 1) }, 0.0);
        assert_eq!(unsafe { b1.get(1, 0) }, 6.0);
        assert_eq!(unsafe { b1.get(1, 1) }, 0.0);
    }

    #[test]
    fn transpose_swaps_rows_cols_and_flag() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0];
        let b = Block::from_slice(&data, 2, 2, 2, false);
        let t = b.t();
        assert_eq!(t.rows, 2);
        assert_eq!(t.cols, 2);
        assert!(t.transposed);
        assert_eq!(unsafe { t.get(0, 1) }, unsafe { b.get(1, 0) });
    }
}
