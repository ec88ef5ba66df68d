//! Parameter/tensor file format (§6): a stream of `TNSR` records (used for
//! both standalone tensor streams and, wrapped in a `TDIC` dictionary, the
//! parameter files `nn::Module::init_parameters` consumes). Files are
//! opened via `memmap2` and parsed with `byteorder`, mirroring
//! `examples/imonoonoko-Bit-TTT-Engine/crates/bit_llama/src/loader.rs`'s
//! `File::open` + `Mmap::map` pairing.
//!
//! `QInt4F32` records are not fully specified by the distilled format — it
//! names a trailing scale array of length `numel / groupSize` but never
//! says where `groupSize` itself is read from. This reader resolves that
//! gap by writing/reading an explicit `int32 groupSize` field between the
//! packed bytes and the scale array (see DESIGN.md).

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::error::{RtError, RtResult};
use crate::tensor::{DType, Tensor, TensorMap};

const MAX_RANK: usize = 8;
const TRAILING_MAGIC: i16 = 0x55aa;

fn read_magic<R: Read>(r: &mut R, expected: &[u8; 4]) -> RtResult<()> {
    let mut magic = [0u8; 4];
    match r.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(RtError::OutOfRange),
        Err(e) => return Err(RtError::Io(e)),
    }
    if &magic != expected {
        return Err(RtError::aborted(format!(
            "expected magic {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&magic)
        )));
    }
    Ok(())
}

/// Read one `TNSR` record. Returns `Err(RtError::OutOfRange)` at a clean
/// end-of-stream (no bytes available where a record would start) — the
/// canonical termination signal for streaming readers.
pub fn read_tensor<R: Read>(r: &mut R) -> RtResult<Tensor> {
    read_magic(r, b"TNSR")?;

    let rank = r.read_i16::<LittleEndian>()?;
    if !(0..=MAX_RANK as i16).contains(&rank) {
        return Err(RtError::aborted(format!("read_tensor: rank {rank} out of range")));
    }
    let dtype_raw = r.read_i16::<LittleEndian>()?;
    let dtype = DType::from_i16(dtype_raw).ok_or_else(|| RtError::aborted(format!("read_tensor: unknown dtype {dtype_raw}")))?;

    let mut shape = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        shape.push(r.read_i32::<LittleEndian>()? as i64);
    }
    let numel = shape.iter().product::<i64>().max(0) as usize;

    match dtype {
        DType::F32 => {
            let mut data = vec![0f32; numel];
            r.read_f32_into::<LittleEndian>(&mut data)?;
            Ok(Tensor::from_f32_vec(&shape, data))
        }
        DType::I64 => {
            let mut data = vec![0i64; numel];
            r.read_i64_into::<LittleEndian>(&mut data)?;
            Ok(Tensor::from_i64_vec(&shape, data))
        }
        DType::QInt4F32 => {
            let mut packed = vec![0u8; numel.div_ceil(2)];
            r.read_exact(&mut packed)?;
            let group_size = r.read_i32::<LittleEndian>()? as usize;
            if group_size == 0 || group_size % 2 != 0 || numel % group_size != 0 {
                return Err(RtError::aborted(format!("read_tensor: invalid group_size {group_size} for numel {numel}")));
            }
            let mut scales = vec![0f32; numel / group_size];
            r.read_f32_into::<LittleEndian>(&mut scales)?;
            Ok(Tensor::qint4(&shape, packed, scales, group_size))
        }
        DType::Unknown => Err(RtError::aborted("read_tensor: cannot materialize an Unknown-dtype tensor")),
    }
}

/// Write one `TNSR` record (the reader's paired writer; used by tests and
/// by any tooling that produces parameter files).
pub fn write_tensor<W: Write>(w: &mut W, t: &Tensor) -> RtResult<()> {
    let t = t.contiguous();
    w.write_all(b"TNSR")?;
    w.write_i16::<LittleEndian>(t.rank() as i16)?;
    w.write_i16::<LittleEndian>(t.dtype().to_i16())?;
    for &d in &t.dims() {
        w.write_i32::<LittleEndian>(d as i32)?;
    }
    match t.dtype() {
        DType::F32 => {
            for &v in t.raw_f32() {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        DType::I64 => {
            for &v in t.raw_i64() {
                w.write_i64::<LittleEndian>(v)?;
            }
        }
        DType::QInt4F32 => {
            let q = t.storage().as_qint4();
            w.write_all(q.packed.as_slice())?;
            w.write_i32::<LittleEndian>(q.group_size as i32)?;
            for &s in q.scales.as_slice() {
                w.write_f32::<LittleEndian>(s)?;
            }
        }
        DType::Unknown => return Err(RtError::aborted("write_tensor: cannot write an Unknown-dtype tensor")),
    }
    Ok(())
}

/// Read a `TDIC`-framed parameter dictionary: `numRecords` `(name, tensor)`
/// pairs followed by a trailing `0x55aa` sentinel.
pub fn read_tensor_map<R: Read>(r: &mut R) -> RtResult<TensorMap> {
    read_magic(r, b"TDIC")?;
    let count = r.read_i32::<LittleEndian>()?;
    if count < 0 {
        return Err(RtError::aborted(format!("read_tensor_map: negative record count {count}")));
    }
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = r.read_i16::<LittleEndian>()?;
        if name_len < 0 {
            return Err(RtError::aborted(format!("read_tensor_map: negative name length {name_len}")));
        }
        let mut name_bytes = vec![0u8; name_len as usize];
        r.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).map_err(|e| RtError::aborted(format!("read_tensor_map: name is not valid UTF-8: {e}")))?;
        let tensor = read_tensor(r)?;
        map.insert(name, tensor);
    }
    let trailing = r.read_i16::<LittleEndian>()?;
    if trailing != TRAILING_MAGIC {
        return Err(RtError::aborted(format!("read_tensor_map: bad trailing magic 0x{trailing:04x}")));
    }
    Ok(map)
}

/// Write a `TDIC`-framed parameter dictionary. Record order follows
/// whatever iteration order `map` yields — callers needing a reproducible
/// byte-for-byte file should pass an iteration-stable map.
pub fn write_tensor_map<W: Write>(w: &mut W, map: &TensorMap) -> RtResult<()> {
    w.write_all(b"TDIC")?;
    w.write_i32::<LittleEndian>(map.len() as i32)?;
    for (name, tensor) in map {
        w.write_i16::<LittleEndian>(name.len() as i16)?;
        w.write_all(name.as_bytes())?;
        write_tensor(w, tensor)?;
    }
    w.write_i16::<LittleEndian>(TRAILING_MAGIC)?;
    Ok(())
}

/// Memory-map `path` and parse it as a `TDIC` parameter dictionary in one
/// shot. Keeps the mapping and the file handle alive only for the
/// duration of the parse.
pub fn load_params_file(path: &Path) -> RtResult<TensorMap> {
    let file = File::open(path)?;
    // SAFETY: the file is not expected to be concurrently truncated or
    // modified while mapped; this mirrors BitLoader's mmap usage.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut cursor = Cursor::new(&mmap[..]);
    read_tensor_map(&mut cursor)
}
