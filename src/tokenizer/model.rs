//! BPE model binary file format (§4.6): `"LLsp"` magic, `0x55aa` framing
//! sentinels, a flat token table with per-token flag/piece/display/weight.
//! `flag` is a bitset (`Unknown=1, Control=2, Byte=4, Unused=8`), not an
//! exclusive value — classify it with bitwise masks, not equality.
//!
//! The vocabulary's `groupSize`-style underspecification doesn't apply
//! here, but the format does leave how byte-fallback tokens map to byte
//! values implicit — resolved the same way real SentencePiece-derived
//! vocabularies do it: a `Byte` token's piece is the single raw byte it
//! represents.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::error::{RtError, RtResult};

const MAGIC: i16 = 0x55aa;

/// `flag`'s bit values — a token may carry any combination, though in
/// practice an exported vocabulary sets at most one.
const FLAG_UNKNOWN: i8 = 1;
const FLAG_CONTROL: i8 = 2;
const FLAG_BYTE: i8 = 4;
const FLAG_UNUSED: i8 = 8;

/// SentencePiece's word-boundary marker, U+2581 "▁".
const SPM_UNDERSCORE: [u8; 3] = [0xe2, 0x96, 0x81];

/// A token's flag bits, read as a raw `i8` bitset (not an exclusive enum —
/// the four bit values combine independently).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFlag(i8);

impl TokenFlag {
    fn from_i8(v: i8) -> Self {
        TokenFlag(v)
    }

    pub fn raw(self) -> i8 {
        self.0
    }

    pub fn is_normal(self) -> bool {
        self.0 == 0
    }

    pub fn is_unknown(self) -> bool {
        self.0 & FLAG_UNKNOWN != 0
    }

    pub fn is_control(self) -> bool {
        self.0 & FLAG_CONTROL != 0
    }

    pub fn is_byte(self) -> bool {
        self.0 & FLAG_BYTE != 0
    }

    pub fn is_unused(self) -> bool {
        self.0 & FLAG_UNUSED != 0
    }

    /// Any flag bit set at all (Unknown, Control, Byte or Unused).
    pub fn is_special(self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub flag: TokenFlag,
    pub piece: Vec<u8>,
    pub display: Vec<u8>,
    pub weight: f32,
}

/// A loaded BPE vocabulary: the token table plus the indices the encoder
/// needs (piece -> id, the unknown id, the space id, and the byte-value ->
/// id table when byte-fallback tokens are present).
pub struct BpeModel {
    pub tokens: Vec<TokenInfo>,
    pub piece_to_id: HashMap<Vec<u8>, i64>,
    pub unknown_id: i64,
    pub space_id: i64,
    pub byte_ids: Option<[i64; 256]>,
}

fn read_record<R: Read>(r: &mut R) -> RtResult<TokenInfo> {
    let flag = TokenFlag::from_i8(r.read_i8()?);
    let n_piece = r.read_u8()? as usize;
    let mut piece = vec![0u8; n_piece];
    r.read_exact(&mut piece)?;
    let n_display = r.read_u8()? as usize;
    let mut display = vec![0u8; n_display];
    r.read_exact(&mut display)?;
    let weight = r.read_f32::<LittleEndian>()?;
    Ok(TokenInfo { flag, piece, display, weight })
}

impl BpeModel {
    pub fn from_reader<R: Read>(r: &mut R) -> RtResult<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != b"LLsp" {
            return Err(RtError::aborted(format!("bpe model: bad magic {:?}", String::from_utf8_lossy(&magic))));
        }
        let num_tokens = r.read_i32::<LittleEndian>()?;
        if num_tokens < 0 {
            return Err(RtError::aborted(format!("bpe model: negative token count {num_tokens}")));
        }
        let header_magic = r.read_i16::<LittleEndian>()?;
        if header_magic != MAGIC {
            return Err(RtError::aborted(format!("bpe model: bad header magic 0x{header_magic:04x}")));
        }

        let mut tokens = Vec::with_capacity(num_tokens as usize);
        for _ in 0..num_tokens {
            tokens.push(read_record(r)?);
        }

        let trailing_magic = r.read_i16::<LittleEndian>()?;
        if trailing_magic != MAGIC {
            return Err(RtError::aborted(format!("bpe model: bad trailing magic 0x{trailing_magic:04x}")));
        }

        let mut piece_to_id = HashMap::with_capacity(tokens.len());
        for (id, t) in tokens.iter().enumerate() {
            piece_to_id.insert(t.piece.clone(), id as i64);
        }

        let unknown_id = tokens
            .iter()
            .position(|t| t.flag.is_unknown())
            .ok_or_else(|| RtError::aborted("bpe model: no Unknown token present"))? as i64;

        // The space/word-boundary marker: a literal ASCII space for most
        // exported vocabularies, or SentencePiece's U+2581 "▁" underscore
        // (0xE2 0x96 0x81) for models converted straight from an SPM model.
        let space_id = *piece_to_id
            .get(&b" ".to_vec())
            .or_else(|| piece_to_id.get(&SPM_UNDERSCORE.to_vec()))
            .ok_or_else(|| RtError::aborted("bpe model: no space or underscore token present"))?;

        let byte_token_ids: Vec<usize> = tokens.iter().enumerate().filter(|(_, t)| t.flag.is_byte()).map(|(id, _)| id).collect();
        let byte_ids = if byte_token_ids.is_empty() {
            None
        } else {
            let mut table = [-1i64; 256];
            for id in byte_token_ids {
                let piece = &tokens[id].piece;
                if piece.len() != 1 {
                    return Err(RtError::aborted(format!("bpe model: Byte token {id} has a non-single-byte piece")));
                }
                table[piece[0] as usize] = id as i64;
            }
            if table.iter().any(|&id| id < 0) {
                return Err(RtError::aborted("bpe model: Byte flag present but not all 256 byte values are covered"));
            }
            Some(table)
        };

        Ok(Self { tokens, piece_to_id, unknown_id, space_id, byte_ids })
    }

    /// Memory-map `path` and parse it in one shot.
    pub fn load(path: &Path) -> RtResult<Self> {
        let file = File::open(path)?;
        // SAFETY: mirrors the read-only mmap usage in params.rs/BitLoader;
        // the file is not expected to be modified while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        let mut cursor = Cursor::new(&mmap[..]);
        Self::from_reader(&mut cursor)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn loads_minimal_valid_model() {
        let bytes = minimal_model_bytes(&[(0, b"he", b"he", 5.0), (0, b"llo", b"llo", 3.0)]);
        let mut cursor = Cursor::new(&bytes[..]);
        let model = BpeModel::from_reader(&mut cursor).unwrap();
        assert!(model.tokens[model.unknown_id as usize].flag.is_unknown());
        assert_eq!(model.space_id, model.tokens.iter().position(|t| t.piece == b" ").unwrap() as i64);
        assert!(model.byte_ids.is_some());
    }

    #[test]
    fn byte_flag_is_a_bit_not_an_exclusive_value() {
        // A token carrying both the Unknown and Byte bits (flag = 5) must
        // still be recognized as a byte token, the way `flag & kByte` would
        // in the original loader.
        let combined = TokenFlag::from_i8(FLAG_UNKNOWN | FLAG_BYTE);
        assert!(combined.is_unknown());
        assert!(combined.is_byte());
        assert!(!TokenFlag::from_i8(FLAG_CONTROL).is_byte());
    }

    #[test]
    fn accepts_spm_underscore_in_place_of_literal_space() {
        let mut records = Vec::new();
        write_record(&mut records, FLAG_UNKNOWN, b"<unk>", b"<unk>", 0.0);
        write_record(&mut records, 0, &SPM_UNDERSCORE, " ".as_bytes(), 0.0);
        let mut out = Vec::new();
        out.extend_from_slice(b"LLsp");
        out.extend_from_slice(&2i32.to_le_bytes());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&records);
        out.extend_from_slice(&MAGIC.to_le_bytes());

        let mut cursor = Cursor::new(&out[..]);
        let model = BpeModel::from_reader(&mut cursor).unwrap();
        assert_eq!(model.space_id, 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_model_bytes(&[]);
        bytes[0] = b'X';
        let mut cursor = Cursor::new(&bytes[..]);
        assert!(BpeModel::from_reader(&mut cursor).is_err());
    }

    #[test]
    fn rejects_missing_unknown_token() {
        // Build a model with no Unknown-flagged token at all.
        let mut records = Vec::new();
        write_record(&mut records, 0, b" ", b" ", 0.0);
        let mut out = Vec::new();
        out.extend_from_slice(b"LLsp");
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&records);
        out.extend_from_slice(&MAGIC.to_le_bytes());

        let mut cursor = Cursor::new(&out[..]);
        assert!(BpeModel::from_reader(&mut cursor).is_err());
    }

    #[test]
    fn rejects_incomplete_byte_coverage() {
        let mut records = Vec::new();
        write_record(&mut records, FLAG_UNKNOWN, b"<unk>", b"<unk>", 0.0);
        write_record(&mut records, 0, b" ", b" ", 0.0);
        write_record(&mut records, FLAG_BYTE, &[0u8], &[0u8], -1.0); // only byte 0, not all 256
        let mut out = Vec::new();
        out.extend_from_slice(b"LLsp");
        out.extend_from_slice(&3i32.to_le_bytes());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&records);
        out.extend_from_slice(&MAGIC.to_le_bytes());

        let mut cursor = Cursor::new(&out[..]);
        assert!(BpeModel::from_reader(&mut cursor).is_err());
    }
}
