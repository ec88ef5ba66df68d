//! L4 — BPE tokenizer (§4.6): loads a binary vocabulary and encodes text to
//! token ids by greedy highest-weight merging, word by word.

pub mod encoder;
pub mod model;

pub use model::{BpeModel, TokenFlag, TokenInfo};

use std::path::Path;

use crate::error::RtResult;

/// A loaded tokenizer: the vocabulary plus the whitespace-splitting policy
/// read from `RtConfig`.
pub struct Tokenizer {
    model: BpeModel,
    add_prefix_space: bool,
    split_by_unicode: bool,
}

impl Tokenizer {
    pub fn new(model: BpeModel, add_prefix_space: bool, split_by_unicode: bool) -> Self {
        Self { model, add_prefix_space, split_by_unicode }
    }

    pub fn load(path: &Path, add_prefix_space: bool, split_by_unicode: bool) -> RtResult<Self> {
        Ok(Self::new(BpeModel::load(path)?, add_prefix_space, split_by_unicode))
    }

    pub fn model(&self) -> &BpeModel {
        &self.model
    }

    /// Split `text` into words: on Unicode whitespace boundaries when
    /// `split_by_unicode` is set, otherwise on plain ASCII space only.
    /// A leading space is synthesized when `add_prefix_space` is set and
    /// the text doesn't already start with one.
    fn split_words(&self, text: &str) -> Vec<String> {
        let text = if self.add_prefix_space && !text.starts_with(' ') && !text.is_empty() {
            format!(" {text}")
        } else {
            text.to_string()
        };

        let mut words = Vec::new();
        let mut cur = String::new();
        for c in text.chars() {
            let is_boundary = if self.split_by_unicode { c.is_whitespace() } else { c == ' ' };
            if is_boundary {
                if !cur.is_empty() {
                    words.push(std::mem::take(&mut cur));
                }
                words.push(c.to_string());
            } else {
                cur.push(c);
            }
        }
        if !cur.is_empty() {
            words.push(cur);
        }
        words
    }

    /// Map one word's raw bytes to their seed token ids: a byte-fallback
    /// token if the model carries one, else a single-byte piece lookup,
    /// else the unknown token.
    fn seed_ids(&self, word: &str) -> Vec<i64> {
        word.bytes()
            .map(|b| {
                if let Some(table) = &self.model.byte_ids {
                    table[b as usize]
                } else if let Some(&id) = self.model.piece_to_id.get(&vec![b]) {
                    id
                } else {
                    self.model.unknown_id
                }
            })
            .collect()
    }

    /// Encode `text` into a sequence of token ids.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let mut out = Vec::new();
        for word in self.split_words(text) {
            let seeds = self.seed_ids(&word);
            out.extend(encoder::bpe_merge(&self.model, &seeds));
        }
        out
    }

    /// Decode a sequence of token ids back to text, concatenating each
    /// token's display bytes. Lossy for ids outside the vocabulary (they
    /// contribute nothing).
    pub fn decode(&self, ids: &[i64]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if let Some(tok) = self.model.tokens.get(id as usize) {
                bytes.extend_from_slice(&tok.display);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::model::test_support::minimal_model_bytes;
    use super::*;
    use std::io::Cursor;

    fn build_tokenizer(add_prefix_space: bool) -> Tokenizer {
        let bytes = minimal_model_bytes(&[(0, b"he", b"he", 5.0), (0, b"llo", b"llo", 3.0), (0, b"hello", b"hello", 8.0)]);
        let mut cursor = Cursor::new(&bytes[..]);
        let model = BpeModel::from_reader(&mut cursor).unwrap();
        Tokenizer::new(model, add_prefix_space, true)
    }

    #[test]
    fn encodes_single_word_to_merged_token() {
        let tok = build_tokenizer(false);
        let ids = tok.encode("hello");
        let hello_id = *tok.model().piece_to_id.get(&b"hello".to_vec()).unwrap();
        assert_eq!(ids, vec![hello_id]);
    }

    #[test]
    fn encode_then_decode_round_trips_bytes() {
        let tok = build_tokenizer(false);
        let ids = tok.encode("hello");
        assert_eq!(tok.decode(&ids), "hello");
    }

    #[test]
    fn prefix_space_is_added_once() {
        let tok = build_tokenizer(true);
        let words = tok.split_words("hello");
        assert_eq!(words[0], " ");
    }

    #[test]
    fn splits_on_whitespace_boundaries() {
        let tok = build_tokenizer(false);
        let words = tok.split_words("he llo");
        assert_eq!(words, vec!["he".to_string(), " ".to_string(), "llo".to_string()]);
    }
}
