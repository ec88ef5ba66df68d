//! BPE merge encoder (§4.6): a doubly-linked arena of symbols plus a
//! priority queue of adjacent-pair merge candidates, in the same spirit as
//! SentencePiece's reference encoder.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::model::BpeModel;

struct Symbol {
    token_id: i64,
    prev: Option<usize>,
    next: Option<usize>,
    alive: bool,
}

/// A candidate merge of two adjacent symbols. Ordered by ascending `cost`
/// (more negative weight first, i.e. higher-weight merges first); ties
/// break on the leftmost `left` index so that merge order is deterministic
/// regardless of queue insertion order.
struct Bigram {
    left: usize,
    right: usize,
    cost: f32,
    merged_id: i64,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.left == other.left
    }
}
impl Eq for Bigram {}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bigram {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse cost so the lowest cost (i.e.
        // highest merge weight) pops first, and on ties prefer the
        // leftmost pair.
        other.cost.partial_cmp(&self.cost).unwrap_or(Ordering::Equal).then_with(|| other.left.cmp(&self.left))
    }
}

fn try_merge(model: &BpeModel, symbols: &[Symbol], left: usize, right: usize) -> Option<Bigram> {
    let left_piece = &model.tokens[symbols[left].token_id as usize].piece;
    let right_piece = &model.tokens[symbols[right].token_id as usize].piece;
    let mut merged = Vec::with_capacity(left_piece.len() + right_piece.len());
    merged.extend_from_slice(left_piece);
    merged.extend_from_slice(right_piece);
    let merged_id = *model.piece_to_id.get(&merged)?;
    let weight = model.tokens[merged_id as usize].weight;
    Some(Bigram { left, right, cost: -weight, merged_id })
}

/// Greedily merge the byte/char sequence `seed_ids` (one symbol per initial
/// piece, already resolved to token ids by the caller) using the model's
/// merge-weight table, returning the final token id sequence.
pub fn bpe_merge(model: &BpeModel, seed_ids: &[i64]) -> Vec<i64> {
    if seed_ids.is_empty() {
        return Vec::new();
    }

    let mut symbols: Vec<Symbol> = seed_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| Symbol {
            token_id: id,
            prev: if i == 0 { None } else { Some(i - 1) },
            next: if i + 1 < seed_ids.len() { Some(i + 1) } else { None },
            alive: true,
        })
        .collect();

    let mut heap: BinaryHeap<Bigram> = BinaryHeap::new();
    for i in 0..symbols.len() - 1 {
        if let Some(bg) = try_merge(model, &symbols, i, i + 1) {
            heap.push(bg);
        }
    }

    while let Some(bg) = heap.pop() {
        if !symbols[bg.left].alive || !symbols[bg.right].alive {
            continue;
        }
        if symbols[bg.left].next != Some(bg.right) {
            continue;
        }

        symbols[bg.left].token_id = bg.merged_id;
        symbols[bg.right].alive = false;
        let right_next = symbols[bg.right].next;
        symbols[bg.left].next = right_next;
        if let Some(n) = right_next {
            symbols[n].prev = Some(bg.left);
        }

        if let Some(p) = symbols[bg.left].prev {
            if let Some(new_bg) = try_merge(model, &symbols, p, bg.left) {
                heap.push(new_bg);
            }
        }
        if let Some(n) = symbols[bg.left].next {
            if let Some(new_bg) = try_merge(model, &symbols, bg.left, n) {
                heap.push(new_bg);
            }
        }
    }

    let mut out = Vec::with_capacity(symbols.len());
    let mut cur = Some(0usize);
    while let Some(i) = cur {
        if symbols[i].alive {
            out.push(symbols[i].token_id);
        }
        cur = symbols[i].next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::model::test_support::minimal_model_bytes;
    use std::io::Cursor;

    fn build_model() -> BpeModel {
        // "he" + "llo" merge weights: "he" (5.0), "llo" (3.0), "hello" (8.0).
        let bytes = minimal_model_bytes(&[(0, b"he", b"he", 5.0), (0, b"llo", b"llo", 3.0), (0, b"hello", b"hello", 8.0)]);
        let mut cursor = Cursor::new(&bytes[..]);
        BpeModel::from_reader(&mut cursor).unwrap()
    }

    fn byte_id(model: &BpeModel, b: u8) -> i64 {
        model.byte_ids.unwrap()[b as usize]
    }

    #[test]
    fn merges_highest_weight_pairs_first_and_fully() {
        let model = build_model();
        let seed: Vec<i64> = b"hello".iter().map(|&b| byte_id(&model, b)).collect();
        let out = bpe_merge(&model, &seed);
        let hello_id = *model.piece_to_id.get(&b"hello".to_vec()).unwrap();
        assert_eq!(out, vec![hello_id]);
    }

    #[test]
    fn leaves_unmergeable_bytes_untouched() {
        let model = build_model();
        let seed: Vec<i64> = b"xyz".iter().map(|&b| byte_id(&model, b)).collect();
        let out = bpe_merge(&model, &seed);
        assert_eq!(out, seed);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let model = build_model();
        assert!(bpe_merge(&model, &[]).is_empty());
    }

    #[test]
    fn partial_match_only_merges_the_matching_pair() {
        let model = build_model();
        // "h" "e" "z" "l" "l" "o" -> "he" merges, "llo" merges, "hello" does not
        // (non-adjacent after the "z").
        let seed: Vec<i64> = b"hezllo".iter().map(|&b| byte_id(&model, b)).collect();
        let out = bpe_merge(&model, &seed);
        let he_id = *model.piece_to_id.get(&b"he".to_vec()).unwrap();
        let llo_id = *model.piece_to_id.get(&b"llo".to_vec()).unwrap();
        let z_id = byte_id(&model, b'z');
        assert_eq!(out, vec![he_id, z_id, llo_id]);
    }
}
