//! Ambient configuration: `RtConfig` mirrors the INI keys the distilled
//! spec's `[model]`/`[tokenizer]`/model-specific sections carry. The `.ini`
//! lexer itself is out of scope — callers hand this a pre-parsed key-value
//! map (e.g. from the `ini` crate or a hand-rolled reader) plus the
//! directory relative paths resolve against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RtError, RtResult};

/// One fully-resolved model/tokenizer configuration. `n_kv_head`/`rotary_dim`
/// are `None` for GPT-2/BLOOM (plain MHA, no RoPE) and `Some` for
/// ChatGLM-2 (MQA, half-dim RoPE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtConfig {
    pub params_file: PathBuf,
    pub model_type: String,
    pub add_prefix_space: bool,
    pub split_by_unicode: bool,
    pub model_file: PathBuf,
    pub n_embd: i64,
    pub n_ctx: i64,
    pub n_inner: i64,
    pub n_head: i64,
    pub n_layer: i64,
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub n_kv_head: Option<i64>,
    pub rotary_dim: Option<i64>,
}

impl RtConfig {
    /// Build from a flat key-value map (one INI section's worth of keys,
    /// already merged by the caller). `base_dir` is the directory relative
    /// paths (`params_file`, `model_file`) resolve against — typically the
    /// `.ini` file's own directory.
    pub fn from_map(base_dir: &Path, map: &HashMap<String, String>) -> RtResult<Self> {
        let get = |key: &str| -> RtResult<&str> {
            map.get(key).map(String::as_str).ok_or_else(|| RtError::aborted(format!("config: missing key '{key}'")))
        };
        let get_bool = |key: &str, default: bool| -> RtResult<bool> {
            match map.get(key) {
                Some(v) => v.parse::<bool>().map_err(|_| RtError::aborted(format!("config: '{key}' is not a bool: {v}"))),
                None => Ok(default),
            }
        };
        let get_i64 = |key: &str| -> RtResult<i64> {
            get(key)?.parse::<i64>().map_err(|_| RtError::aborted(format!("config: '{key}' is not an integer")))
        };
        let get_opt_i64 = |key: &str| -> RtResult<Option<i64>> {
            match map.get(key) {
                Some(v) => v
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| RtError::aborted(format!("config: '{key}' is not an integer: {v}"))),
                None => Ok(None),
            }
        };
        let resolve = |key: &str| -> RtResult<PathBuf> {
            let raw = get(key)?;
            let p = Path::new(raw);
            Ok(if p.is_absolute() { p.to_path_buf() } else { base_dir.join(p) })
        };

        Ok(Self {
            params_file: resolve("params_file")?,
            model_type: get("type")?.to_string(),
            add_prefix_space: get_bool("add_prefix_space", false)?,
            split_by_unicode: get_bool("split_by_unicode", true)?,
            model_file: resolve("model_file")?,
            n_embd: get_i64("n_embd")?,
            n_ctx: get_i64("n_ctx")?,
            n_inner: get_i64("n_inner")?,
            n_head: get_i64("n_head")?,
            n_layer: get_i64("n_layer")?,
            vocab_size: get_i64("vocab_size")?,
            hidden_size: get_i64("hidden_size")?,
            n_kv_head: get_opt_i64("n_kv_head")?,
            rotary_dim: get_opt_i64("rotary_dim")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("params_file".to_string(), "gpt2.params.bin".to_string());
        m.insert("type".to_string(), "gpt2".to_string());
        m.insert("model_file".to_string(), "gpt2.bpe".to_string());
        m.insert("n_embd".to_string(), "768".to_string());
        m.insert("n_ctx".to_string(), "1024".to_string());
        m.insert("n_inner".to_string(), "3072".to_string());
        m.insert("n_head".to_string(), "12".to_string());
        m.insert("n_layer".to_string(), "12".to_string());
        m.insert("vocab_size".to_string(), "50257".to_string());
        m.insert("hidden_size".to_string(), "768".to_string());
        m
    }

    #[test]
    fn resolves_relative_paths_against_base_dir() {
        let cfg = RtConfig::from_map(Path::new("/models/gpt2"), &base_map()).unwrap();
        assert_eq!(cfg.params_file, PathBuf::from("/models/gpt2/gpt2.params.bin"));
        assert_eq!(cfg.n_kv_head, None);
    }

    #[test]
    fn missing_required_key_is_aborted() {
        let mut m = base_map();
        m.remove("n_head");
        let err = RtConfig::from_map(Path::new("."), &m);
        assert!(err.is_err());
    }

    #[test]
    fn optional_kv_head_and_rotary_dim_parse_when_present() {
        let mut m = base_map();
        m.insert("n_kv_head".to_string(), "2".to_string());
        m.insert("rotary_dim".to_string(), "32".to_string());
        let cfg = RtConfig::from_map(Path::new("."), &m).unwrap();
        assert_eq!(cfg.n_kv_head, Some(2));
        assert_eq!(cfg.rotary_dim, Some(32));
    }
}
