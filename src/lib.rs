//! llmpp_rt
//!
//! CPU-only inference runtime for decoder-style transformer language
//! models (GPT-2, BLOOM, ChatGLM-2) plus a BPE tokenizer. Single-threaded
//! cooperative API; parallelism is confined to the packed GEMM driver's
//! inner loop via a `rayon` thread pool sized from `runtime::set_num_threads`.

pub mod config;
pub mod device_utils;
pub mod error;
pub mod kernels;
pub mod model;
pub mod nn;
pub mod ops;
pub mod params;
pub mod pmpack;
pub mod runtime;
pub mod tensor;
pub mod tokenizer;

pub use config::RtConfig;
pub use error::{RtError, RtResult};
pub use model::{BloomModel, ChatGlm2Model, Gpt2Model};
pub use pmpack::PMPack;
pub use tensor::{DType, Tensor, TensorMap};
pub use tokenizer::{BpeModel, Tokenizer};
