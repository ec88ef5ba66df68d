//! L7 — model composition: GPT-2 (learned positions, GELU MLP), BLOOM
//! (ALiBi, GELU MLP) and ChatGLM-2 (MQA, half-dim RoPE, SwiGLU MLP), all
//! built from the shared `nn::` modules.

pub mod bloom;
pub mod chatglm2;
pub mod gpt2;

pub use bloom::BloomModel;
pub use chatglm2::ChatGlm2Model;
pub use gpt2::Gpt2Model;
