//! L6 — NN modules: `Context`-scoped parameter namespacing over the L5
//! operators. Modules don't know their own names; a `Context` built by the
//! caller carries the dotted path and parameter lookup happens by
//! constructed path (no global registry).

pub mod attention;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod swiglu;

pub use attention::{alibi_slopes, MultiheadSelfAttention, RotaryEmbedding};
pub use embedding::Embedding;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use swiglu::SwiGlu;

use crate::tensor::{Tensor, TensorMap};

/// Dotted parameter-namespace path. `child("attn")` on a context named
/// `"h.0"` yields `"h.0.attn"`; `name("weight")` on that child yields
/// `"h.0.attn.weight"`.
#[derive(Debug, Clone)]
pub struct Context {
    path: String,
}

impl Context {
    /// The empty, top-level context.
    pub fn root() -> Self {
        Self { path: String::new() }
    }

    /// A fresh context whose path is this one's path with `child` appended.
    pub fn child(&self, child: &str) -> Self {
        let path = if self.path.is_empty() {
            child.to_string()
        } else {
            format!("{}.{child}", self.path)
        };
        Self { path }
    }

    /// The fully-qualified parameter name `leaf` resolves to under this
    /// context's path.
    pub fn name(&self, leaf: &str) -> String {
        if self.path.is_empty() {
            leaf.to_string()
        } else {
            format!("{}.{leaf}", self.path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Every NN module implements `init_parameters`; `forward` is not part of
/// this trait because its signature (positional args, optional KV-cache,
/// masks) varies per module — each module exposes its own inherent
/// `forward`.
pub trait Module {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap);
}

/// Fetch a required parameter tensor by its fully-qualified name. Missing
/// parameters are a fatal load-time error per the propagation policy.
pub(crate) fn fetch<'a>(params: &'a TensorMap, name: &str) -> &'a Tensor {
    params.get(name).unwrap_or_else(|| panic!("missing parameter tensor: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_names_nest_with_dots() {
        let root = Context::root();
        assert_eq!(root.name("weight"), "weight");
        let h0 = root.child("h").child("0");
        assert_eq!(h0.path(), "h.0");
        let attn = h0.child("attn");
        assert_eq!(attn.name("weight"), "h.0.attn.weight");
    }
}
