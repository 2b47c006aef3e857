/// Neural network layer primitives
///
/// Building blocks for the GPT model:
/// - Causal multi-head self-attention
/// - Word and learned position embeddings
/// - SwiGLU feed-forward and top-1 mixture-of-experts
/// - LayerNorm

pub mod activations;
pub mod attention;
pub mod embeddings;
pub mod moe;
pub mod normalization;

pub use activations::{CastedLinear, SwiGLU};
pub use attention::CausalSelfAttention;
pub use embeddings::GptEmbedding;
pub use moe::MoeMlp;
pub use normalization::LayerNorm;
