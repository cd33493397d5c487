//! Eldur: CPU execution engine for encoder/decoder transformer layer stacks
//!
//! Batched multi-head self- and cross-attention, feed-forward blocks, an
//! encoder path that can drop padding before compute, and an incremental
//! decode cache for autoregressive decoders. Weights are converted once to
//! the configured precision (full, half or int8) when a stack is built.

pub mod activations;
pub mod attention;
pub mod backend;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod feedforward;
pub mod linear_layer;
pub mod masks;
pub mod normalization;
pub mod ops;
pub mod quantize;
pub mod tensor;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    activations::Activation,
    attention::MultiHeadAttention,
    backend::{create_backend, BackendKind, CpuBackend, EncoderOutput, TransformerBackend},
    cache::{CacheLayout, DecodeSession},
    compaction::CompactedBatch,
    config::EngineConfig,
    decoder::DecoderStack,
    encoder::EncoderStack,
    error::EngineError,
    feedforward::FeedForward,
    masks::SequenceLengths,
    normalization::{LayerNorm, NormPlacement},
    quantize::{Int8Mode, Precision, WeightConversion},
    weights::{DecoderWeights, EncoderWeights},
};

pub mod prelude {
    pub use crate::backend::{create_backend, BackendKind, TransformerBackend};
    pub use crate::config::EngineConfig;
    pub use crate::masks::SequenceLengths;
    pub use crate::weights::{DecoderWeights, EncoderWeights};
}

#[cfg(test)]
pub mod tests;
