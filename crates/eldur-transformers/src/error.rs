//! Typed precondition errors raised by the engine.
//!
//! Everything in the crate returns `anyhow::Result`. The variants below are
//! the failures a caller is expected to match on; recover them from an
//! `anyhow::Error` with [`EngineError::find`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A declared valid length is <= 0 or exceeds the padded length.
    #[error("invalid sequence length {length} at batch index {index} (max_seq_len={max_seq_len})")]
    InvalidLength {
        index: usize,
        length: i64,
        max_seq_len: usize,
    },

    /// `head_num * head_size` disagrees with `hidden_dim`, or a tensor has
    /// the wrong shape for the configured model.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Quantization mode outside {0, 1, 2, 3}.
    #[error("unsupported int8 mode {0}, expected one of 0, 1, 2, 3")]
    UnsupportedMode(i64),

    /// A decode session mixed cache layouts or ran past its capacity.
    #[error("cache layout error: {0}")]
    CacheLayout(String),
}

impl EngineError {
    /// Finds the typed engine error inside an `anyhow` chain, if any.
    pub fn find(err: &anyhow::Error) -> Option<&EngineError> {
        err.chain().find_map(|cause| cause.downcast_ref::<EngineError>())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        EngineError::ShapeMismatch(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        EngineError::CacheLayout(msg.into())
    }
}
