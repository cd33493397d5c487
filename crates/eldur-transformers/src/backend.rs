//! Compute backend seam.
//!
//! The stacks are the CPU implementation; callers that only need "run the
//! encoder" and "decode one token" hold an `Arc<dyn TransformerBackend>` and
//! never see which device executes it.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::cache::DecodeSession;
use crate::config::EngineConfig;
use crate::decoder::DecoderStack;
use crate::encoder::EncoderStack;
use crate::masks::SequenceLengths;
use crate::weights::{DecoderWeights, EncoderWeights};

// ============================================================================
//  Backend kinds
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpu,
}

impl BackendKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, BackendKind::Cpu)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
        }
    }
}

// ============================================================================
//  Trait
// ============================================================================

/// Encoder output together with the lengths that describe its valid rows, so
/// it can be handed straight to [`TransformerBackend::begin_decode`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq, hidden_dim]`
    pub hidden_states: Array3<f32>,
    pub lengths: SequenceLengths,
}

/// Shared, thread-safe entry point to a converted model.
///
/// Every method takes `&self`; the only per-call mutable state is the
/// [`DecodeSession`], which belongs to exactly one caller.
pub trait TransformerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs the encoder stack. With `zero_padding` the positions past each
    /// sequence's length are zeroed in the output.
    fn encoder_forward(
        &self,
        input: &ArrayView3<f32>,
        lengths: &SequenceLengths,
        mask: Option<&ArrayView3<f32>>,
        zero_padding: bool,
    ) -> Result<EncoderOutput>;

    /// Starts a decode session over encoder memory.
    fn begin_decode(&self, memory: &ArrayView3<f32>, memory_lengths: &SequenceLengths) -> Result<DecodeSession>;

    /// One incremental decoder step, `[batch, hidden_dim]` in and out.
    fn decoder_forward(&self, input: &ArrayView2<f32>, session: &mut DecodeSession) -> Result<Array2<f32>>;

    /// Non-incremental decoder pass over whole target sequences.
    fn decoder_forward_full(
        &self,
        input: &ArrayView3<f32>,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<Array3<f32>>;
}

// ============================================================================
//  CPU
// ============================================================================

pub struct CpuBackend {
    encoder: Option<EncoderStack>,
    decoder: Option<DecoderStack>,
}

impl CpuBackend {
    /// Converts whichever weight sets are given. At least one is required.
    pub fn new(
        config: &EngineConfig,
        encoder: Option<&EncoderWeights>,
        decoder: Option<&DecoderWeights>,
    ) -> Result<Self> {
        if encoder.is_none() && decoder.is_none() {
            return Err(anyhow!("a backend needs encoder weights, decoder weights or both"));
        }
        Ok(Self {
            encoder: encoder.map(|w| EncoderStack::new(config, w)).transpose()?,
            decoder: decoder.map(|w| DecoderStack::new(config, w)).transpose()?,
        })
    }

    pub fn encoder(&self) -> Option<&EncoderStack> {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> Option<&DecoderStack> {
        self.decoder.as_ref()
    }

    fn require_encoder(&self) -> Result<&EncoderStack> {
        self.encoder
            .as_ref()
            .ok_or_else(|| anyhow!("this backend was built without encoder weights"))
    }

    fn require_decoder(&self) -> Result<&DecoderStack> {
        self.decoder
            .as_ref()
            .ok_or_else(|| anyhow!("this backend was built without decoder weights"))
    }
}

impl TransformerBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn encoder_forward(
        &self,
        input: &ArrayView3<f32>,
        lengths: &SequenceLengths,
        mask: Option<&ArrayView3<f32>>,
        zero_padding: bool,
    ) -> Result<EncoderOutput> {
        let mut hidden_states = self.require_encoder()?.forward(input, lengths, mask)?;
        if zero_padding {
            lengths.apply_output_mask(&mut hidden_states)?;
        }
        Ok(EncoderOutput {
            hidden_states,
            lengths: lengths.clone(),
        })
    }

    fn begin_decode(&self, memory: &ArrayView3<f32>, memory_lengths: &SequenceLengths) -> Result<DecodeSession> {
        self.require_decoder()?.begin_session(memory, memory_lengths)
    }

    fn decoder_forward(&self, input: &ArrayView2<f32>, session: &mut DecodeSession) -> Result<Array2<f32>> {
        self.require_decoder()?.step(input, session)
    }

    fn decoder_forward_full(
        &self,
        input: &ArrayView3<f32>,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<Array3<f32>> {
        self.require_decoder()?.forward_full(input, memory, memory_lengths)
    }
}

/// Builds a backend of the requested kind behind a shareable handle.
pub fn create_backend(
    kind: BackendKind,
    config: &EngineConfig,
    encoder: Option<&EncoderWeights>,
    decoder: Option<&DecoderWeights>,
) -> Result<Arc<dyn TransformerBackend>> {
    let backend: Arc<dyn TransformerBackend> = match kind {
        BackendKind::Cpu => Arc::new(CpuBackend::new(config, encoder, decoder)?),
    };
    log::info!(
        "Created {} backend (encoder: {}, decoder: {})",
        kind,
        encoder.is_some(),
        decoder.is_some()
    );
    Ok(backend)
}
