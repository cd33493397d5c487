//! Decoder stack: causal self-attention, cross-attention over encoder memory
//! and feed-forward, run either one token at a time against a
//! [`DecodeSession`] or over a whole target sequence at once.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use rayon::prelude::*;

use crate::attention::MultiHeadAttention;
use crate::cache::{CacheLayout, CrossAttentionCache, DecodeSession, SelfAttentionCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::feedforward::FeedForwardBlock;
use crate::masks::SequenceLengths;
use crate::normalization::{LayerNorm, NormPlacement};
use crate::quantize::WeightConversion;
use crate::weights::{DecoderLayerWeights, DecoderWeights};

pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    self_attention_norm: LayerNorm,
    cross_attention: MultiHeadAttention,
    cross_attention_norm: LayerNorm,
    feed_forward: FeedForwardBlock,
    placement: NormPlacement,
}

impl DecoderLayer {
    pub fn new(
        weights: &DecoderLayerWeights,
        config: &EngineConfig,
        conversion: &WeightConversion,
    ) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attention: MultiHeadAttention::new(
                &weights.self_attention,
                config.head_num,
                config.head_size,
                config.hidden_dim,
                config.hidden_dim,
                conversion,
            )?,
            self_attention_norm: weights.self_attention_norm.to_layer_norm(eps),
            cross_attention: MultiHeadAttention::new(
                &weights.cross_attention,
                config.head_num,
                config.head_size,
                config.hidden_dim,
                config.memory_hidden_dim(),
                conversion,
            )?,
            cross_attention_norm: weights.cross_attention_norm.to_layer_norm(eps),
            feed_forward: FeedForwardBlock::new(
                &weights.feed_forward,
                &weights.feed_forward_norm,
                config.activation,
                config.decoder_norm,
                eps,
                conversion,
            )?,
            placement: config.decoder_norm,
        })
    }

    pub fn cross_attention(&self) -> &MultiHeadAttention {
        &self.cross_attention
    }

    /// One new token per batch entry, `hidden` is `[batch, hidden_dim]`.
    pub fn forward_step(
        &self,
        hidden: Array2<f32>,
        self_cache: &mut SelfAttentionCache,
        memory: &CrossAttentionCache,
        memory_mask: &ArrayView2<f32>,
        position: usize,
    ) -> Result<Array2<f32>> {
        let batch = hidden.nrows();
        let hidden = self.placement.residual(&self.self_attention_norm, hidden, |x| {
            self.self_attention.forward_decode_step(x, self_cache, position)
        })?;
        let hidden = self.placement.residual(&self.cross_attention_norm, hidden, |x| {
            self.cross_attention.forward_cross(x, batch, 1, memory, memory_mask)
        })?;
        self.feed_forward.forward(hidden)
    }

    /// Whole target sequences at once, `hidden` is `[batch * seq, hidden_dim]`
    /// and `self_mask` the causal `[batch, seq, seq]` mask.
    pub fn forward_full(
        &self,
        hidden: Array2<f32>,
        batch: usize,
        seq: usize,
        self_mask: &ArrayView3<f32>,
        memory: &CrossAttentionCache,
        memory_mask: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let hidden = self.placement.residual(&self.self_attention_norm, hidden, |x| {
            self.self_attention.forward_padded(x, batch, seq, self_mask, None)
        })?;
        let hidden = self.placement.residual(&self.cross_attention_norm, hidden, |x| {
            self.cross_attention.forward_cross(x, batch, seq, memory, memory_mask)
        })?;
        self.feed_forward.forward(hidden)
    }
}

pub struct DecoderStack {
    layers: Vec<DecoderLayer>,
    head_num: usize,
    head_size: usize,
    hidden_dim: usize,
    memory_hidden_dim: usize,
    max_seq_len: usize,
    max_decode_len: usize,
    layout: CacheLayout,
}

impl DecoderStack {
    pub fn new(config: &EngineConfig, weights: &DecoderWeights) -> Result<Self> {
        config.validate()?;
        weights.validate(config.hidden_dim, config.memory_hidden_dim())?;
        if weights.layers.len() != config.layer_num {
            return Err(EngineError::shape(format!(
                "config expects {} decoder layers, weights have {}",
                config.layer_num,
                weights.layers.len()
            ))
            .into());
        }

        let conversion = config.weight_conversion();
        let layers = weights
            .layers
            .iter()
            .map(|w| DecoderLayer::new(w, config, &conversion))
            .collect::<Result<Vec<_>>>()?;
        let layout = config.cache_layout();
        if config.batch_major_cache && !layout.is_batch_major() {
            log::warn!(
                "head_size {} is not a multiple of {}; using the default cache layout",
                config.head_size,
                CacheLayout::alignment(config.precision)
            );
        }

        log::info!(
            "Built decoder stack: {} layers, hidden_dim={}, memory_hidden_dim={}, precision={:?}, int8 mode {}, cache {:?}",
            layers.len(),
            config.hidden_dim,
            config.memory_hidden_dim(),
            config.precision,
            config.int8_mode,
            layout
        );

        Ok(Self {
            layers,
            head_num: config.head_num,
            head_size: config.head_size,
            hidden_dim: config.hidden_dim,
            memory_hidden_dim: config.memory_hidden_dim(),
            max_seq_len: config.max_seq_len,
            max_decode_len: config.max_decode_len,
            layout,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn max_decode_len(&self) -> usize {
        self.max_decode_len
    }

    /// Checks `[batch, mem_len, memory_hidden_dim]` against the lengths and
    /// projects it into per-layer cross-attention K/V.
    fn project_memory(
        &self,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<Vec<CrossAttentionCache>> {
        let (batch, mem_len, width) = memory.dim();
        if batch != memory_lengths.batch_size()
            || mem_len != memory_lengths.max_seq_len()
            || width != self.memory_hidden_dim
        {
            return Err(EngineError::shape(format!(
                "encoder memory has shape {:?}, expected [{}, {}, {}]",
                memory.shape(),
                memory_lengths.batch_size(),
                memory_lengths.max_seq_len(),
                self.memory_hidden_dim
            ))
            .into());
        }
        if mem_len > self.max_seq_len {
            return Err(EngineError::shape(format!(
                "encoder memory length {} exceeds max_seq_len {}",
                mem_len, self.max_seq_len
            ))
            .into());
        }

        let flat = memory.to_owned().into_shape_with_order((batch * mem_len, width))?;
        self.layers
            .par_iter()
            .map(|layer| layer.cross_attention().project_memory_kv(&flat.view(), batch, mem_len))
            .collect()
    }

    fn allocate_self_caches(&self, batch: usize) -> Vec<SelfAttentionCache> {
        (0..self.layers.len())
            .map(|_| {
                SelfAttentionCache::new(
                    self.layout,
                    batch,
                    self.head_num,
                    self.head_size,
                    self.max_decode_len,
                )
            })
            .collect()
    }

    /// Starts a decode session over `memory` (`[batch, mem_len,
    /// memory_hidden_dim]`). Cross-attention K/V are computed here, once, and
    /// every self-attention arena is allocated for `max_decode_len` steps.
    pub fn begin_session(
        &self,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<DecodeSession> {
        let cross = self.project_memory(memory, memory_lengths)?;
        let batch = memory_lengths.batch_size();
        log::debug!(
            "Decode session: batch={}, memory_len={}, capacity={}, layout={:?}",
            batch,
            memory_lengths.max_seq_len(),
            self.max_decode_len,
            self.layout
        );
        Ok(DecodeSession::new(
            self.layout,
            self.allocate_self_caches(batch),
            cross,
            memory_lengths.memory_mask(),
            self.max_decode_len,
        ))
    }

    /// Points an existing session at new encoder memory and rewinds it to
    /// occupancy 0. The self-attention arenas are reused when the batch size
    /// is unchanged.
    pub fn restart_session(
        &self,
        session: &mut DecodeSession,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<()> {
        self.check_session(session)?;
        let cross = self.project_memory(memory, memory_lengths)?;
        if session.batch_size() == memory_lengths.batch_size() {
            session.replace_memory(cross, memory_lengths.memory_mask());
        } else {
            *session = DecodeSession::new(
                self.layout,
                self.allocate_self_caches(memory_lengths.batch_size()),
                cross,
                memory_lengths.memory_mask(),
                self.max_decode_len,
            );
        }
        Ok(())
    }

    fn check_session(&self, session: &DecodeSession) -> Result<()> {
        if session.layout() != self.layout {
            return Err(EngineError::cache(format!(
                "session uses {:?} but this decoder is configured for {:?}",
                session.layout(),
                self.layout
            ))
            .into());
        }
        if session.num_layers() != self.layers.len() {
            return Err(EngineError::cache(format!(
                "session holds {} layers, decoder has {}",
                session.num_layers(),
                self.layers.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Runs one decode step: `input` is the new token of every batch entry,
    /// `[batch, hidden_dim]`. Writes each layer's K/V at the session cursor,
    /// then advances it by one.
    ///
    /// Fails with `CacheLayout` before anything is written when the session
    /// is full or was created for a different layout.
    pub fn step(&self, input: &ArrayView2<f32>, session: &mut DecodeSession) -> Result<Array2<f32>> {
        self.check_session(session)?;
        session.check_capacity()?;
        if input.dim() != (session.batch_size(), self.hidden_dim) {
            return Err(EngineError::shape(format!(
                "decoder step input has shape {:?}, expected [{}, {}]",
                input.shape(),
                session.batch_size(),
                self.hidden_dim
            ))
            .into());
        }

        let position = session.occupancy();
        let mut hidden = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let (self_cache, memory, memory_mask) = session.layer_mut(i);
            hidden = layer.forward_step(hidden, self_cache, memory, &memory_mask.view(), position)?;
        }
        session.advance();
        Ok(hidden)
    }

    /// Non-incremental decode over whole target sequences
    /// (`[batch, seq, hidden_dim]`) with a causal self-attention mask.
    pub fn forward_full(
        &self,
        input: &ArrayView3<f32>,
        memory: &ArrayView3<f32>,
        memory_lengths: &SequenceLengths,
    ) -> Result<Array3<f32>> {
        let (batch, seq, hidden) = input.dim();
        if batch != memory_lengths.batch_size() || seq == 0 || hidden != self.hidden_dim {
            return Err(EngineError::shape(format!(
                "decoder input has shape {:?}, expected [{}, seq >= 1, {}]",
                input.shape(),
                memory_lengths.batch_size(),
                self.hidden_dim
            ))
            .into());
        }

        let cross = self.project_memory(memory, memory_lengths)?;
        let memory_mask = memory_lengths.memory_mask();
        let causal = SequenceLengths::full(batch, seq)?.causal_pairwise_mask();

        let mut rows = input.to_owned().into_shape_with_order((batch * seq, hidden))?;
        for (i, (layer, memory_kv)) in self.layers.iter().zip(&cross).enumerate() {
            rows = layer.forward_full(
                rows,
                batch,
                seq,
                &causal.view(),
                memory_kv,
                &memory_mask.view(),
            )?;
            log::debug!("Decoder layer {} done ({} rows)", i, batch * seq);
        }
        Ok(rows.into_shape_with_order((batch, seq, hidden))?)
    }
}
