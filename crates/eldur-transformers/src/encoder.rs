//! Bidirectional encoder stack with an optional padding-removal path.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Zip};

use crate::attention::MultiHeadAttention;
use crate::compaction::CompactedBatch;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::feedforward::FeedForwardBlock;
use crate::masks::{check_pairwise_mask, SequenceLengths};
use crate::normalization::{LayerNorm, NormPlacement};
use crate::quantize::WeightConversion;
use crate::weights::{EncoderLayerWeights, EncoderWeights};

/// Self-attention followed by feed-forward, each wrapped in its norm and
/// residual.
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    attention_norm: LayerNorm,
    feed_forward: FeedForwardBlock,
    placement: NormPlacement,
}

impl EncoderLayer {
    pub fn new(
        weights: &EncoderLayerWeights,
        config: &EngineConfig,
        conversion: &WeightConversion,
    ) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(
                &weights.attention,
                config.head_num,
                config.head_size,
                config.hidden_dim,
                config.hidden_dim,
                conversion,
            )?,
            attention_norm: weights.attention_norm.to_layer_norm(config.layer_norm_eps),
            feed_forward: FeedForwardBlock::new(
                &weights.feed_forward,
                &weights.output_norm,
                config.activation,
                config.encoder_norm,
                config.layer_norm_eps,
                conversion,
            )?,
            placement: config.encoder_norm,
        })
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    /// `hidden` is `[batch * seq, hidden_dim]`, `mask` is `[batch, seq, seq]`
    /// and `sequence_mask` the `[batch, seq]` mask of valid positions.
    pub fn forward_padded(
        &self,
        hidden: Array2<f32>,
        batch: usize,
        seq: usize,
        mask: &ArrayView3<f32>,
        sequence_mask: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let hidden = self.placement.residual(&self.attention_norm, hidden, |x| {
            self.attention
                .forward_padded(x, batch, seq, mask, Some(sequence_mask))
        })?;
        self.feed_forward.forward(hidden)
    }

    /// `hidden` is `[total_rows, hidden_dim]` laid out by `packing`.
    pub fn forward_packed(
        &self,
        hidden: Array2<f32>,
        packing: &CompactedBatch,
        mask: Option<&ArrayView3<f32>>,
    ) -> Result<Array2<f32>> {
        let hidden = self.placement.residual(&self.attention_norm, hidden, |x| {
            self.attention.forward_packed(x, packing, mask)
        })?;
        self.feed_forward.forward(hidden)
    }
}

/// N encoder layers run in order, each consuming the previous output.
pub struct EncoderStack {
    layers: Vec<EncoderLayer>,
    hidden_dim: usize,
    max_seq_len: usize,
    remove_padding: bool,
}

impl EncoderStack {
    /// Validates the weights against `config` and converts them once.
    pub fn new(config: &EngineConfig, weights: &EncoderWeights) -> Result<Self> {
        config.validate()?;
        weights.validate(config.hidden_dim)?;
        if weights.layers.len() != config.layer_num {
            return Err(EngineError::shape(format!(
                "config expects {} encoder layers, weights have {}",
                config.layer_num,
                weights.layers.len()
            ))
            .into());
        }

        let conversion = config.weight_conversion();
        let layers = weights
            .layers
            .iter()
            .map(|w| EncoderLayer::new(w, config, &conversion))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Built encoder stack: {} layers, hidden_dim={}, precision={:?}, int8 mode {}, remove_padding={}",
            layers.len(),
            config.hidden_dim,
            config.precision,
            config.int8_mode,
            config.remove_padding
        );

        Ok(Self {
            layers,
            hidden_dim: config.hidden_dim,
            max_seq_len: config.max_seq_len,
            remove_padding: config.remove_padding,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn remove_padding(&self) -> bool {
        self.remove_padding
    }

    /// Runs every layer over `input` (`[batch, seq, hidden_dim]`).
    ///
    /// `mask`, when given, is a caller-supplied `[batch, seq, seq]` mask that is
    /// intersected with the one derived from `lengths`. Only valid positions of
    /// the result are meaningful; the padding-removal path writes zeros at
    /// padding positions, the padded path leaves them unspecified.
    pub fn forward(
        &self,
        input: &ArrayView3<f32>,
        lengths: &SequenceLengths,
        mask: Option<&ArrayView3<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch, seq, hidden) = input.dim();
        if hidden != self.hidden_dim || batch != lengths.batch_size() || seq != lengths.max_seq_len() {
            return Err(EngineError::shape(format!(
                "encoder input has shape {:?}, expected [{}, {}, {}]",
                input.shape(),
                lengths.batch_size(),
                lengths.max_seq_len(),
                self.hidden_dim
            ))
            .into());
        }
        if seq > self.max_seq_len {
            return Err(EngineError::shape(format!(
                "sequence length {} exceeds max_seq_len {}",
                seq, self.max_seq_len
            ))
            .into());
        }
        if let Some(m) = mask {
            check_pairwise_mask(m, batch, seq)?;
        }

        if self.remove_padding {
            self.forward_compacted(input, lengths, mask)
        } else {
            self.forward_padded(input, lengths, mask)
        }
    }

    fn forward_padded(
        &self,
        input: &ArrayView3<f32>,
        lengths: &SequenceLengths,
        mask: Option<&ArrayView3<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch, seq, hidden) = input.dim();
        let mut pairwise = lengths.pairwise_mask();
        if let Some(m) = mask {
            Zip::from(&mut pairwise).and(m).for_each(|p, &e| *p *= e);
        }
        let sequence_mask = lengths.sequence_mask();

        let mut rows = input.to_owned().into_shape_with_order((batch * seq, hidden))?;
        for (i, layer) in self.layers.iter().enumerate() {
            rows = layer.forward_padded(rows, batch, seq, &pairwise.view(), &sequence_mask.view())?;
            log::debug!("Encoder layer {} done ({} padded rows)", i, batch * seq);
        }
        Ok(rows.into_shape_with_order((batch, seq, hidden))?)
    }

    /// Compacts once before layer 0 and scatters once after the last layer.
    fn forward_compacted(
        &self,
        input: &ArrayView3<f32>,
        lengths: &SequenceLengths,
        mask: Option<&ArrayView3<f32>>,
    ) -> Result<Array3<f32>> {
        let packing = CompactedBatch::from_lengths(lengths);
        let mut rows = packing.gather(input)?;
        for (i, layer) in self.layers.iter().enumerate() {
            rows = layer.forward_packed(rows, &packing, mask)?;
            log::debug!("Encoder layer {} done ({} packed rows)", i, packing.total_rows());
        }
        packing.scatter(&rows.view())
    }
}
