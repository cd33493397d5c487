//! Sequence lengths and the attention masks derived from them.
//!
//! Masks are `f32` tensors where `1.0` means visible and `0.0` means masked.
//! Masked attention scores are overwritten with [`MASK_VALUE`] before softmax,
//! which drives their weight to exactly zero.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

use crate::error::EngineError;

/// Standard large negative value for masking (avoids NaN in softmax)
pub const MASK_VALUE: f32 = -1e9;

/// Score given to padding keys; strictly below [`MASK_VALUE`].
pub const PADDING_MASK_VALUE: f32 = 2.0 * MASK_VALUE;

/// Valid (non-padding) length of every sequence in a padded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLengths {
    lengths: Vec<usize>,
    max_seq_len: usize,
}

impl SequenceLengths {
    /// Validates `1 <= length <= max_seq_len` for every entry.
    pub fn new(lengths: Vec<usize>, max_seq_len: usize) -> Result<Self> {
        for (index, &length) in lengths.iter().enumerate() {
            if length == 0 || length > max_seq_len {
                return Err(EngineError::InvalidLength {
                    index,
                    length: length as i64,
                    max_seq_len,
                }
                .into());
            }
        }
        Ok(Self {
            lengths,
            max_seq_len,
        })
    }

    /// Accepts signed lengths as produced by integer tensors; negative or zero
    /// entries are rejected the same way as overlong ones.
    pub fn from_signed(lengths: &[i64], max_seq_len: usize) -> Result<Self> {
        let mut checked = Vec::with_capacity(lengths.len());
        for (index, &length) in lengths.iter().enumerate() {
            if length <= 0 || length as u64 > max_seq_len as u64 {
                return Err(EngineError::InvalidLength {
                    index,
                    length,
                    max_seq_len,
                }
                .into());
            }
            checked.push(length as usize);
        }
        Self::new(checked, max_seq_len)
    }

    /// Every sequence uses the full padded length.
    pub fn full(batch_size: usize, seq_len: usize) -> Result<Self> {
        Self::new(vec![seq_len; batch_size], seq_len)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn total_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn is_unpadded(&self) -> bool {
        self.lengths.iter().all(|&l| l == self.max_seq_len)
    }

    /// `[batch, max_seq_len]`, `1.0` where `position < length`.
    pub fn sequence_mask(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.batch_size(), self.max_seq_len), |(b, pos)| {
            if pos < self.lengths[b] {
                1.0
            } else {
                0.0
            }
        })
    }

    /// `[batch, seq, seq]`, `1.0` where both query `i` and key `j` are valid.
    pub fn pairwise_mask(&self) -> Array3<f32> {
        let seq = self.max_seq_len;
        Array3::from_shape_fn((self.batch_size(), seq, seq), |(b, i, j)| {
            let len = self.lengths[b];
            if i < len && j < len {
                1.0
            } else {
                0.0
            }
        })
    }

    /// Pairwise mask intersected with `j <= i`.
    pub fn causal_pairwise_mask(&self) -> Array3<f32> {
        let mut mask = self.pairwise_mask();
        apply_causal_to_mask(&mut mask);
        mask
    }

    /// Key mask over encoder memory for cross-attention. Same values as
    /// [`SequenceLengths::sequence_mask`], named for the decoder side.
    pub fn memory_mask(&self) -> Array2<f32> {
        self.sequence_mask()
    }

    /// Zeroes every position `>= length` of a `[batch, seq, hidden]` tensor.
    pub fn apply_output_mask(&self, hidden: &mut Array3<f32>) -> Result<()> {
        let (batch, seq, _) = hidden.dim();
        if batch != self.batch_size() || seq != self.max_seq_len {
            return Err(EngineError::shape(format!(
                "output has shape {:?}, lengths describe [{}, {}, _]",
                hidden.shape(),
                self.batch_size(),
                self.max_seq_len
            ))
            .into());
        }
        for (mut rows, &len) in hidden.outer_iter_mut().zip(&self.lengths) {
            rows.slice_mut(s![len.., ..]).fill(0.0);
        }
        Ok(())
    }
}

/// Zeroes every `(i, j)` entry with `j > i` in a `[batch, seq, seq]` mask.
pub fn apply_causal_to_mask(mask: &mut Array3<f32>) {
    for mut plane in mask.outer_iter_mut() {
        for ((i, j), m) in plane.indexed_iter_mut() {
            if j > i {
                *m = 0.0;
            }
        }
    }
}

/// Checks a caller-provided `[batch, seq, seq]` mask against the batch shape.
pub fn check_pairwise_mask(mask: &ArrayView3<f32>, batch: usize, seq: usize) -> Result<()> {
    if mask.dim() != (batch, seq, seq) {
        return Err(EngineError::shape(format!(
            "attention mask has shape {:?}, expected [{}, {}, {}]",
            mask.shape(),
            batch,
            seq,
            seq
        ))
        .into());
    }
    Ok(())
}

/// Overwrites `scores` with `value` wherever the broadcast mask is `0.0`.
fn fill_masked(scores: &mut Array4<f32>, mask: ArrayView4<f32>, value: f32, what: &str) -> Result<()> {
    let dim = scores.dim();
    let broadcast = mask.broadcast(dim).ok_or_else(|| {
        EngineError::shape(format!(
            "{} of shape {:?} does not broadcast to scores {:?}",
            what,
            mask.shape(),
            dim
        ))
    })?;
    Zip::from(scores).and(&broadcast).par_for_each(|s, &m| {
        if m == 0.0 {
            *s = value;
        }
    });
    Ok(())
}

/// Apply a pairwise mask `[batch, q, k]` to scores `[batch, heads, q, k]`.
pub fn apply_pairwise_mask(scores: &mut Array4<f32>, mask: &ArrayView3<f32>) -> Result<()> {
    fill_masked(scores, mask.view().insert_axis(Axis(1)), MASK_VALUE, "pairwise mask")
}

/// Apply a key mask `[batch, k]` to scores `[batch, heads, q, k]`.
pub fn apply_key_mask(scores: &mut Array4<f32>, mask: &ArrayView2<f32>) -> Result<()> {
    let expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    fill_masked(scores, expanded, MASK_VALUE, "key mask")
}

/// Pushes padding keys (`[batch, k]` mask) to [`PADDING_MASK_VALUE`]. Applied
/// after the pairwise mask, so a query whose mask hides every valid key still
/// spreads its weight over valid keys only.
pub fn apply_padding_mask(scores: &mut Array4<f32>, mask: &ArrayView2<f32>) -> Result<()> {
    let expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    fill_masked(scores, expanded, PADDING_MASK_VALUE, "padding mask")
}

#[cfg(test)]
mod tests;
