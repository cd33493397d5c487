//! Padding removal: packs the valid rows of a padded batch contiguously.
//!
//! A padded `[batch, max_seq_len, hidden]` tensor is gathered into
//! `[total_rows, hidden]` where `total_rows = sum(lengths)`. Sequence `b`
//! occupies rows `offsets[b]..offsets[b + 1]`.
//!
//! For lengths `[3, 1, 2]` the offsets are `[0, 3, 4, 6]`.

use std::ops::Range;

use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::error::EngineError;
use crate::masks::SequenceLengths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedBatch {
    /// Cumulative sequence lengths, `batch + 1` entries starting at 0.
    offsets: Vec<usize>,
    /// `row -> (batch index, position in the padded sequence)`.
    row_map: Vec<(usize, usize)>,
    max_seq_len: usize,
}

impl CompactedBatch {
    pub fn from_lengths(lengths: &SequenceLengths) -> Self {
        let mut offsets = Vec::with_capacity(lengths.batch_size() + 1);
        let mut row_map = Vec::with_capacity(lengths.total_tokens());
        offsets.push(0);
        for (b, &len) in lengths.as_slice().iter().enumerate() {
            row_map.extend((0..len).map(|pos| (b, pos)));
            offsets.push(row_map.len());
        }

        let padded = lengths.batch_size() * lengths.max_seq_len();
        if padded > 0 {
            log::debug!(
                "Compacted {} padded rows into {} ({:.1}% kept)",
                padded,
                row_map.len(),
                100.0 * row_map.len() as f64 / padded as f64
            );
        }

        Self {
            offsets,
            row_map,
            max_seq_len: lengths.max_seq_len(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn total_rows(&self) -> usize {
        self.row_map.len()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Compacted rows that belong to sequence `b`.
    pub fn sequence_rows(&self, b: usize) -> Range<usize> {
        self.offsets[b]..self.offsets[b + 1]
    }

    /// Original `(batch, position)` of a compacted row.
    pub fn row_origin(&self, row: usize) -> (usize, usize) {
        self.row_map[row]
    }

    fn check_padded(&self, padded: &ArrayView3<f32>) -> Result<()> {
        let (batch, seq, _) = padded.dim();
        if batch != self.batch_size() || seq != self.max_seq_len {
            return Err(EngineError::shape(format!(
                "padded input is [{}, {}, _], compaction expects [{}, {}, _]",
                batch,
                seq,
                self.batch_size(),
                self.max_seq_len
            ))
            .into());
        }
        Ok(())
    }

    /// `[batch, max_seq_len, hidden]` -> `[total_rows, hidden]`.
    pub fn gather(&self, padded: &ArrayView3<f32>) -> Result<Array2<f32>> {
        self.check_padded(padded)?;
        let hidden = padded.dim().2;
        let mut packed = Array2::<f32>::zeros((self.total_rows(), hidden));
        for b in 0..self.batch_size() {
            let rows = self.sequence_rows(b);
            let len = rows.len();
            packed
                .slice_mut(s![rows, ..])
                .assign(&padded.slice(s![b, 0..len, ..]));
        }
        Ok(packed)
    }

    /// `[total_rows, hidden]` -> `[batch, max_seq_len, hidden]`; padding
    /// positions are zero.
    pub fn scatter(&self, packed: &ArrayView2<f32>) -> Result<Array3<f32>> {
        let (rows, hidden) = packed.dim();
        if rows != self.total_rows() {
            return Err(EngineError::shape(format!(
                "packed tensor has {} rows, compaction holds {}",
                rows,
                self.total_rows()
            ))
            .into());
        }
        let mut padded = Array3::<f32>::zeros((self.batch_size(), self.max_seq_len, hidden));
        Zip::indexed(padded.axis_iter_mut(Axis(0))).par_for_each(|b, mut seq| {
            let range = self.sequence_rows(b);
            let len = range.len();
            seq.slice_mut(s![0..len, ..])
                .assign(&packed.slice(s![range, ..]));
        });
        Ok(padded)
    }
}
