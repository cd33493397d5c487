//! Multi-head scaled dot-product attention.
//!
//! One block type serves encoder self-attention, decoder self-attention
//! (incremental or full causal) and decoder cross-attention. Activations are
//! passed as row matrices `[batch * seq, hidden]`; heads are split into
//! `[batch, heads, seq, head_size]` only around the score computation.

use anyhow::Result;
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::activations::softmax_4d_inplace;
use crate::cache::{CrossAttentionCache, SelfAttentionCache};
use crate::compaction::CompactedBatch;
use crate::error::EngineError;
use crate::linear_layer::LinearLayer;
use crate::masks::{apply_key_mask, apply_padding_mask, apply_pairwise_mask};
use crate::ops::matmul::matmul_4d;
use crate::quantize::WeightConversion;
use crate::weights::AttentionWeights;

pub struct MultiHeadAttention {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    out_proj: LinearLayer,
    head_num: usize,
    head_size: usize,
    scale_factor: f32,
}

impl MultiHeadAttention {
    /// `kv_in` is the width of the key/value source: `hidden_dim` for
    /// self-attention, the encoder width for cross-attention.
    pub fn new(
        weights: &AttentionWeights,
        head_num: usize,
        head_size: usize,
        hidden_dim: usize,
        kv_in: usize,
        conversion: &WeightConversion,
    ) -> Result<Self> {
        if head_num * head_size != hidden_dim {
            return Err(EngineError::shape(format!(
                "head_num ({}) * head_size ({}) != hidden_dim ({})",
                head_num, head_size, hidden_dim
            ))
            .into());
        }
        weights.validate("attention", hidden_dim, kv_in)?;

        Ok(Self {
            q_proj: conversion.linear(weights.q_kernel.clone(), weights.q_bias.clone())?,
            k_proj: conversion.linear(weights.k_kernel.clone(), weights.k_bias.clone())?,
            v_proj: conversion.linear(weights.v_kernel.clone(), weights.v_bias.clone())?,
            out_proj: conversion.linear(weights.out_kernel.clone(), weights.out_bias.clone())?,
            head_num,
            head_size,
            scale_factor: 1.0 / (head_size as f32).sqrt(),
        })
    }

    pub fn head_num(&self) -> usize {
        self.head_num
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn hidden_dim(&self) -> usize {
        self.head_num * self.head_size
    }

    pub fn projections(&self) -> [&LinearLayer; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
    }

    /// `[batch * seq, hidden]` -> `[batch, heads, seq, head_size]`
    fn split_heads(&self, x: Array2<f32>, batch: usize, seq: usize) -> Result<Array4<f32>> {
        Ok(x
            .into_shape_with_order((batch, seq, self.head_num, self.head_size))?
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .to_owned())
    }

    /// `[batch, heads, seq, head_size]` -> `[batch * seq, hidden]`
    fn merge_heads(&self, context: Array4<f32>) -> Result<Array2<f32>> {
        let (batch, _, seq, _) = context.dim();
        Ok(context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((batch * seq, self.hidden_dim()))?)
    }

    fn check_rows(&self, x: &ArrayView2<f32>, rows: usize, width: usize, what: &str) -> Result<()> {
        if x.dim() != (rows, width) {
            return Err(EngineError::shape(format!(
                "{} has shape {:?}, expected [{}, {}]",
                what,
                x.shape(),
                rows,
                width
            ))
            .into());
        }
        Ok(())
    }

    /// Attention over padded sequences.
    ///
    /// `hidden` is `[batch * seq, hidden]`, `mask` is `[batch, seq, seq]` with
    /// `1.0` where query `i` may attend to key `j`. `key_padding`
    /// (`[batch, seq]`, `0.0` on padding) keeps padding keys at zero weight
    /// even for queries whose mask row is empty.
    pub fn forward_padded(
        &self,
        hidden: &ArrayView2<f32>,
        batch: usize,
        seq: usize,
        mask: &ArrayView3<f32>,
        key_padding: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        self.check_rows(hidden, batch * seq, self.hidden_dim(), "attention input")?;
        crate::masks::check_pairwise_mask(mask, batch, seq)?;

        let q = self.split_heads(self.q_proj.matmul(hidden), batch, seq)?;
        let k = self.split_heads(self.k_proj.matmul(hidden), batch, seq)?;
        let v = self.split_heads(self.v_proj.matmul(hidden), batch, seq)?;

        let context = self.attend(&q, &k, &v, mask, key_padding)?;
        Ok(self.out_proj.matmul(&context.view()))
    }

    /// Scores, mask, softmax and context for already split heads.
    fn attend(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: &ArrayView3<f32>,
        key_padding: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>> {
        let k_t = k.view().permuted_axes([0, 1, 3, 2]).as_standard_layout().to_owned();
        let mut scores = matmul_4d(q, &k_t);
        scores *= self.scale_factor;
        apply_pairwise_mask(&mut scores, mask)?;
        if let Some(padding) = key_padding {
            apply_padding_mask(&mut scores, padding)?;
        }
        softmax_4d_inplace(&mut scores);
        self.merge_heads(matmul_4d(&scores, v))
    }

    /// Attention over a compacted batch.
    ///
    /// Projections run once over all `total_rows`; the score computation runs
    /// per sequence on its own rows, so no padding position is ever touched.
    /// `mask`, when given, is a padded `[batch, max_seq_len, max_seq_len]`
    /// mask intersected with each sequence's valid square.
    pub fn forward_packed(
        &self,
        rows: &ArrayView2<f32>,
        packing: &CompactedBatch,
        mask: Option<&ArrayView3<f32>>,
    ) -> Result<Array2<f32>> {
        self.check_rows(rows, packing.total_rows(), self.hidden_dim(), "packed attention input")?;
        if let Some(m) = mask {
            crate::masks::check_pairwise_mask(m, packing.batch_size(), packing.max_seq_len())?;
        }

        let q = self.q_proj.matmul(rows);
        let k = self.k_proj.matmul(rows);
        let v = self.v_proj.matmul(rows);

        let per_sequence = (0..packing.batch_size())
            .into_par_iter()
            .map(|b| {
                let range = packing.sequence_rows(b);
                let len = range.len();
                let q_b = self.split_heads(q.slice(s![range.clone(), ..]).to_owned(), 1, len)?;
                let k_b = self.split_heads(k.slice(s![range.clone(), ..]).to_owned(), 1, len)?;
                let v_b = self.split_heads(v.slice(s![range, ..]).to_owned(), 1, len)?;
                let seq_mask = match mask {
                    Some(m) => m.slice(s![b..b + 1, 0..len, 0..len]).to_owned(),
                    None => ndarray::Array3::ones((1, len, len)),
                };
                self.attend(&q_b, &k_b, &v_b, &seq_mask.view(), None)
            })
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<_> = per_sequence.iter().map(|c| c.view()).collect();
        let context = ndarray::concatenate(Axis(0), &views)?;
        Ok(self.out_proj.matmul(&context.view()))
    }

    /// Projects encoder memory `[batch * mem_len, kv_in]` into cross-attention
    /// K (transposed) and V, once per decode session.
    pub fn project_memory_kv(
        &self,
        memory: &ArrayView2<f32>,
        batch: usize,
        mem_len: usize,
    ) -> Result<CrossAttentionCache> {
        self.check_rows(memory, batch * mem_len, self.k_proj.in_features(), "encoder memory")?;
        let k = self.split_heads(self.k_proj.matmul(memory), batch, mem_len)?;
        let v = self.split_heads(self.v_proj.matmul(memory), batch, mem_len)?;
        Ok(CrossAttentionCache {
            keys_transposed: k.permuted_axes([0, 1, 3, 2]).as_standard_layout().to_owned(),
            values: v,
        })
    }

    /// Queries `[batch * seq, hidden]` against precomputed memory K/V.
    /// `memory_mask` is `[batch, mem_len]`.
    pub fn forward_cross(
        &self,
        query: &ArrayView2<f32>,
        batch: usize,
        seq: usize,
        memory: &CrossAttentionCache,
        memory_mask: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        self.check_rows(query, batch * seq, self.hidden_dim(), "cross-attention query")?;
        if memory_mask.dim() != (batch, memory.memory_len()) {
            return Err(EngineError::shape(format!(
                "memory mask has shape {:?}, expected [{}, {}]",
                memory_mask.shape(),
                batch,
                memory.memory_len()
            ))
            .into());
        }

        let q = self.split_heads(self.q_proj.matmul(query), batch, seq)?;
        let mut scores = matmul_4d(&q, &memory.keys_transposed);
        scores *= self.scale_factor;
        apply_key_mask(&mut scores, memory_mask)?;
        softmax_4d_inplace(&mut scores);
        let context = self.merge_heads(matmul_4d(&scores, &memory.values))?;
        Ok(self.out_proj.matmul(&context.view()))
    }

    /// One incremental self-attention step.
    ///
    /// `hidden` holds the new token of every batch entry, `[batch, hidden]`.
    /// Its K/V are written to `cache` at `position` and the query attends over
    /// positions `0..=position`, so the work is O(1) for the cache update and
    /// O(position) for the scores.
    pub fn forward_decode_step(
        &self,
        hidden: &ArrayView2<f32>,
        cache: &mut SelfAttentionCache,
        position: usize,
    ) -> Result<Array2<f32>> {
        let batch = hidden.nrows();
        self.check_rows(hidden, batch, self.hidden_dim(), "decoder step input")?;

        let q = self.q_proj.matmul(hidden);
        let k = self.k_proj.matmul(hidden);
        let v = self.v_proj.matmul(hidden);
        cache.write(position, &k.view(), &v.view())?;

        let len = position + 1;
        let q = q.into_shape_with_order((batch, self.head_num, 1, self.head_size))?;
        let mut scores = cache.scores(&q.view(), len)?;
        scores *= self.scale_factor;
        softmax_4d_inplace(&mut scores);

        let context = cache
            .context(&scores.view(), len)?
            .into_shape_with_order((batch, self.hidden_dim()))?;
        Ok(self.out_proj.matmul(&context.view()))
    }
}

#[cfg(test)]
mod tests;
