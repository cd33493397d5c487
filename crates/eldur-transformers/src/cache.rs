//! Incremental decode state: per-layer self-attention K/V arenas, the
//! cross-attention memory K/V, and the session that owns both.
//!
//! Every self-attention buffer is allocated for `max_decode_len` steps when the
//! session starts. Step `t` writes its K/V at position `t` and attends over
//! positions `0..=t`; nothing is reallocated while decoding.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Array4, Array5, ArrayView2, ArrayView4, Axis, Zip};
use rayon::prelude::*;

use crate::error::EngineError;
use crate::ops::matmul::{matmul_4d_context, matmul_4d_decode, matmul_4d_decode_batch_major};
use crate::quantize::Precision;

/// Physical arrangement of the self-attention K/V cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLayout {
    /// `[max_len, batch, hidden]` for both K and V.
    Default,
    /// K as `[batch, heads, head_size / x, max_len, x]`, V as
    /// `[batch, heads, max_len, head_size]`.
    BatchMajor { x: usize },
}

impl CacheLayout {
    /// Elements per contiguous key chunk for the batch-major layout.
    pub fn alignment(precision: Precision) -> usize {
        match precision {
            Precision::Half => 8,
            Precision::Full => 4,
        }
    }

    /// Batch-major only when requested and `head_size` divides evenly.
    pub fn select(precision: Precision, head_size: usize, prefer_batch_major: bool) -> Self {
        let x = Self::alignment(precision);
        if prefer_batch_major && head_size % x == 0 {
            CacheLayout::BatchMajor { x }
        } else {
            CacheLayout::Default
        }
    }

    pub fn is_batch_major(&self) -> bool {
        matches!(self, CacheLayout::BatchMajor { .. })
    }
}

#[derive(Debug, Clone)]
enum KvStore {
    Default {
        k: Array3<f32>,
        v: Array3<f32>,
    },
    BatchMajor {
        x: usize,
        k: Array5<f32>,
        v: Array4<f32>,
    },
}

/// Self-attention K/V history of one decoder layer.
#[derive(Debug, Clone)]
pub struct SelfAttentionCache {
    store: KvStore,
    batch_size: usize,
    head_num: usize,
    head_size: usize,
    capacity: usize,
}

impl SelfAttentionCache {
    pub fn new(
        layout: CacheLayout,
        batch_size: usize,
        head_num: usize,
        head_size: usize,
        capacity: usize,
    ) -> Self {
        let hidden = head_num * head_size;
        let store = match layout {
            CacheLayout::Default => KvStore::Default {
                k: Array3::zeros((capacity, batch_size, hidden)),
                v: Array3::zeros((capacity, batch_size, hidden)),
            },
            CacheLayout::BatchMajor { x } => KvStore::BatchMajor {
                x,
                k: Array5::zeros((batch_size, head_num, head_size / x, capacity, x)),
                v: Array4::zeros((batch_size, head_num, capacity, head_size)),
            },
        };
        Self {
            store,
            batch_size,
            head_num,
            head_size,
            capacity,
        }
    }

    pub fn layout(&self) -> CacheLayout {
        match &self.store {
            KvStore::Default { .. } => CacheLayout::Default,
            KvStore::BatchMajor { x, .. } => CacheLayout::BatchMajor { x: *x },
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores one step's projected K/V (`[batch, hidden]` each) at `position`.
    pub fn write(&mut self, position: usize, k: &ArrayView2<f32>, v: &ArrayView2<f32>) -> Result<()> {
        if position >= self.capacity {
            return Err(EngineError::cache(format!(
                "write at position {} exceeds capacity {}",
                position, self.capacity
            ))
            .into());
        }
        let expected = (self.batch_size, self.head_num * self.head_size);
        if k.dim() != expected || v.dim() != expected {
            return Err(EngineError::shape(format!(
                "cache write expects [{}, {}], got K {:?} and V {:?}",
                expected.0,
                expected.1,
                k.shape(),
                v.shape()
            ))
            .into());
        }

        let (heads, dim) = (self.head_num, self.head_size);
        match &mut self.store {
            KvStore::Default { k: k_cache, v: v_cache } => {
                k_cache.slice_mut(s![position, .., ..]).assign(k);
                v_cache.slice_mut(s![position, .., ..]).assign(v);
            }
            KvStore::BatchMajor { x, k: k_cache, v: v_cache } => {
                let x = *x;
                Zip::from(k_cache.outer_iter_mut())
                    .and(v_cache.outer_iter_mut())
                    .and(k.rows())
                    .and(v.rows())
                    .par_for_each(|mut k_b, mut v_b, k_row, v_row| {
                        for h in 0..heads {
                            for d in 0..dim {
                                k_b[[h, d / x, position, d % x]] = k_row[h * dim + d];
                                v_b[[h, position, d]] = v_row[h * dim + d];
                            }
                        }
                    });
            }
        }
        Ok(())
    }

    /// Raw attention scores `[batch, heads, 1, len]` of one query per batch
    /// element against the first `len` cached keys.
    pub fn scores(&self, q: &ArrayView4<f32>, len: usize) -> Result<Array4<f32>> {
        match &self.store {
            KvStore::Default { k, .. } => {
                let k_t = k
                    .slice(s![0..len, .., ..])
                    .into_shape_with_order((len, self.batch_size, self.head_num, self.head_size))?
                    .permuted_axes([1, 2, 3, 0]);
                Ok(matmul_4d_decode(q, &k_t))
            }
            KvStore::BatchMajor { k, .. } => {
                let active = k.slice(s![.., .., .., 0..len, ..]);
                Ok(matmul_4d_decode_batch_major(q, &active))
            }
        }
    }

    /// Weighted sum of the first `len` cached values -> `[batch, heads, 1, head_size]`.
    pub fn context(&self, probs: &ArrayView4<f32>, len: usize) -> Result<Array4<f32>> {
        match &self.store {
            KvStore::Default { v, .. } => {
                let v_heads = v
                    .slice(s![0..len, .., ..])
                    .into_shape_with_order((len, self.batch_size, self.head_num, self.head_size))?
                    .permuted_axes([1, 2, 0, 3]);
                Ok(matmul_4d_context(probs, &v_heads))
            }
            KvStore::BatchMajor { v, .. } => {
                let active = v.slice(s![.., .., 0..len, ..]);
                Ok(matmul_4d_context(probs, &active))
            }
        }
    }

    /// Gathers batch entries: new entry `i` takes the history of `indices[i]`.
    pub fn reorder(&mut self, indices: &[usize]) {
        match &mut self.store {
            KvStore::Default { k, v } => {
                *k = k.select(Axis(1), indices);
                *v = v.select(Axis(1), indices);
            }
            KvStore::BatchMajor { k, v, .. } => {
                *k = k.select(Axis(0), indices);
                *v = v.select(Axis(0), indices);
            }
        }
        self.batch_size = indices.len();
    }
}

/// Encoder memory projected once into the layout the attention kernels read:
/// K transposed to `[batch, heads, head_size, mem_len]`, V as
/// `[batch, heads, mem_len, head_size]`.
#[derive(Debug, Clone)]
pub struct CrossAttentionCache {
    pub keys_transposed: Array4<f32>,
    pub values: Array4<f32>,
}

impl CrossAttentionCache {
    pub fn memory_len(&self) -> usize {
        self.values.shape()[2]
    }

    fn reorder(&mut self, indices: &[usize]) {
        self.keys_transposed = self.keys_transposed.select(Axis(0), indices);
        self.values = self.values.select(Axis(0), indices);
    }
}

/// State of one autoregressive decode session.
///
/// Occupancy starts at 0, grows by exactly one per decoder step and only goes
/// back to 0 through [`DecodeSession::reset`]. A session must not be shared by
/// concurrent callers; every mutating call takes `&mut self`.
#[derive(Debug, Clone)]
pub struct DecodeSession {
    layout: CacheLayout,
    self_attention: Vec<SelfAttentionCache>,
    cross_attention: Vec<CrossAttentionCache>,
    memory_mask: Array2<f32>,
    occupancy: usize,
    max_decode_len: usize,
}

impl DecodeSession {
    pub(crate) fn new(
        layout: CacheLayout,
        self_attention: Vec<SelfAttentionCache>,
        cross_attention: Vec<CrossAttentionCache>,
        memory_mask: Array2<f32>,
        max_decode_len: usize,
    ) -> Self {
        Self {
            layout,
            self_attention,
            cross_attention,
            memory_mask,
            occupancy: 0,
            max_decode_len,
        }
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    /// Number of steps written so far.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn max_decode_len(&self) -> usize {
        self.max_decode_len
    }

    pub fn batch_size(&self) -> usize {
        self.memory_mask.nrows()
    }

    pub fn num_layers(&self) -> usize {
        self.self_attention.len()
    }

    pub fn memory_mask(&self) -> &Array2<f32> {
        &self.memory_mask
    }

    /// Fails before anything is written when the next step would overflow.
    pub fn check_capacity(&self) -> Result<()> {
        if self.occupancy >= self.max_decode_len {
            return Err(EngineError::cache(format!(
                "decode session is full: occupancy {} reached max_decode_len {}",
                self.occupancy, self.max_decode_len
            ))
            .into());
        }
        Ok(())
    }

    /// Split borrow of one layer's caches plus the shared memory mask.
    pub(crate) fn layer_mut(
        &mut self,
        layer: usize,
    ) -> (&mut SelfAttentionCache, &CrossAttentionCache, &Array2<f32>) {
        (
            &mut self.self_attention[layer],
            &self.cross_attention[layer],
            &self.memory_mask,
        )
    }

    /// Swaps in freshly projected encoder memory, keeping the self-attention
    /// arenas. The batch size must not change.
    pub(crate) fn replace_memory(
        &mut self,
        cross_attention: Vec<CrossAttentionCache>,
        memory_mask: Array2<f32>,
    ) {
        self.cross_attention = cross_attention;
        self.memory_mask = memory_mask;
        self.occupancy = 0;
    }

    pub(crate) fn advance(&mut self) {
        self.occupancy += 1;
    }

    /// Starts over on the same memory. Buffers are kept; stale entries beyond
    /// the cursor are never read.
    pub fn reset(&mut self) {
        self.occupancy = 0;
    }

    /// Reorders every batch entry, e.g. after a beam search step picks new
    /// parents. `indices[i]` is the old batch index feeding new entry `i`.
    pub fn reorder(&mut self, indices: &[usize]) -> Result<()> {
        let batch = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&i| i >= batch) {
            return Err(EngineError::shape(format!(
                "reorder index {} out of range for batch size {}",
                bad, batch
            ))
            .into());
        }
        self.self_attention
            .par_iter_mut()
            .for_each(|cache| cache.reorder(indices));
        self.cross_attention
            .par_iter_mut()
            .for_each(|cache| cache.reorder(indices));
        self.memory_mask = self.memory_mask.select(Axis(0), indices);
        Ok(())
    }
}
