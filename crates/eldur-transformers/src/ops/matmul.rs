//! Dense matrix multiplication kernels.
//!
//! GEMM itself is delegated to `faer`; everything here is about getting
//! ndarray buffers into row-major slices and splitting work across rayon.

use faer::Parallelism;
use ndarray::{Array2, Array4, ArrayView2, ArrayView4, ArrayView5, Zip};
use rayon::prelude::*;

const STANDARD_LAYOUT: &str = "as_standard_layout() always yields a contiguous buffer";

/// `C = A @ B` for `A: [m, k]`, `B: [k, n]`.
#[inline]
pub fn matmul_2d(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "Dim mismatch");

    let mut c = Array2::<f32>::zeros((m, n));
    if m == 0 || n == 0 {
        return c;
    }
    let a_s = a.as_standard_layout();
    let b_s = b.as_standard_layout();
    let c_sl = c.as_slice_mut().expect(STANDARD_LAYOUT);

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_s.as_slice().expect(STANDARD_LAYOUT), m, k),
        faer::mat::from_row_major_slice(b_s.as_slice().expect(STANDARD_LAYOUT), k, n),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

/// Batched per-head matmul: `[B, H, M, K] @ [B, H, K, N] -> [B, H, M, N]`.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, seq1, dim) = a.dim();
    let seq2 = b.shape()[3];
    assert_eq!(b.shape()[2], dim, "Dim mismatch");

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));
    if seq1 == 0 || seq2 == 0 {
        return output;
    }

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h.as_slice_mut().expect(STANDARD_LAYOUT);

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, seq1, seq2),
                        faer::mat::from_row_major_slice(a_s.as_slice().expect(STANDARD_LAYOUT), seq1, dim),
                        faer::mat::from_row_major_slice(b_s.as_slice().expect(STANDARD_LAYOUT), dim, seq2),
                        None,
                        1.0,
                        Parallelism::None, // already parallel over the batch
                    );
                });
        });

    output
}

/// Decode scores: `Q = [B, H, 1, D]`, `K^T = [B, H, D, S]` -> `[B, H, 1, S]`.
///
/// Works on strided views so cache buffers can be read in place.
pub fn matmul_4d_decode(q: &ArrayView4<f32>, k_transposed: &ArrayView4<f32>) -> Array4<f32> {
    let (batch, heads, _, dim) = q.dim();
    let cache_len = k_transposed.shape()[3];
    let mut out = Array4::<f32>::zeros((batch, heads, 1, cache_len));

    Zip::from(out.outer_iter_mut())
        .and(q.outer_iter())
        .and(k_transposed.outer_iter())
        .par_for_each(|mut out_b, q_b, k_b| {
            for h in 0..heads {
                for t in 0..cache_len {
                    let mut sum = 0.0;
                    for d in 0..dim {
                        sum += q_b[[h, 0, d]] * k_b[[h, d, t]];
                    }
                    out_b[[h, 0, t]] = sum;
                }
            }
        });
    out
}

/// Decode context: `scores = [B, H, 1, S]`, `V = [B, H, S, D]` -> `[B, H, 1, D]`.
pub fn matmul_4d_context(scores: &ArrayView4<f32>, v: &ArrayView4<f32>) -> Array4<f32> {
    let (batch, heads, _, cache_len) = scores.dim();
    let dim = v.shape()[3];
    let mut out = Array4::<f32>::zeros((batch, heads, 1, dim));

    Zip::from(out.outer_iter_mut())
        .and(scores.outer_iter())
        .and(v.outer_iter())
        .par_for_each(|mut out_b, s_b, v_b| {
            for h in 0..heads {
                for d in 0..dim {
                    let mut sum = 0.0;
                    for t in 0..cache_len {
                        sum += s_b[[h, 0, t]] * v_b[[h, t, d]];
                    }
                    out_b[[h, 0, d]] = sum;
                }
            }
        });
    out
}

/// Decode scores against a batch-major key cache.
///
/// `Q = [B, H, 1, D]`, `K = [B, H, D / x, S, x]` -> `[B, H, 1, S]`. Element `d`
/// of a key lives at `[d / x, t, d % x]`, so the `x` lanes of each chunk are
/// contiguous for every timestep.
pub fn matmul_4d_decode_batch_major(q: &ArrayView4<f32>, k: &ArrayView5<f32>) -> Array4<f32> {
    let (batch, heads, chunks, cache_len, x) = k.dim();
    let mut out = Array4::<f32>::zeros((batch, heads, 1, cache_len));

    Zip::from(out.outer_iter_mut())
        .and(q.outer_iter())
        .and(k.outer_iter())
        .par_for_each(|mut out_b, q_b, k_b| {
            for h in 0..heads {
                for t in 0..cache_len {
                    let mut sum = 0.0;
                    for c in 0..chunks {
                        for lane in 0..x {
                            sum += q_b[[h, 0, c * x + lane]] * k_b[[h, c, t, lane]];
                        }
                    }
                    out_b[[h, 0, t]] = sum;
                }
            }
        });
    out
}

/// Integer GEMM for row-quantized activations against int8 weights.
///
/// `a` is `[m, k]` int8 with one scale per row, `b` is `[k, n]` int8 with one
/// scale per column. Accumulates in i32 and rescales once per output.
pub fn matmul_2d_i8(
    a: &[Vec<i8>],
    row_scales: &[f32],
    b: &ArrayView2<i8>,
    col_scales: &[f32],
) -> Array2<f32> {
    let m = a.len();
    let (k, n) = b.dim();
    let b_cols: Vec<Vec<i8>> = (0..n).map(|j| b.column(j).to_vec()).collect();

    let mut out = Array2::<f32>::zeros((m, n));
    out.axis_iter_mut(ndarray::Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut out_row)| {
            let a_row = &a[i];
            debug_assert_eq!(a_row.len(), k);
            for (j, col) in b_cols.iter().enumerate() {
                let acc: i32 = a_row
                    .iter()
                    .zip(col.iter())
                    .map(|(&x, &w)| x as i32 * w as i32)
                    .sum();
                out_row[j] = acc as f32 * row_scales[i] * col_scales[j];
            }
        });
    out
}
