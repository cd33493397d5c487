//! Low-level numeric kernels shared by the layer blocks.

pub mod matmul;

pub use matmul::{
    matmul_2d, matmul_2d_i8, matmul_4d, matmul_4d_context, matmul_4d_decode,
    matmul_4d_decode_batch_major,
};

use ndarray::{Array2, ArrayView2, Zip};

/// Parallel in-place addition: a += b
pub fn add_inplace(a: &mut Array2<f32>, b: &ArrayView2<f32>) {
    Zip::from(a).and(b).par_for_each(|x, &y| *x += y);
}
