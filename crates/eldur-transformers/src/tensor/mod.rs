//! Owned weight buffers and their storage types.

pub mod dtype;
pub mod quantized;

pub use dtype::DType;
pub use quantized::{QuantizedMatrix, ScaleGranularity};

use half::f16;
use ndarray::Array2;

/// A 2D weight buffer tagged with its storage type.
///
/// Activations are always F32 on the CPU backend; only weights change
/// representation when a `WeightConversion` is applied.
#[derive(Debug, Clone)]
pub enum TypedMatrix {
    F32(Array2<f32>),
    F16(Array2<f16>),
    I8(QuantizedMatrix),
}

impl TypedMatrix {
    pub fn dtype(&self) -> DType {
        match self {
            TypedMatrix::F32(_) => DType::F32,
            TypedMatrix::F16(_) => DType::F16,
            TypedMatrix::I8(_) => DType::I8,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        match self {
            TypedMatrix::F32(w) => [w.nrows(), w.ncols()],
            TypedMatrix::F16(w) => [w.nrows(), w.ncols()],
            TypedMatrix::I8(q) => q.shape(),
        }
    }

    /// Memory usage in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            TypedMatrix::F32(w) => DType::F32.buffer_size_for_shape(w.shape()),
            TypedMatrix::F16(w) => DType::F16.buffer_size_for_shape(w.shape()),
            TypedMatrix::I8(q) => q.size_bytes(),
        }
    }

    /// Widens the stored values back to F32.
    pub fn to_f32(&self) -> Array2<f32> {
        match self {
            TypedMatrix::F32(w) => w.clone(),
            TypedMatrix::F16(w) => w.mapv(|v| v.to_f32()),
            TypedMatrix::I8(q) => q.dequantize(),
        }
    }
}

impl From<Array2<f32>> for TypedMatrix {
    fn from(arr: Array2<f32>) -> Self {
        TypedMatrix::F32(arr)
    }
}

impl From<Array2<f16>> for TypedMatrix {
    fn from(arr: Array2<f16>) -> Self {
        TypedMatrix::F16(arr)
    }
}

impl From<QuantizedMatrix> for TypedMatrix {
    fn from(q: QuantizedMatrix) -> Self {
        TypedMatrix::I8(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_size_bytes_per_dtype() {
        let w = Array2::<f32>::ones((4, 8));
        let half = w.mapv(f16::from_f32);
        let q = QuantizedMatrix::quantize(&w, ScaleGranularity::PerChannel);

        assert_eq!(TypedMatrix::from(w).size_bytes(), 128);
        assert_eq!(TypedMatrix::from(half).size_bytes(), 64);
        assert_eq!(TypedMatrix::from(q).size_bytes(), 32 + 8 * 4);
    }

    #[test]
    fn test_to_f32_from_half() {
        let w = array![[0.5f32, -0.25], [1.0, 2.0]];
        let typed = TypedMatrix::F16(w.mapv(f16::from_f32));
        assert_eq!(typed.dtype(), DType::F16);
        assert_eq!(typed.shape(), [2, 2]);
        assert_eq!(typed.to_f32(), w);
    }
}
