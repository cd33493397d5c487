//! A CPU linear layer over full, half or int8 weight storage.
//!
//! Weights are stored as `[in_features, out_features]` so the forward pass is
//! a plain `x @ W` handed to faer without a transpose. Once built, a layer has
//! no mutating API; precision changes consume the layer and return a new one.

use anyhow::Result;
use half::f16;
use ndarray::{Array1, Array2, ArrayView2, Zip};

use crate::error::EngineError;
use crate::ops::matmul::{matmul_2d, matmul_2d_i8};
use crate::tensor::quantized::quantize_row;
use crate::tensor::{DType, QuantizedMatrix, ScaleGranularity, TypedMatrix};

/// A linear transformation `y = x @ W + b`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    weight: TypedMatrix,
    bias: Option<Array1<f32>>,
    /// Quantize each activation row to int8 before an int8 GEMM.
    quantize_input: bool,
}

impl LinearLayer {
    /// Builds a full-precision layer from a `[in, out]` kernel.
    pub fn new_f32(kernel: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != kernel.ncols() {
                return Err(EngineError::shape(format!(
                    "bias has {} entries, kernel has {} output features",
                    b.len(),
                    kernel.ncols()
                ))
                .into());
            }
        }
        Ok(Self {
            weight: TypedMatrix::F32(kernel),
            bias,
            quantize_input: false,
        })
    }

    /// Computes `x @ W + b` for `x: [tokens, in_features]`.
    #[inline]
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = match &self.weight {
            TypedMatrix::F32(w) => matmul_2d(input, &w.view()),
            TypedMatrix::F16(w) => matmul_2d_f16(input, &w.view()),
            TypedMatrix::I8(q) if self.quantize_input => matmul_quantized_input(input, q),
            TypedMatrix::I8(q) => matmul_dequant_i8(input, q),
        };
        if let Some(bias) = &self.bias {
            result += bias;
        }
        result
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }

    pub fn weight(&self) -> &TypedMatrix {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn quantizes_input(&self) -> bool {
        self.quantize_input
    }

    /// Stores the kernel as f16. Biases stay f32.
    pub fn into_half(self) -> Self {
        let weight = match self.weight {
            TypedMatrix::F32(w) => TypedMatrix::F16(w.mapv(f16::from_f32)),
            other => other,
        };
        Self { weight, ..self }
    }

    /// Quantizes the kernel to symmetric int8.
    pub fn into_int8(self, granularity: ScaleGranularity, quantize_input: bool) -> Self {
        let weight = match self.weight {
            TypedMatrix::I8(q) => TypedMatrix::I8(q),
            other => TypedMatrix::I8(QuantizedMatrix::quantize(&other.to_f32(), granularity)),
        };
        Self {
            weight,
            bias: self.bias,
            quantize_input,
        }
    }
}

/// Widens the f16 kernel once per call and runs the f32 GEMM.
fn matmul_2d_f16(input: &ArrayView2<f32>, weight: &ArrayView2<f16>) -> Array2<f32> {
    let widened = weight.mapv(|v| v.to_f32());
    matmul_2d(input, &widened.view())
}

/// Float activations against int8 weights: GEMM on the raw int8 values, then
/// one multiply by the column scale.
fn matmul_dequant_i8(input: &ArrayView2<f32>, weight: &QuantizedMatrix) -> Array2<f32> {
    let raw = weight.values.mapv(|q| q as f32);
    let mut out = matmul_2d(input, &raw.view());
    let scales = weight.column_scales();
    Zip::from(out.rows_mut()).par_for_each(|mut row| row *= &scales);
    out
}

fn matmul_quantized_input(input: &ArrayView2<f32>, weight: &QuantizedMatrix) -> Array2<f32> {
    let (rows, row_scales): (Vec<Vec<i8>>, Vec<f32>) =
        input.rows().into_iter().map(quantize_row).unzip();
    let col_scales = weight.column_scales().to_vec();
    matmul_2d_i8(&rows, &row_scales, &weight.values.view(), &col_scales)
}
