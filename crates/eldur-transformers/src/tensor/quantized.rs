//! Symmetric int8 weight storage.
//!
//! Weights use the `[in_features, out_features]` layout, so an output channel
//! is a column. Quantization is symmetric:
//!
//! 1. `max_abs = max(|w|)` over the channel (or the whole tensor)
//! 2. `scale = max_abs / 127`
//! 3. `q = round(w / scale)` clamped to `[-127, 127]`
//!
//! Dequantization recovers `w' = q * scale`, so `|w - w'| <= scale / 2`.

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// How many scale factors a quantized tensor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleGranularity {
    /// One scale per output channel (column).
    PerChannel,
    /// A single scale for the whole tensor.
    PerTensor,
}

#[derive(Debug, Clone)]
pub struct QuantizedMatrix {
    pub values: Array2<i8>,
    /// `[out_features]` for per-channel, `[1]` for per-tensor.
    pub scales: Array1<f32>,
    pub granularity: ScaleGranularity,
}

fn scale_for(max_abs: f32) -> f32 {
    if max_abs > 0.0 {
        max_abs / 127.0
    } else {
        1.0
    }
}

#[inline]
pub fn quantize_value(x: f32, inv_scale: f32) -> i8 {
    (x * inv_scale).round().clamp(-127.0, 127.0) as i8
}

impl QuantizedMatrix {
    pub fn quantize(weights: &Array2<f32>, granularity: ScaleGranularity) -> Self {
        let (rows, cols) = weights.dim();
        let scales = match granularity {
            ScaleGranularity::PerChannel => weights
                .fold_axis(Axis(0), 0.0f32, |acc, &x| acc.max(x.abs()))
                .mapv(scale_for),
            ScaleGranularity::PerTensor => {
                let max_abs = weights.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
                Array1::from_elem(1, scale_for(max_abs))
            }
        };

        let mut values = Array2::<i8>::zeros((rows, cols));
        Zip::from(values.rows_mut())
            .and(weights.rows())
            .par_for_each(|mut q_row, w_row| {
                for (j, (q, &w)) in q_row.iter_mut().zip(w_row.iter()).enumerate() {
                    let scale = match granularity {
                        ScaleGranularity::PerChannel => scales[j],
                        ScaleGranularity::PerTensor => scales[0],
                    };
                    *q = quantize_value(w, 1.0 / scale);
                }
            });

        Self {
            values,
            scales,
            granularity,
        }
    }

    /// Scale of output channel `col`.
    #[inline]
    pub fn scale(&self, col: usize) -> f32 {
        match self.granularity {
            ScaleGranularity::PerChannel => self.scales[col],
            ScaleGranularity::PerTensor => self.scales[0],
        }
    }

    /// Per-column scales broadcast to `[out_features]` regardless of granularity.
    pub fn column_scales(&self) -> Array1<f32> {
        match self.granularity {
            ScaleGranularity::PerChannel => self.scales.clone(),
            ScaleGranularity::PerTensor => Array1::from_elem(self.values.ncols(), self.scales[0]),
        }
    }

    /// Dequantize to F32 (expensive, avoid in hot paths)
    pub fn dequantize(&self) -> Array2<f32> {
        let col_scales = self.column_scales();
        let mut out = self.values.mapv(|q| q as f32);
        for mut row in out.rows_mut() {
            row *= &col_scales;
        }
        out
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.values.nrows(), self.values.ncols()]
    }

    pub fn size_bytes(&self) -> usize {
        self.values.len() + self.scales.len() * 4
    }
}

/// Quantizes one activation row with its own symmetric scale.
pub fn quantize_row(row: ArrayView1<f32>) -> (Vec<i8>, f32) {
    let max_abs = row.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
    let scale = scale_for(max_abs);
    let inv = 1.0 / scale;
    (row.iter().map(|&x| quantize_value(x, inv)).collect(), scale)
}
