//! Layer normalization and the residual wiring around sublayers.

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::ops::add_inplace;

/// Where a sublayer applies its layer norm relative to the residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormPlacement {
    /// norm -> sublayer -> add (GPT / OpenNMT style)
    #[serde(alias = "pre")]
    PreNorm,
    /// sublayer -> add -> norm (BERT style)
    #[serde(alias = "post")]
    PostNorm,
}

impl NormPlacement {
    /// Wraps `sublayer` with its layer norm and the residual add.
    ///
    /// ```text
    /// pre:  x ──┬── LN ──► sublayer ──► + ──► out
    ///           └───────────────────────┘
    /// post: x ──┬── sublayer ──► + ──► LN ──► out
    ///           └────────────────┘
    /// ```
    pub fn residual<F>(self, norm: &LayerNorm, mut hidden: Array2<f32>, sublayer: F) -> Result<Array2<f32>>
    where
        F: FnOnce(&ArrayView2<f32>) -> Result<Array2<f32>>,
    {
        match self {
            NormPlacement::PreNorm => {
                let normed = norm.forward(&hidden.view());
                let out = sublayer(&normed.view())?;
                add_inplace(&mut hidden, &out.view());
                Ok(hidden)
            }
            NormPlacement::PostNorm => {
                let out = sublayer(&hidden.view())?;
                add_inplace(&mut hidden, &out.view());
                Ok(norm.forward(&hidden.view()))
            }
        }
    }
}

/// Layer normalization
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.len()
    }

    /// Normalizes every row of a `[tokens, hidden]` matrix.
    pub fn forward(&self, hidden: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = hidden.to_owned();
        Zip::from(out.axis_iter_mut(Axis(0))).par_for_each(|mut row| {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            Zip::from(&mut row)
                .and(&self.weight)
                .and(&self.bias)
                .for_each(|x, &g, &b| *x = (*x - mean) * inv_std * g + b);
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_layer_norm_basic() {
        let layer_norm = LayerNorm::new(arr1(&[1.0, 1.0, 1.0]), arr1(&[0.0, 0.0, 0.0]), 1e-6);

        // Mean = 2.0, Variance = 2/3
        let hidden = Array2::from_shape_vec((1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let output = layer_norm.forward(&hidden.view());

        assert!((output[[0, 0]] - (-1.2247)).abs() < 1e-3);
        assert!((output[[0, 1]] - 0.0).abs() < 1e-5);
        assert!((output[[0, 2]] - 1.2247).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_with_scale_and_bias() {
        let eps = 1e-6;
        let layer_norm = LayerNorm::new(arr1(&[2.0, 0.5, 1.5]), arr1(&[1.0, -1.0, 0.5]), eps);

        let hidden = Array2::from_shape_vec((1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let output = layer_norm.forward(&hidden.view());

        let std = (2.0f32 / 3.0 + eps).sqrt();
        let expected = [
            (1.0 - 2.0) / std * 2.0 + 1.0,
            0.0 * 0.5 - 1.0,
            (3.0 - 2.0) / std * 1.5 + 0.5,
        ];
        for (got, want) in output.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rows_are_independent() {
        let layer_norm = LayerNorm::new(arr1(&[1.0, 1.0]), arr1(&[0.0, 0.0]), 1e-5);
        let hidden = Array2::from_shape_vec((2, 2), vec![1.0, 3.0, 5.0, 9.0]).unwrap();
        let output = layer_norm.forward(&hidden.view());

        assert!((output[[0, 0]] + 1.0).abs() < 1e-3);
        assert!((output[[0, 1]] - 1.0).abs() < 1e-3);
        assert!((output[[1, 0]] + 1.0).abs() < 1e-3);
        assert!((output[[1, 1]] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_residual_placements() {
        let norm = LayerNorm::new(arr1(&[1.0, 1.0]), arr1(&[0.0, 0.0]), 1e-6);
        let hidden = Array2::from_shape_vec((1, 2), vec![1.0, 3.0]).unwrap();
        let double = |x: &ArrayView2<f32>| -> Result<Array2<f32>> { Ok(x.mapv(|v| 2.0 * v)) };

        // pre: x + 2 * LN(x) = [1 - 2, 3 + 2]
        let pre = NormPlacement::PreNorm.residual(&norm, hidden.clone(), double).unwrap();
        assert!((pre[[0, 0]] + 1.0).abs() < 1e-3);
        assert!((pre[[0, 1]] - 5.0).abs() < 1e-3);

        // post: LN(x + 2x) = LN([3, 9]) = [-1, 1]
        let post = NormPlacement::PostNorm.residual(&norm, hidden, double).unwrap();
        assert!((post[[0, 0]] + 1.0).abs() < 1e-3);
        assert!((post[[0, 1]] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_placement_serde_aliases() {
        let pre: NormPlacement = serde_json::from_str("\"pre\"").unwrap();
        let post: NormPlacement = serde_json::from_str("\"post_norm\"").unwrap();
        assert_eq!(pre, NormPlacement::PreNorm);
        assert_eq!(post, NormPlacement::PostNorm);
    }
}
