//! One-time weight precision conversion.
//!
//! A [`WeightConversion`] is resolved from the model configuration and then
//! applied to every projection while the layer stacks are being built.
//! Nothing converts weights after construction.

use std::fmt;

use anyhow::Result;
use half::f16;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::linear_layer::LinearLayer;
use crate::tensor::ScaleGranularity;

/// Floating-point storage precision of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

/// Int8 execution mode.
///
/// Serialized as the integer codes `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Int8Mode {
    /// Weights keep their floating-point precision.
    #[default]
    Disabled,
    /// Int8 weights with one symmetric scale per output channel; float activations.
    PerChannel,
    /// Int8 weights with one scale per tensor; float activations.
    PerTensor,
    /// Int8 weights with one scale per tensor; each activation row is also
    /// quantized to int8 and the GEMM accumulates in i32.
    PerTensorQuantizedActivations,
}

impl Int8Mode {
    pub fn code(self) -> i64 {
        match self {
            Int8Mode::Disabled => 0,
            Int8Mode::PerChannel => 1,
            Int8Mode::PerTensor => 2,
            Int8Mode::PerTensorQuantizedActivations => 3,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Int8Mode::Disabled
    }

    fn granularity(self) -> Option<ScaleGranularity> {
        match self {
            Int8Mode::Disabled => None,
            Int8Mode::PerChannel => Some(ScaleGranularity::PerChannel),
            Int8Mode::PerTensor | Int8Mode::PerTensorQuantizedActivations => {
                Some(ScaleGranularity::PerTensor)
            }
        }
    }
}

impl TryFrom<i64> for Int8Mode {
    type Error = EngineError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Int8Mode::Disabled),
            1 => Ok(Int8Mode::PerChannel),
            2 => Ok(Int8Mode::PerTensor),
            3 => Ok(Int8Mode::PerTensorQuantizedActivations),
            other => Err(EngineError::UnsupportedMode(other)),
        }
    }
}

impl From<Int8Mode> for i64 {
    fn from(mode: Int8Mode) -> Self {
        mode.code()
    }
}

impl fmt::Display for Int8Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Int8Mode::Disabled => "disabled",
            Int8Mode::PerChannel => "per-channel",
            Int8Mode::PerTensor => "per-tensor",
            Int8Mode::PerTensorQuantizedActivations => "per-tensor+activations",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Target storage for every projection of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeightConversion {
    pub precision: Precision,
    pub int8_mode: Int8Mode,
}

impl WeightConversion {
    /// Validates the raw mode code.
    pub fn new(precision: Precision, int8_mode: i64) -> Result<Self> {
        let int8_mode = Int8Mode::try_from(int8_mode)?;
        Ok(Self {
            precision,
            int8_mode,
        })
    }

    /// Int8 takes priority over half precision for projection kernels.
    pub fn apply(&self, layer: LinearLayer) -> LinearLayer {
        match (self.int8_mode.granularity(), self.precision) {
            (Some(granularity), _) => layer.into_int8(
                granularity,
                self.int8_mode == Int8Mode::PerTensorQuantizedActivations,
            ),
            (None, Precision::Half) => layer.into_half(),
            (None, Precision::Full) => layer,
        }
    }

    /// Builds a projection from a `[in, out]` kernel and converts it.
    pub fn linear(&self, kernel: Array2<f32>, bias: Array1<f32>) -> Result<LinearLayer> {
        Ok(self.apply(LinearLayer::new_f32(kernel, Some(bias))?))
    }
}

/// f32 -> f16 -> f32, the value a half-precision weight actually holds.
pub fn round_trip_half(weights: &Array2<f32>) -> Array2<f32> {
    weights.mapv(|w| f16::from_f32(w).to_f32())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, QuantizedMatrix, TypedMatrix};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::{rngs::StdRng, SeedableRng};

    fn random_weights(seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::random_using((32, 48), Uniform::new_inclusive(-1.0f32, 1.0), &mut rng)
    }

    #[test]
    fn test_mode_codes() {
        for code in 0..=3 {
            assert_eq!(Int8Mode::try_from(code).unwrap().code(), code);
        }
        assert_eq!(Int8Mode::try_from(4), Err(EngineError::UnsupportedMode(4)));
        assert_eq!(Int8Mode::try_from(-1), Err(EngineError::UnsupportedMode(-1)));
    }

    #[test]
    fn test_unsupported_mode_from_conversion() {
        let err = WeightConversion::new(Precision::Full, 4).unwrap_err();
        assert_eq!(EngineError::find(&err), Some(&EngineError::UnsupportedMode(4)));
    }

    #[test]
    fn test_mode_serde_as_integer() {
        let mode: Int8Mode = serde_json::from_str("2").unwrap();
        assert_eq!(mode, Int8Mode::PerTensor);
        assert_eq!(serde_json::to_string(&Int8Mode::PerChannel).unwrap(), "1");
        assert!(serde_json::from_str::<Int8Mode>("9").is_err());
    }

    #[test]
    fn test_half_round_trip_error_bound() {
        let w = random_weights(1);
        let back = round_trip_half(&w);
        // f16 has a 10-bit mantissa; for |x| <= 1 the rounding error is at most 2^-12.
        for (a, b) in w.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 2f32.powi(-12), "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_int8_per_channel_within_half_step() {
        let w = random_weights(2);
        let q = QuantizedMatrix::quantize(&w, ScaleGranularity::PerChannel);
        let back = q.dequantize();

        for ((i, j), &orig) in w.indexed_iter() {
            let step = q.scale(j);
            assert!(
                (orig - back[[i, j]]).abs() <= step / 2.0 + 1e-7,
                "column {} error exceeds half step",
                j
            );
        }
    }

    #[test]
    fn test_apply_selects_storage() {
        let kernel = random_weights(3);
        let bias = Array1::zeros(48);

        let full = WeightConversion::new(Precision::Full, 0).unwrap();
        let half = WeightConversion::new(Precision::Half, 0).unwrap();
        let int8 = WeightConversion::new(Precision::Half, 1).unwrap();
        let act = WeightConversion::new(Precision::Full, 3).unwrap();

        assert_eq!(full.linear(kernel.clone(), bias.clone()).unwrap().dtype(), DType::F32);
        assert_eq!(half.linear(kernel.clone(), bias.clone()).unwrap().dtype(), DType::F16);

        let per_channel = int8.linear(kernel.clone(), bias.clone()).unwrap();
        match per_channel.weight() {
            TypedMatrix::I8(q) => assert_eq!(q.granularity, ScaleGranularity::PerChannel),
            other => panic!("expected int8 weights, got {:?}", other.dtype()),
        }

        let with_act = act.linear(kernel, bias).unwrap();
        assert!(with_act.quantizes_input());
        match with_act.weight() {
            TypedMatrix::I8(q) => assert_eq!(q.scales.len(), 1),
            other => panic!("expected int8 weights, got {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Int8Mode::PerChannel.to_string(), "per-channel (1)");
    }
}
