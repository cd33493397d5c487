use serde::{Deserialize, Serialize};

/// Storage element type of a weight or cache buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Standard 32-bit float
    F32,
    /// 16-bit float (IEEE 754 half-precision)
    F16,
    /// Symmetric 8-bit integer with external f32 scales
    I8,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I8 => 1,
        }
    }

    /// Bytes needed to hold a tensor of `shape`, excluding quantization scales.
    pub fn buffer_size_for_shape(&self, shape: &[usize]) -> usize {
        shape.iter().product::<usize>() * self.size_of()
    }

    /// Converts to the safetensors tag used in checkpoints.
    pub fn to_safetensors(&self) -> safetensors::Dtype {
        match self {
            DType::F32 => safetensors::Dtype::F32,
            DType::F16 => safetensors::Dtype::F16,
            DType::I8 => safetensors::Dtype::I8,
        }
    }

    pub fn from_safetensors(dtype: safetensors::Dtype) -> anyhow::Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::I8 => Ok(DType::I8),
            other => Err(anyhow::anyhow!("unsupported safetensors dtype: {:?}", other)),
        }
    }
}
