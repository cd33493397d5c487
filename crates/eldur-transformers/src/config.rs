//! Model and engine configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::cache::CacheLayout;
use crate::error::EngineError;
use crate::normalization::NormPlacement;
use crate::quantize::{Int8Mode, Precision, WeightConversion};

fn default_max_seq_len() -> usize {
    512
}
fn default_max_decode_len() -> usize {
    128
}
fn default_layer_norm_eps() -> f32 {
    1e-6
}
fn default_encoder_norm() -> NormPlacement {
    NormPlacement::PostNorm
}
fn default_decoder_norm() -> NormPlacement {
    NormPlacement::PreNorm
}

/// Shape and execution options shared by the encoder and decoder stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub layer_num: usize,
    pub head_num: usize,
    pub head_size: usize,
    pub hidden_dim: usize,
    /// Width of the encoder output consumed by cross-attention.
    /// Defaults to `hidden_dim`.
    #[serde(default)]
    pub memory_hidden_dim: Option<usize>,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_max_decode_len")]
    pub max_decode_len: usize,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub int8_mode: Int8Mode,
    #[serde(default)]
    pub remove_padding: bool,
    /// Ask for the batch-major self-attention cache when alignment allows.
    #[serde(default)]
    pub batch_major_cache: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_encoder_norm")]
    pub encoder_norm: NormPlacement,
    #[serde(default = "default_decoder_norm")]
    pub decoder_norm: NormPlacement,
}

impl EngineConfig {
    /// A configuration with every optional field at its default.
    pub fn new(layer_num: usize, head_num: usize, head_size: usize) -> Self {
        Self {
            layer_num,
            head_num,
            head_size,
            hidden_dim: head_num * head_size,
            memory_hidden_dim: None,
            max_seq_len: default_max_seq_len(),
            max_decode_len: default_max_decode_len(),
            precision: Precision::default(),
            int8_mode: Int8Mode::default(),
            remove_padding: false,
            batch_major_cache: false,
            layer_norm_eps: default_layer_norm_eps(),
            activation: Activation::default(),
            encoder_norm: default_encoder_norm(),
            decoder_norm: default_decoder_norm(),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_json_str(&content)
    }

    pub fn memory_hidden_dim(&self) -> usize {
        self.memory_hidden_dim.unwrap_or(self.hidden_dim)
    }

    pub fn weight_conversion(&self) -> WeightConversion {
        WeightConversion {
            precision: self.precision,
            int8_mode: self.int8_mode,
        }
    }

    /// Layout every decode session of this model uses.
    pub fn cache_layout(&self) -> CacheLayout {
        CacheLayout::select(self.precision, self.head_size, self.batch_major_cache)
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_num * self.head_size != self.hidden_dim {
            return Err(EngineError::shape(format!(
                "head_num ({}) * head_size ({}) != hidden_dim ({})",
                self.head_num, self.head_size, self.hidden_dim
            ))
            .into());
        }
        if self.layer_num == 0 || self.head_num == 0 || self.head_size == 0 {
            return Err(EngineError::shape("layer_num, head_num and head_size must be non-zero").into());
        }
        if self.max_seq_len == 0 || self.max_decode_len == 0 {
            return Err(EngineError::shape("max_seq_len and max_decode_len must be non-zero").into());
        }
        if self.memory_hidden_dim() == 0 {
            return Err(EngineError::shape("memory_hidden_dim must be non-zero").into());
        }
        Ok(())
    }
}
