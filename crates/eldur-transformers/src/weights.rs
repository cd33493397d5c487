//! Named per-layer weight sets.
//!
//! Projection kernels are stored `[in_features, out_features]`. A weight set
//! is either random-initialized (uniform in `[-1, 1]`), built from the
//! positional tensor list used by other runtimes, or read from a safetensors
//! checkpoint whose tensors are named `layers.{i}.{block}.{tensor}`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::{rngs::StdRng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;

use crate::error::EngineError;
use crate::normalization::LayerNorm;

/// Tensors per encoder layer in the positional convention.
pub const ENCODER_TENSORS_PER_LAYER: usize = 16;
/// Tensors per decoder layer in the positional convention.
pub const DECODER_TENSORS_PER_LAYER: usize = 26;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNormWeights {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

impl LayerNormWeights {
    pub fn to_layer_norm(&self, eps: f32) -> LayerNorm {
        LayerNorm::new(self.gamma.clone(), self.beta.clone(), eps)
    }
}

/// Q/K/V and output projections of one attention block.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionWeights {
    pub q_kernel: Array2<f32>,
    pub q_bias: Array1<f32>,
    pub k_kernel: Array2<f32>,
    pub k_bias: Array1<f32>,
    pub v_kernel: Array2<f32>,
    pub v_bias: Array1<f32>,
    pub out_kernel: Array2<f32>,
    pub out_bias: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardWeights {
    /// `[hidden, 4 * hidden]`
    pub inter_kernel: Array2<f32>,
    pub inter_bias: Array1<f32>,
    /// `[4 * hidden, hidden]`
    pub out_kernel: Array2<f32>,
    pub out_bias: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderLayerWeights {
    pub attention: AttentionWeights,
    pub attention_norm: LayerNormWeights,
    pub feed_forward: FeedForwardWeights,
    pub output_norm: LayerNormWeights,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderLayerWeights {
    pub self_attention_norm: LayerNormWeights,
    pub self_attention: AttentionWeights,
    pub cross_attention_norm: LayerNormWeights,
    pub cross_attention: AttentionWeights,
    pub feed_forward_norm: LayerNormWeights,
    pub feed_forward: FeedForwardWeights,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderWeights {
    pub hidden_dim: usize,
    pub layers: Vec<EncoderLayerWeights>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderWeights {
    pub hidden_dim: usize,
    /// Width of the encoder output feeding cross-attention K/V.
    pub memory_hidden_dim: usize,
    pub layers: Vec<DecoderLayerWeights>,
}

// ---------------------------------------------------------------------------
// Random init
// ---------------------------------------------------------------------------

struct RandomInit {
    rng: StdRng,
    dist: Uniform<f32>,
}

impl RandomInit {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dist: Uniform::new_inclusive(-1.0, 1.0),
        }
    }

    fn matrix(&mut self, rows: usize, cols: usize) -> Array2<f32> {
        Array2::random_using((rows, cols), self.dist, &mut self.rng)
    }

    fn vector(&mut self, len: usize) -> Array1<f32> {
        Array1::random_using(len, self.dist, &mut self.rng)
    }

    fn norm(&mut self, hidden: usize) -> LayerNormWeights {
        LayerNormWeights {
            gamma: self.vector(hidden),
            beta: self.vector(hidden),
        }
    }

    fn attention(&mut self, hidden: usize, kv_in: usize) -> AttentionWeights {
        AttentionWeights {
            q_kernel: self.matrix(hidden, hidden),
            q_bias: self.vector(hidden),
            k_kernel: self.matrix(kv_in, hidden),
            k_bias: self.vector(hidden),
            v_kernel: self.matrix(kv_in, hidden),
            v_bias: self.vector(hidden),
            out_kernel: self.matrix(hidden, hidden),
            out_bias: self.vector(hidden),
        }
    }

    fn feed_forward(&mut self, hidden: usize) -> FeedForwardWeights {
        FeedForwardWeights {
            inter_kernel: self.matrix(hidden, 4 * hidden),
            inter_bias: self.vector(4 * hidden),
            out_kernel: self.matrix(4 * hidden, hidden),
            out_bias: self.vector(hidden),
        }
    }
}

impl EncoderWeights {
    /// Every tensor uniform in `[-1, 1]`, reproducible from `seed`.
    pub fn random(layer_num: usize, hidden_dim: usize, seed: u64) -> Self {
        let mut init = RandomInit::new(seed);
        let layers = (0..layer_num)
            .map(|_| EncoderLayerWeights {
                attention: init.attention(hidden_dim, hidden_dim),
                attention_norm: init.norm(hidden_dim),
                feed_forward: init.feed_forward(hidden_dim),
                output_norm: init.norm(hidden_dim),
            })
            .collect();
        Self { hidden_dim, layers }
    }
}

impl DecoderWeights {
    /// Every tensor uniform in `[-1, 1]`, reproducible from `seed`.
    pub fn random(layer_num: usize, hidden_dim: usize, memory_hidden_dim: usize, seed: u64) -> Self {
        let mut init = RandomInit::new(seed);
        let layers = (0..layer_num)
            .map(|_| DecoderLayerWeights {
                self_attention_norm: init.norm(hidden_dim),
                self_attention: init.attention(hidden_dim, hidden_dim),
                cross_attention_norm: init.norm(hidden_dim),
                cross_attention: init.attention(hidden_dim, memory_hidden_dim),
                feed_forward_norm: init.norm(hidden_dim),
                feed_forward: init.feed_forward(hidden_dim),
            })
            .collect();
        Self {
            hidden_dim,
            memory_hidden_dim,
            layers,
        }
    }
}

// ---------------------------------------------------------------------------
// Shape validation
// ---------------------------------------------------------------------------

fn expect_shape(name: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(EngineError::shape(format!(
            "{} has shape {:?}, expected {:?}",
            name, actual, expected
        ))
        .into());
    }
    Ok(())
}

impl LayerNormWeights {
    fn validate(&self, name: &str, hidden: usize) -> Result<()> {
        expect_shape(&format!("{}.gamma", name), self.gamma.shape(), &[hidden])?;
        expect_shape(&format!("{}.beta", name), self.beta.shape(), &[hidden])
    }
}

impl AttentionWeights {
    pub fn validate(&self, name: &str, hidden: usize, kv_in: usize) -> Result<()> {
        expect_shape(&format!("{}.q_kernel", name), self.q_kernel.shape(), &[hidden, hidden])?;
        expect_shape(&format!("{}.q_bias", name), self.q_bias.shape(), &[hidden])?;
        expect_shape(&format!("{}.k_kernel", name), self.k_kernel.shape(), &[kv_in, hidden])?;
        expect_shape(&format!("{}.k_bias", name), self.k_bias.shape(), &[hidden])?;
        expect_shape(&format!("{}.v_kernel", name), self.v_kernel.shape(), &[kv_in, hidden])?;
        expect_shape(&format!("{}.v_bias", name), self.v_bias.shape(), &[hidden])?;
        expect_shape(&format!("{}.out_kernel", name), self.out_kernel.shape(), &[hidden, hidden])?;
        expect_shape(&format!("{}.out_bias", name), self.out_bias.shape(), &[hidden])
    }
}

impl FeedForwardWeights {
    fn validate(&self, name: &str, hidden: usize) -> Result<()> {
        let inter = 4 * hidden;
        expect_shape(&format!("{}.inter_kernel", name), self.inter_kernel.shape(), &[hidden, inter])?;
        expect_shape(&format!("{}.inter_bias", name), self.inter_bias.shape(), &[inter])?;
        expect_shape(&format!("{}.out_kernel", name), self.out_kernel.shape(), &[inter, hidden])?;
        expect_shape(&format!("{}.out_bias", name), self.out_bias.shape(), &[hidden])
    }
}

impl EncoderWeights {
    pub fn validate(&self, hidden_dim: usize) -> Result<()> {
        if self.hidden_dim != hidden_dim {
            return Err(EngineError::shape(format!(
                "encoder weights built for hidden_dim={}, model uses {}",
                self.hidden_dim, hidden_dim
            ))
            .into());
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let p = format!("layers.{}", i);
            layer.attention.validate(&format!("{}.attention", p), hidden_dim, hidden_dim)?;
            layer.attention_norm.validate(&format!("{}.attention_norm", p), hidden_dim)?;
            layer.feed_forward.validate(&format!("{}.feed_forward", p), hidden_dim)?;
            layer.output_norm.validate(&format!("{}.output_norm", p), hidden_dim)?;
        }
        Ok(())
    }
}

impl DecoderWeights {
    pub fn validate(&self, hidden_dim: usize, memory_hidden_dim: usize) -> Result<()> {
        if self.hidden_dim != hidden_dim || self.memory_hidden_dim != memory_hidden_dim {
            return Err(EngineError::shape(format!(
                "decoder weights built for hidden_dim={} memory_hidden_dim={}, model uses {} and {}",
                self.hidden_dim, self.memory_hidden_dim, hidden_dim, memory_hidden_dim
            ))
            .into());
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let p = format!("layers.{}", i);
            layer
                .self_attention_norm
                .validate(&format!("{}.self_attention_norm", p), hidden_dim)?;
            layer
                .self_attention
                .validate(&format!("{}.self_attention", p), hidden_dim, hidden_dim)?;
            layer
                .cross_attention_norm
                .validate(&format!("{}.cross_attention_norm", p), hidden_dim)?;
            layer
                .cross_attention
                .validate(&format!("{}.cross_attention", p), hidden_dim, memory_hidden_dim)?;
            layer
                .feed_forward_norm
                .validate(&format!("{}.feed_forward_norm", p), hidden_dim)?;
            layer.feed_forward.validate(&format!("{}.feed_forward", p), hidden_dim)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Positional tensor lists
// ---------------------------------------------------------------------------

struct Ordered<I> {
    tensors: I,
    index: usize,
}

impl<I: Iterator<Item = ArrayD<f32>>> Ordered<I> {
    fn next(&mut self) -> Result<ArrayD<f32>> {
        let index = self.index;
        self.index += 1;
        self.tensors
            .next()
            .ok_or_else(|| EngineError::shape(format!("missing tensor at position {}", index)).into())
    }

    fn matrix(&mut self) -> Result<Array2<f32>> {
        let index = self.index;
        let t = self.next()?;
        let shape = t.shape().to_vec();
        t.into_dimensionality::<Ix2>().map_err(|_| {
            EngineError::shape(format!("tensor {} has shape {:?}, expected a matrix", index, shape)).into()
        })
    }

    fn vector(&mut self) -> Result<Array1<f32>> {
        let index = self.index;
        let t = self.next()?;
        let shape = t.shape().to_vec();
        t.into_dimensionality::<Ix1>().map_err(|_| {
            EngineError::shape(format!("tensor {} has shape {:?}, expected a vector", index, shape)).into()
        })
    }

    fn norm(&mut self) -> Result<LayerNormWeights> {
        Ok(LayerNormWeights {
            gamma: self.vector()?,
            beta: self.vector()?,
        })
    }

    /// Kernels first, then biases: q, k, v kernels, q, k, v biases, out kernel, out bias.
    fn attention_kernels_first(&mut self) -> Result<AttentionWeights> {
        let q_kernel = self.matrix()?;
        let k_kernel = self.matrix()?;
        let v_kernel = self.matrix()?;
        let q_bias = self.vector()?;
        let k_bias = self.vector()?;
        let v_bias = self.vector()?;
        Ok(AttentionWeights {
            q_kernel,
            q_bias,
            k_kernel,
            k_bias,
            v_kernel,
            v_bias,
            out_kernel: self.matrix()?,
            out_bias: self.vector()?,
        })
    }

    /// Interleaved: q kernel, q bias, k kernel, k bias, ...
    fn attention_interleaved(&mut self) -> Result<AttentionWeights> {
        Ok(AttentionWeights {
            q_kernel: self.matrix()?,
            q_bias: self.vector()?,
            k_kernel: self.matrix()?,
            k_bias: self.vector()?,
            v_kernel: self.matrix()?,
            v_bias: self.vector()?,
            out_kernel: self.matrix()?,
            out_bias: self.vector()?,
        })
    }

    fn feed_forward(&mut self) -> Result<FeedForwardWeights> {
        Ok(FeedForwardWeights {
            inter_kernel: self.matrix()?,
            inter_bias: self.vector()?,
            out_kernel: self.matrix()?,
            out_bias: self.vector()?,
        })
    }
}

fn check_count(kind: &str, got: usize, per_layer: usize, layer_num: usize) -> Result<()> {
    if got != per_layer * layer_num {
        return Err(EngineError::shape(format!(
            "{} weights for {} layers need {} tensors, got {}",
            kind,
            layer_num,
            per_layer * layer_num,
            got
        ))
        .into());
    }
    Ok(())
}

impl EncoderWeights {
    /// Builds from the flat 16-tensors-per-layer list: attention (q, k, v, out
    /// as kernel/bias pairs), attention norm, intermediate, output, output norm.
    pub fn from_ordered(layer_num: usize, tensors: Vec<ArrayD<f32>>) -> Result<Self> {
        check_count("encoder", tensors.len(), ENCODER_TENSORS_PER_LAYER, layer_num)?;
        let mut it = Ordered {
            tensors: tensors.into_iter(),
            index: 0,
        };
        let mut layers = Vec::with_capacity(layer_num);
        for _ in 0..layer_num {
            let attention = it.attention_interleaved()?;
            let attention_norm = it.norm()?;
            let feed_forward = it.feed_forward()?;
            let output_norm = it.norm()?;
            layers.push(EncoderLayerWeights {
                attention,
                attention_norm,
                feed_forward,
                output_norm,
            });
        }
        let hidden_dim = layers
            .first()
            .map(|l| l.attention.q_kernel.nrows())
            .ok_or_else(|| anyhow!("encoder weights need at least one layer"))?;
        let weights = Self { hidden_dim, layers };
        weights.validate(hidden_dim)?;
        Ok(weights)
    }
}

impl DecoderWeights {
    /// Builds from the flat 26-tensors-per-layer list: for self- then
    /// cross-attention a norm (gamma, beta), q/k/v kernels, q/k/v biases and
    /// the output kernel and bias; then the feed-forward norm, intermediate
    /// kernel and bias, and output kernel and bias.
    pub fn from_ordered(layer_num: usize, tensors: Vec<ArrayD<f32>>) -> Result<Self> {
        check_count("decoder", tensors.len(), DECODER_TENSORS_PER_LAYER, layer_num)?;
        let mut it = Ordered {
            tensors: tensors.into_iter(),
            index: 0,
        };
        let mut layers = Vec::with_capacity(layer_num);
        for _ in 0..layer_num {
            let self_attention_norm = it.norm()?;
            let self_attention = it.attention_kernels_first()?;
            let cross_attention_norm = it.norm()?;
            let cross_attention = it.attention_kernels_first()?;
            let feed_forward_norm = it.norm()?;
            let feed_forward = it.feed_forward()?;
            layers.push(DecoderLayerWeights {
                self_attention_norm,
                self_attention,
                cross_attention_norm,
                cross_attention,
                feed_forward_norm,
                feed_forward,
            });
        }
        let first = layers
            .first()
            .ok_or_else(|| anyhow!("decoder weights need at least one layer"))?;
        let hidden_dim = first.self_attention.q_kernel.nrows();
        let memory_hidden_dim = first.cross_attention.k_kernel.nrows();
        let weights = Self {
            hidden_dim,
            memory_hidden_dim,
            layers,
        };
        weights.validate(hidden_dim, memory_hidden_dim)?;
        Ok(weights)
    }
}

// ---------------------------------------------------------------------------
// Safetensors checkpoints
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TensorWriter {
    entries: Vec<(String, Vec<usize>, Vec<u8>)>,
}

impl TensorWriter {
    fn push(&mut self, name: String, shape: &[usize], values: impl Iterator<Item = f32>) {
        let bytes = values.flat_map(f32::to_le_bytes).collect();
        self.entries.push((name, shape.to_vec(), bytes));
    }

    fn norm(&mut self, prefix: &str, w: &LayerNormWeights) {
        self.push(format!("{}.gamma", prefix), w.gamma.shape(), w.gamma.iter().copied());
        self.push(format!("{}.beta", prefix), w.beta.shape(), w.beta.iter().copied());
    }

    fn attention(&mut self, prefix: &str, w: &AttentionWeights) {
        let matrices = [
            ("q_kernel", &w.q_kernel),
            ("k_kernel", &w.k_kernel),
            ("v_kernel", &w.v_kernel),
            ("out_kernel", &w.out_kernel),
        ];
        for (name, m) in matrices {
            self.push(format!("{}.{}", prefix, name), m.shape(), m.iter().copied());
        }
        let vectors = [
            ("q_bias", &w.q_bias),
            ("k_bias", &w.k_bias),
            ("v_bias", &w.v_bias),
            ("out_bias", &w.out_bias),
        ];
        for (name, v) in vectors {
            self.push(format!("{}.{}", prefix, name), v.shape(), v.iter().copied());
        }
    }

    fn feed_forward(&mut self, prefix: &str, w: &FeedForwardWeights) {
        self.push(format!("{}.inter_kernel", prefix), w.inter_kernel.shape(), w.inter_kernel.iter().copied());
        self.push(format!("{}.inter_bias", prefix), w.inter_bias.shape(), w.inter_bias.iter().copied());
        self.push(format!("{}.out_kernel", prefix), w.out_kernel.shape(), w.out_kernel.iter().copied());
        self.push(format!("{}.out_bias", prefix), w.out_bias.shape(), w.out_bias.iter().copied());
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut views = HashMap::with_capacity(self.entries.len());
        for (name, shape, bytes) in &self.entries {
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)
                .with_context(|| format!("invalid tensor {}", name))?;
            views.insert(name.clone(), view);
        }
        Ok(safetensors::serialize(&views, &None)?)
    }
}

struct TensorReader<'a> {
    tensors: SafeTensors<'a>,
}

impl<'a> TensorReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes).context("failed to parse safetensors header")?;
        Ok(Self { tensors })
    }

    fn array(&self, name: &str) -> Result<ArrayD<f32>> {
        let view = self
            .tensors
            .tensor(name)
            .with_context(|| format!("tensor {} not found in checkpoint", name))?;
        if view.dtype() != safetensors::Dtype::F32 {
            return Err(anyhow!("tensor {} has dtype {:?}, expected F32", name, view.dtype()));
        }
        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(ArrayD::from_shape_vec(IxDyn(view.shape()), values)?)
    }

    fn matrix(&self, name: &str) -> Result<Array2<f32>> {
        let arr = self.array(name)?;
        let shape = arr.shape().to_vec();
        arr.into_dimensionality::<Ix2>()
            .map_err(|_| EngineError::shape(format!("{} has shape {:?}, expected a matrix", name, shape)).into())
    }

    fn vector(&self, name: &str) -> Result<Array1<f32>> {
        let arr = self.array(name)?;
        let shape = arr.shape().to_vec();
        arr.into_dimensionality::<Ix1>()
            .map_err(|_| EngineError::shape(format!("{} has shape {:?}, expected a vector", name, shape)).into())
    }

    fn norm(&self, prefix: &str) -> Result<LayerNormWeights> {
        Ok(LayerNormWeights {
            gamma: self.vector(&format!("{}.gamma", prefix))?,
            beta: self.vector(&format!("{}.beta", prefix))?,
        })
    }

    fn attention(&self, prefix: &str) -> Result<AttentionWeights> {
        let m = |n: &str| self.matrix(&format!("{}.{}", prefix, n));
        let v = |n: &str| self.vector(&format!("{}.{}", prefix, n));
        Ok(AttentionWeights {
            q_kernel: m("q_kernel")?,
            q_bias: v("q_bias")?,
            k_kernel: m("k_kernel")?,
            k_bias: v("k_bias")?,
            v_kernel: m("v_kernel")?,
            v_bias: v("v_bias")?,
            out_kernel: m("out_kernel")?,
            out_bias: v("out_bias")?,
        })
    }

    fn feed_forward(&self, prefix: &str) -> Result<FeedForwardWeights> {
        Ok(FeedForwardWeights {
            inter_kernel: self.matrix(&format!("{}.inter_kernel", prefix))?,
            inter_bias: self.vector(&format!("{}.inter_bias", prefix))?,
            out_kernel: self.matrix(&format!("{}.out_kernel", prefix))?,
            out_bias: self.vector(&format!("{}.out_bias", prefix))?,
        })
    }

    /// Number of `layers.{i}.*` groups present.
    fn layer_count(&self) -> usize {
        let mut count = 0;
        for name in self.tensors.names() {
            if let Some(i) = name
                .strip_prefix("layers.")
                .and_then(|rest| rest.split('.').next())
                .and_then(|i| i.parse::<usize>().ok())
            {
                count = count.max(i + 1);
            }
        }
        count
    }
}

fn read_checkpoint(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read checkpoint {:?}", path))
}

impl EncoderWeights {
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let mut w = TensorWriter::default();
        for (i, layer) in self.layers.iter().enumerate() {
            w.attention(&format!("layers.{}.attention", i), &layer.attention);
            w.norm(&format!("layers.{}.attention_norm", i), &layer.attention_norm);
            w.feed_forward(&format!("layers.{}.feed_forward", i), &layer.feed_forward);
            w.norm(&format!("layers.{}.output_norm", i), &layer.output_norm);
        }
        w.serialize()
    }

    pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<Self> {
        let r = TensorReader::new(bytes)?;
        let layers = (0..r.layer_count())
            .map(|i| {
                Ok(EncoderLayerWeights {
                    attention: r.attention(&format!("layers.{}.attention", i))?,
                    attention_norm: r.norm(&format!("layers.{}.attention_norm", i))?,
                    feed_forward: r.feed_forward(&format!("layers.{}.feed_forward", i))?,
                    output_norm: r.norm(&format!("layers.{}.output_norm", i))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let hidden_dim = layers
            .first()
            .map(|l| l.attention.q_kernel.nrows())
            .ok_or_else(|| anyhow!("checkpoint contains no encoder layers"))?;
        let weights = Self { hidden_dim, layers };
        weights.validate(hidden_dim)?;
        Ok(weights)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_safetensors_bytes()?)
            .with_context(|| format!("failed to write checkpoint {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let weights = Self::from_safetensors_bytes(&read_checkpoint(path)?)?;
        log::info!(
            "Loaded encoder weights: {} layers, hidden_dim={} from {:?}",
            weights.layers.len(),
            weights.hidden_dim,
            path.file_name().unwrap_or_default()
        );
        Ok(weights)
    }
}

impl DecoderWeights {
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let mut w = TensorWriter::default();
        for (i, layer) in self.layers.iter().enumerate() {
            w.norm(&format!("layers.{}.self_attention_norm", i), &layer.self_attention_norm);
            w.attention(&format!("layers.{}.self_attention", i), &layer.self_attention);
            w.norm(&format!("layers.{}.cross_attention_norm", i), &layer.cross_attention_norm);
            w.attention(&format!("layers.{}.cross_attention", i), &layer.cross_attention);
            w.norm(&format!("layers.{}.feed_forward_norm", i), &layer.feed_forward_norm);
            w.feed_forward(&format!("layers.{}.feed_forward", i), &layer.feed_forward);
        }
        w.serialize()
    }

    pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<Self> {
        let r = TensorReader::new(bytes)?;
        let layers = (0..r.layer_count())
            .map(|i| {
                Ok(DecoderLayerWeights {
                    self_attention_norm: r.norm(&format!("layers.{}.self_attention_norm", i))?,
                    self_attention: r.attention(&format!("layers.{}.self_attention", i))?,
                    cross_attention_norm: r.norm(&format!("layers.{}.cross_attention_norm", i))?,
                    cross_attention: r.attention(&format!("layers.{}.cross_attention", i))?,
                    feed_forward_norm: r.norm(&format!("layers.{}.feed_forward_norm", i))?,
                    feed_forward: r.feed_forward(&format!("layers.{}.feed_forward", i))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let first = layers
            .first()
            .ok_or_else(|| anyhow!("checkpoint contains no decoder layers"))?;
        let hidden_dim = first.self_attention.q_kernel.nrows();
        let memory_hidden_dim = first.cross_attention.k_kernel.nrows();
        let weights = Self {
            hidden_dim,
            memory_hidden_dim,
            layers,
        };
        weights.validate(hidden_dim, memory_hidden_dim)?;
        Ok(weights)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_safetensors_bytes()?)
            .with_context(|| format!("failed to write checkpoint {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let weights = Self::from_safetensors_bytes(&read_checkpoint(path)?)?;
        log::info!(
            "Loaded decoder weights: {} layers, hidden_dim={} from {:?}",
            weights.layers.len(),
            weights.hidden_dim,
            path.file_name().unwrap_or_default()
        );
        Ok(weights)
    }
}
