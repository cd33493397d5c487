//! Position-wise feed-forward network and its normalized residual block.

use anyhow::Result;
use ndarray::{Array2, ArrayView2};

use crate::activations::{apply_activation_2d, Activation};
use crate::linear_layer::LinearLayer;
use crate::normalization::{LayerNorm, NormPlacement};
use crate::quantize::WeightConversion;
use crate::weights::{FeedForwardWeights, LayerNormWeights};

/// `fc2(activation(fc1(x)))` with `fc1: hidden -> 4 * hidden`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: LinearLayer,
    fc2: LinearLayer,
    activation: Activation,
}

impl FeedForward {
    pub fn new(
        weights: &FeedForwardWeights,
        activation: Activation,
        conversion: &WeightConversion,
    ) -> Result<Self> {
        Ok(Self {
            fc1: conversion.linear(weights.inter_kernel.clone(), weights.inter_bias.clone())?,
            fc2: conversion.linear(weights.out_kernel.clone(), weights.out_bias.clone())?,
            activation,
        })
    }

    pub fn forward(&self, hidden: &ArrayView2<f32>) -> Array2<f32> {
        let mut intermediate = self.fc1.matmul(hidden);
        apply_activation_2d(&mut intermediate, self.activation);
        self.fc2.matmul(&intermediate.view())
    }

    pub fn intermediate_size(&self) -> usize {
        self.fc1.out_features()
    }
}

/// Feed-forward sublayer with its layer norm and residual.
#[derive(Debug, Clone)]
pub struct FeedForwardBlock {
    ffn: FeedForward,
    norm: LayerNorm,
    placement: NormPlacement,
}

impl FeedForwardBlock {
    pub fn new(
        weights: &FeedForwardWeights,
        norm: &LayerNormWeights,
        activation: Activation,
        placement: NormPlacement,
        eps: f32,
        conversion: &WeightConversion,
    ) -> Result<Self> {
        Ok(Self {
            ffn: FeedForward::new(weights, activation, conversion)?,
            norm: norm.to_layer_norm(eps),
            placement,
        })
    }

    /// `hidden` is `[rows, hidden_dim]`; rows are independent, so padded and
    /// compacted inputs go through the same code.
    pub fn forward(&self, hidden: Array2<f32>) -> Result<Array2<f32>> {
        self.placement
            .residual(&self.norm, hidden, |x| Ok(self.ffn.forward(x)))
    }
}
