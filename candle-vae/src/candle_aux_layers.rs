use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Number of stride-2 stages in the frame encoder/decoder
pub const NUM_DOWNSAMPLE: usize = 3;

/// Channel width of each stage: 16, 32, 64 times the multiplier
pub fn stage_channels(size_multiplier: usize) -> Vec<usize> {
    (0..NUM_DOWNSAMPLE)
        .map(|j| (16 << j) * size_multiplier.max(1))
        .collect()
}

/// 4x4 kernel, stride 2, padding 1: halves height and width
pub fn downsample_config() -> candle_nn::Conv2dConfig {
    candle_nn::Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    }
}

/// 4x4 kernel, stride 2, padding 1: doubles height and width
pub fn upsample_config() -> candle_nn::ConvTranspose2dConfig {
    candle_nn::ConvTranspose2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    }
}

pub const KERNEL_SIZE: usize = 4;
