//! Square-kernel 2D convolutions over `(batch, channels, height, width)`.
//!
//! [`Conv2d`] stores its kernel as `(out, in, k, k)` and [`ConvTranspose2d`]
//! as `(in, out, k, k)`, the layouts expected by candle's kernels. Output
//! sizes follow the usual formulas:
//!
//! * convolution: `(h + 2p - k) / s + 1`
//! * transposed: `(h - 1) * s - 2p + k`
//!
//! Fan-in for the default initialisation is `in * k * k` for the regular
//! convolution and `out * k * k` for the transposed one, since the latter's
//! weight tensor is laid out with the output channels second.

use candle_core::{Result, Tensor, Var};

use crate::{checks, init::ParamInit, Layer, LayerKind, ParamRole};

/// Geometry shared by both convolution flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: 0,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }
}

fn add_channel_bias(output: Tensor, bias: &Var) -> Result<Tensor> {
    let channels = bias.as_tensor().dim(0)?;
    output.broadcast_add(&bias.as_tensor().reshape((1, channels, 1, 1))?)
}

/// Strided 2D convolution with a per-channel bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    config: Conv2dConfig,
    weight: Var,
    bias: Var,
}

impl Conv2d {
    pub fn new(config: Conv2dConfig, init: &mut ParamInit) -> Result<Self> {
        let fan_in = Self::fan_in(&config);
        let weight = init.create(
            LayerKind::Convolution,
            ParamRole::Weight,
            &[
                config.out_channels,
                config.in_channels,
                config.kernel,
                config.kernel,
            ],
            fan_in,
        )?;
        let bias = init.create(
            LayerKind::Convolution,
            ParamRole::Bias,
            &[config.out_channels],
            fan_in,
        )?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    fn fan_in(config: &Conv2dConfig) -> usize {
        config.in_channels * config.kernel * config.kernel
    }
}

impl Layer for Conv2d {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_nchw("conv2d.input", input, self.config.in_channels)?;
        let output = input.conv2d(
            self.weight.as_tensor(),
            self.config.padding,
            self.config.stride,
            1,
            1,
        )?;
        add_channel_bias(output, &self.bias)
    }

    fn parameters(&self) -> Vec<(&'static str, Var)> {
        vec![("weight", self.weight.clone()), ("bias", self.bias.clone())]
    }

    fn reset_parameters(&self, init: &mut ParamInit) -> Result<()> {
        let fan_in = Self::fan_in(&self.config);
        init.reset(&self.weight, LayerKind::Convolution, ParamRole::Weight, fan_in)?;
        init.reset(&self.bias, LayerKind::Convolution, ParamRole::Bias, fan_in)
    }
}

/// Strided transposed convolution ("deconvolution") with a per-channel bias.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    config: Conv2dConfig,
    weight: Var,
    bias: Var,
}

impl ConvTranspose2d {
    pub fn new(config: Conv2dConfig, init: &mut ParamInit) -> Result<Self> {
        let fan_in = Self::fan_in(&config);
        let weight = init.create(
            LayerKind::Convolution,
            ParamRole::Weight,
            &[
                config.in_channels,
                config.out_channels,
                config.kernel,
                config.kernel,
            ],
            fan_in,
        )?;
        let bias = init.create(
            LayerKind::Convolution,
            ParamRole::Bias,
            &[config.out_channels],
            fan_in,
        )?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    fn fan_in(config: &Conv2dConfig) -> usize {
        config.out_channels * config.kernel * config.kernel
    }
}

impl Layer for ConvTranspose2d {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_nchw("conv_transpose2d.input", input, self.config.in_channels)?;
        let output = input.conv_transpose2d(
            self.weight.as_tensor(),
            self.config.padding,
            0,
            self.config.stride,
            1,
        )?;
        add_channel_bias(output, &self.bias)
    }

    fn parameters(&self) -> Vec<(&'static str, Var)> {
        vec![("weight", self.weight.clone()), ("bias", self.bias.clone())]
    }

    fn reset_parameters(&self, init: &mut ParamInit) -> Result<()> {
        let fan_in = Self::fan_in(&self.config);
        init.reset(&self.weight, LayerKind::Convolution, ParamRole::Weight, fan_in)?;
        init.reset(&self.bias, LayerKind::Convolution, ParamRole::Bias, fan_in)
    }
}
