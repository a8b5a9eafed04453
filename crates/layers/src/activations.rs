//! Activation catalogue for the convolutional GAN stacks.
//!
//! Activations are shape preserving and parameter free, so they can sit
//! anywhere in a [`Sequential`](crate::Sequential).
//!
//! # Built-in formulas
//!
//! * **LeakyReLU** computes `max(x, slope * x)`, valid for `0 <= slope <= 1`.
//! * **Sigmoid** computes `1 / (1 + exp(-x))`.
//! * **Exp** is used to keep variance heads strictly positive.

use candle_core::{Error, Result, Tensor};

use crate::{Layer, LayerKind};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    Relu,
    /// Leaky ReLU with the given negative slope.
    LeakyRelu(f64),
    Sigmoid,
    Tanh,
    Exp,
}

/// Shape preserving non-linearity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activation {
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Result<Self> {
        if let ActivationKind::LeakyRelu(slope) = kind {
            if !(0.0..=1.0).contains(&slope) {
                return Err(Error::Msg(format!(
                    "leaky relu slope must be in [0, 1], got {slope}"
                )));
            }
        }
        Ok(Self { kind })
    }

    pub fn activation_kind(&self) -> ActivationKind {
        self.kind
    }

    /// Applies the non-linearity.
    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Relu => input.relu(),
            ActivationKind::LeakyRelu(slope) => input.maximum(&input.affine(slope, 0.0)?),
            ActivationKind::Sigmoid => {
                let denom = (input.neg()?.exp()? + 1.0)?;
                denom.recip()
            }
            ActivationKind::Tanh => input.tanh(),
            ActivationKind::Exp => input.exp(),
        }
    }
}

impl Layer for Activation {
    fn kind(&self) -> LayerKind {
        LayerKind::Other
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        self.apply(input)
    }
}
