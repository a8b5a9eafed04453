//! Building blocks for the InfoGAN generator and discriminator.
//!
//! Every layer owns its trainable parameters as [`candle_core::Var`]s and
//! exposes them by local name so that containers can build dotted parameter
//! paths (`shared.0.weight`). Parameters are sampled on the host from a seeded
//! RNG, which keeps initialisation identical across CPU and accelerator
//! backends.

pub mod activations;
pub mod checks;
pub mod conv;
pub mod init;
pub mod linear;
pub mod norm;
pub mod sequential;

use candle_core::{Result, Tensor, Var};

pub use activations::{Activation, ActivationKind};
pub use conv::{Conv2d, Conv2dConfig, ConvTranspose2d};
pub use init::{InitScheme, LayerKind, ParamInit, ParamRole};
pub use linear::Linear;
pub use norm::{BatchNorm, BatchNormConfig};
pub use sequential::{Reshape, Sequential};

/// Shared interface for every layer that can be stacked in a [`Sequential`].
pub trait Layer: Send + Sync {
    /// Closed tag used by initialisation visitors.
    fn kind(&self) -> LayerKind;

    /// Runs the layer. `train` selects batch statistics for normalisation layers.
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor>;

    /// Trainable parameters keyed by their local name (`weight`, `bias`).
    fn parameters(&self) -> Vec<(&'static str, Var)> {
        Vec::new()
    }

    /// Re-samples parameters according to `init`. Roles the scheme leaves
    /// untouched keep their current values.
    fn reset_parameters(&self, _init: &mut ParamInit) -> Result<()> {
        Ok(())
    }
}
