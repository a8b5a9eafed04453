//! InfoGAN networks and the contracts the training loop drives them through.
//!
//! The trainer only sees [`GeneratorNet`] and [`DiscriminatorNet`]; the MNIST
//! architectures in [`generator`] and [`discriminator`] are one implementation
//! and can be swapped for stubs in tests.

pub mod config;
pub mod discriminator;
pub mod generator;

use candle_core::{Result, Tensor, Var};
use layers::ParamInit;

pub use config::{ImageShape, LatentLayout, ModelConfig};
pub use discriminator::MnistDiscriminator;
pub use generator::MnistGenerator;

/// Maps latent vectors `(batch, latent.width())` to images
/// `(batch, channels, height, width)`.
pub trait GeneratorNet: Send {
    fn latent_layout(&self) -> LatentLayout;

    fn image_shape(&self) -> ImageShape;

    fn forward_t(&self, z: &Tensor, train: bool) -> Result<Tensor>;

    /// Every trainable parameter, with dotted names.
    fn parameters(&self) -> Vec<(String, Var)>;

    /// Re-initialises parameters through the layer-kind visitor.
    fn apply_init(&self, init: &mut ParamInit) -> Result<()>;
}

/// Sub-networks of the discriminator/recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscriminatorHead {
    /// Convolutional trunk shared by discrimination and recognition.
    Shared,
    /// Real/fake probability head.
    RealFake,
    /// Recognition trunk feeding the latent-code heads.
    Q,
    /// Discrete-code logits.
    Discrete,
    /// Continuous-code mean.
    ContinuousMean,
    /// Continuous-code variance.
    ContinuousVariance,
}

impl DiscriminatorHead {
    pub const ALL: [DiscriminatorHead; 6] = [
        DiscriminatorHead::Shared,
        DiscriminatorHead::RealFake,
        DiscriminatorHead::Q,
        DiscriminatorHead::Discrete,
        DiscriminatorHead::ContinuousMean,
        DiscriminatorHead::ContinuousVariance,
    ];

    /// Prefix used in parameter names.
    pub fn name(self) -> &'static str {
        match self {
            DiscriminatorHead::Shared => "shared",
            DiscriminatorHead::RealFake => "real_fake",
            DiscriminatorHead::Q => "q",
            DiscriminatorHead::Discrete => "latent_disc",
            DiscriminatorHead::ContinuousMean => "latent_cont_mu",
            DiscriminatorHead::ContinuousVariance => "latent_cont_var",
        }
    }
}

/// Everything one discriminator pass produces.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// Probability that each sample is real, `(batch,)`.
    pub probability: Tensor,
    /// Raw discrete-code logits, `(batch, n_c_disc, dim_c_disc)`.
    pub disc_logits: Tensor,
    /// Predicted continuous-code mean, `(batch, dim_c_cont)`.
    pub cont_mu: Tensor,
    /// Predicted continuous-code variance, strictly positive, `(batch, dim_c_cont)`.
    pub cont_var: Tensor,
}

/// Maps images to a [`DiscriminatorOutput`].
pub trait DiscriminatorNet: Send {
    fn latent_layout(&self) -> LatentLayout;

    fn forward_t(&self, images: &Tensor, train: bool) -> Result<DiscriminatorOutput>;

    /// Trainable parameters of one sub-network, with dotted names.
    fn head_parameters(&self, head: DiscriminatorHead) -> Vec<(String, Var)>;

    fn parameters(&self) -> Vec<(String, Var)> {
        DiscriminatorHead::ALL
            .iter()
            .flat_map(|head| self.head_parameters(*head))
            .collect()
    }

    fn apply_init(&self, init: &mut ParamInit) -> Result<()>;
}
