use candle_core::{Result, Tensor, Var};
use layers::{
    checks, Activation, ActivationKind, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Layer, Linear, ParamInit, Reshape, Sequential,
};

use crate::{
    DiscriminatorHead, DiscriminatorNet, DiscriminatorOutput, ImageShape, LatentLayout,
    ModelConfig,
};

const TRUNK_FEATURES: usize = 1024;
const Q_FEATURES: usize = 128;

/// Discriminator and recognition network sharing one convolutional trunk.
///
/// ```text
/// image ─ shared ─┬─ real_fake ─ sigmoid ─────────────── probability
///                 └─ q ─┬─ latent_disc ──────────────── logits [B, n, k]
///                       ├─ latent_cont_mu ───────────── mean
///                       └─ latent_cont_var ─ exp ────── variance
/// ```
pub struct MnistDiscriminator {
    latent: LatentLayout,
    image: ImageShape,
    shared: Sequential,
    real_fake: Sequential,
    q: Sequential,
    latent_disc: Sequential,
    latent_cont_mu: Sequential,
    latent_cont_var: Sequential,
}

impl MnistDiscriminator {
    pub fn new(config: &ModelConfig, init: &mut ParamInit) -> Result<Self> {
        config.validate()?;
        let (fh, fw) = config.feature_map();
        let features = 128 * fh * fw;
        let leaky = || Activation::new(ActivationKind::LeakyRelu(config.leaky_slope));
        let down = |cin, cout| Conv2dConfig::new(cin, cout, 4).with_stride(2).with_padding(1);
        let latent = config.latent;

        let shared = Sequential::new()
            .add(Conv2d::new(down(config.image.channels, 64), init)?)
            .add(leaky()?)
            .add(Conv2d::new(down(64, 128), init)?)
            .add(BatchNorm::new(BatchNormConfig::new(128), init)?)
            .add(leaky()?)
            .add(Reshape::flatten(features))
            .add(Linear::new(features, TRUNK_FEATURES, init)?)
            .add(BatchNorm::new(BatchNormConfig::new(TRUNK_FEATURES), init)?)
            .add(leaky()?);

        let real_fake = Sequential::new()
            .add(Linear::new(TRUNK_FEATURES, 1, init)?)
            .add(Activation::new(ActivationKind::Sigmoid)?);

        let q = Sequential::new()
            .add(Linear::new(TRUNK_FEATURES, Q_FEATURES, init)?)
            .add(BatchNorm::new(BatchNormConfig::new(Q_FEATURES), init)?)
            .add(leaky()?);

        let latent_disc = Sequential::new()
            .add(Linear::new(Q_FEATURES, latent.disc_width(), init)?)
            .add(Reshape::new(vec![latent.n_c_disc, latent.dim_c_disc]));

        let latent_cont_mu = Sequential::new().add(Linear::new(Q_FEATURES, latent.dim_c_cont, init)?);

        let latent_cont_var = Sequential::new()
            .add(Linear::new(Q_FEATURES, latent.dim_c_cont, init)?)
            .add(Activation::new(ActivationKind::Exp)?);

        Ok(Self {
            latent,
            image: config.image,
            shared,
            real_fake,
            q,
            latent_disc,
            latent_cont_mu,
            latent_cont_var,
        })
    }

    fn head(&self, head: DiscriminatorHead) -> &Sequential {
        match head {
            DiscriminatorHead::Shared => &self.shared,
            DiscriminatorHead::RealFake => &self.real_fake,
            DiscriminatorHead::Q => &self.q,
            DiscriminatorHead::Discrete => &self.latent_disc,
            DiscriminatorHead::ContinuousMean => &self.latent_cont_mu,
            DiscriminatorHead::ContinuousVariance => &self.latent_cont_var,
        }
    }
}

impl DiscriminatorNet for MnistDiscriminator {
    fn latent_layout(&self) -> LatentLayout {
        self.latent
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> Result<DiscriminatorOutput> {
        checks::expect_nchw("discriminator.input", images, self.image.channels)?;
        let trunk = self.shared.forward_t(images, train)?;
        let probability = self.real_fake.forward_t(&trunk, train)?.squeeze(1)?;
        let internal_q = self.q.forward_t(&trunk, train)?;
        Ok(DiscriminatorOutput {
            probability,
            disc_logits: self.latent_disc.forward_t(&internal_q, train)?,
            cont_mu: self.latent_cont_mu.forward_t(&internal_q, train)?,
            cont_var: self.latent_cont_var.forward_t(&internal_q, train)?,
        })
    }

    fn head_parameters(&self, head: DiscriminatorHead) -> Vec<(String, Var)> {
        self.head(head)
            .named_parameters(&format!("discriminator.{}", head.name()))
    }

    fn apply_init(&self, init: &mut ParamInit) -> Result<()> {
        for head in DiscriminatorHead::ALL {
            self.head(head).apply_init(init)?;
        }
        Ok(())
    }
}
