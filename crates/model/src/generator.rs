use candle_core::{Error, Result, Tensor, Var};
use layers::{
    checks, Activation, ActivationKind, BatchNorm, BatchNormConfig, Conv2dConfig,
    ConvTranspose2d, Layer, Linear, ParamInit, Reshape, Sequential,
};

use crate::{GeneratorNet, ImageShape, LatentLayout, ModelConfig};

const HIDDEN: usize = 1024;
const FEATURE_CHANNELS: usize = 128;
const UPSAMPLE_CHANNELS: usize = 64;

/// DCGAN-style generator: two dense blocks lift the latent vector to a
/// `128 x H/4 x W/4` feature map, two stride-2 transposed convolutions bring it
/// to image resolution, and `tanh` bounds pixels to `[-1, 1]`.
pub struct MnistGenerator {
    latent: LatentLayout,
    image: ImageShape,
    layers: Sequential,
}

impl MnistGenerator {
    pub fn new(config: &ModelConfig, init: &mut ParamInit) -> Result<Self> {
        config.validate()?;
        let (fh, fw) = config.feature_map();
        let features = FEATURE_CHANNELS * fh * fw;
        let up = |cin, cout| Conv2dConfig::new(cin, cout, 4).with_stride(2).with_padding(1);

        let layers = Sequential::new()
            .add(Linear::new(config.latent.width(), HIDDEN, init)?)
            .add(BatchNorm::new(BatchNormConfig::new(HIDDEN), init)?)
            .add(Activation::new(ActivationKind::Relu)?)
            .add(Linear::new(HIDDEN, features, init)?)
            .add(BatchNorm::new(BatchNormConfig::new(features), init)?)
            .add(Activation::new(ActivationKind::Relu)?)
            .add(Reshape::new(vec![FEATURE_CHANNELS, fh, fw]))
            .add(ConvTranspose2d::new(up(FEATURE_CHANNELS, UPSAMPLE_CHANNELS), init)?)
            .add(BatchNorm::new(BatchNormConfig::new(UPSAMPLE_CHANNELS), init)?)
            .add(Activation::new(ActivationKind::Relu)?)
            .add(ConvTranspose2d::new(up(UPSAMPLE_CHANNELS, config.image.channels), init)?)
            .add(Activation::new(ActivationKind::Tanh)?);

        Ok(Self {
            latent: config.latent,
            image: config.image,
            layers,
        })
    }
}

impl GeneratorNet for MnistGenerator {
    fn latent_layout(&self) -> LatentLayout {
        self.latent
    }

    fn image_shape(&self) -> ImageShape {
        self.image
    }

    fn forward_t(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_features("generator.latent", z, self.latent.width())?;
        let images = self.layers.forward_t(z, train)?;
        let batch = z.dim(0)?;
        if images.dims() != self.image.batch_dims(batch) {
            return Err(Error::Msg(format!(
                "generator produced {:?}, expected {:?}",
                images.dims(),
                self.image.batch_dims(batch)
            )));
        }
        Ok(images)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.layers.named_parameters("generator")
    }

    fn apply_init(&self, init: &mut ParamInit) -> Result<()> {
        self.layers.apply_init(init)
    }
}
