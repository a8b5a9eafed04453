use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Widths of the blocks that make up a latent vector, in concatenation order:
/// noise, one one-hot block per discrete slot, then the continuous block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentLayout {
    pub dim_z: usize,
    pub n_c_disc: usize,
    pub dim_c_disc: usize,
    pub dim_c_cont: usize,
}

impl LatentLayout {
    pub fn new(dim_z: usize, n_c_disc: usize, dim_c_disc: usize, dim_c_cont: usize) -> Self {
        Self {
            dim_z,
            n_c_disc,
            dim_c_disc,
            dim_c_cont,
        }
    }

    /// Full latent width `dim_z + n_c_disc * dim_c_disc + dim_c_cont`.
    pub fn width(&self) -> usize {
        self.dim_z + self.disc_width() + self.dim_c_cont
    }

    /// Combined width of all one-hot blocks.
    pub fn disc_width(&self) -> usize {
        self.n_c_disc * self.dim_c_disc
    }

    /// Column where the one-hot block of `slot` starts.
    pub fn disc_offset(&self, slot: usize) -> usize {
        self.dim_z + slot * self.dim_c_disc
    }

    /// Column where the continuous block starts.
    pub fn cont_offset(&self) -> usize {
        self.dim_z + self.disc_width()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim_z == 0 {
            return Err(Error::Msg("dim_z must be greater than zero".into()));
        }
        if self.n_c_disc == 0 {
            return Err(Error::Msg("n_c_disc must be greater than zero".into()));
        }
        if self.dim_c_disc < 2 {
            return Err(Error::Msg(format!(
                "dim_c_disc must be at least 2, got {}",
                self.dim_c_disc
            )));
        }
        if self.dim_c_cont == 0 {
            return Err(Error::Msg("dim_c_cont must be greater than zero".into()));
        }
        Ok(())
    }
}

impl Default for LatentLayout {
    fn default() -> Self {
        Self::new(62, 1, 10, 2)
    }
}

/// Native `(channels, height, width)` layout of a dataset's images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Square single-channel images such as MNIST digits.
    pub fn grayscale(side: usize) -> Self {
        Self::new(1, side, side)
    }

    pub fn pixels(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Shape of a batch of `batch` images.
    pub fn batch_dims(&self, batch: usize) -> [usize; 4] {
        [batch, self.channels, self.height, self.width]
    }
}

/// Everything needed to assemble the generator and discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub latent: LatentLayout,
    pub image: ImageShape,
    /// Negative slope of the discriminator's leaky ReLUs.
    pub leaky_slope: f64,
}

impl ModelConfig {
    pub fn new(latent: LatentLayout, image: ImageShape) -> Self {
        Self {
            latent,
            image,
            leaky_slope: 0.1,
        }
    }

    /// Validate structural invariants of the convolutional stacks.
    pub fn validate(&self) -> Result<()> {
        self.latent.validate()?;
        if self.image.channels == 0 {
            return Err(Error::Msg("image channels must be greater than zero".into()));
        }
        if self.image.height == 0
            || self.image.width == 0
            || self.image.height % 4 != 0
            || self.image.width % 4 != 0
        {
            return Err(Error::Msg(format!(
                "image height and width must be non-zero multiples of 4, got {}x{}",
                self.image.height, self.image.width
            )));
        }
        if !(0.0..=1.0).contains(&self.leaky_slope) {
            return Err(Error::Msg("leaky_slope must be in [0, 1]".into()));
        }
        Ok(())
    }

    /// Spatial size after the two stride-2 stages.
    pub(crate) fn feature_map(&self) -> (usize, usize) {
        (self.image.height / 4, self.image.width / 4)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new(LatentLayout::default(), ImageShape::grayscale(28))
    }
}
