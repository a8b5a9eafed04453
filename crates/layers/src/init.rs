//! Weight initialisation dispatched over a closed set of layer kinds.
//!
//! A [`ParamInit`] is handed to every layer of a network; each layer reports
//! its [`LayerKind`] together with the [`ParamRole`] of the tensor it wants to
//! fill, and the active [`InitScheme`] decides whether (and how) to sample a
//! replacement. Sampling happens on the host with a seeded [`StdRng`] and the
//! result is moved to the target device afterwards.

use candle_core::{Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Layer families recognised by initialisation visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// 2D convolution, regular or transposed.
    Convolution,
    /// Batch normalisation over the channel axis.
    BatchNorm,
    /// Dense affine projection.
    Linear,
    /// Parameter-free layers (activations, reshapes).
    Other,
}

/// Which tensor of a layer is being initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Weight,
    Bias,
}

/// Supported initialisation recipes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitScheme {
    /// Fan-in scaled uniform weights and biases; unit/zero batch-norm affine.
    Default,
    /// DCGAN recipe: conv weights `N(0, conv_std)`, batch-norm scale
    /// `N(1, norm_std)` with zero shift, every other tensor untouched.
    Normal { conv_std: f64, norm_std: f64 },
}

impl InitScheme {
    /// The DCGAN/InfoGAN normal initialisation with the usual 0.02 deviations.
    pub fn normal() -> Self {
        Self::Normal {
            conv_std: 0.02,
            norm_std: 0.02,
        }
    }
}

impl Default for InitScheme {
    fn default() -> Self {
        Self::Default
    }
}

#[derive(Debug, Clone, Copy)]
enum Draw {
    Uniform { bound: f64 },
    Normal { mean: f64, std: f64 },
    Constant(f64),
}

/// Seeded parameter factory shared by all layers of a network.
pub struct ParamInit {
    scheme: InitScheme,
    rng: StdRng,
    device: Device,
}

impl ParamInit {
    pub fn new(scheme: InitScheme, seed: u64, device: &Device) -> Self {
        Self {
            scheme,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    pub fn scheme(&self) -> InitScheme {
        self.scheme
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Creates a fresh trainable tensor using the [`InitScheme::Default`] rules,
    /// regardless of the configured scheme. Layer constructors call this.
    pub fn create(
        &mut self,
        kind: LayerKind,
        role: ParamRole,
        shape: &[usize],
        fan_in: usize,
    ) -> Result<Var> {
        let draw = default_draw(kind, role, fan_in).ok_or_else(|| {
            Error::Msg(format!(
                "layer kind {:?} does not own a {:?} parameter",
                kind, role
            ))
        })?;
        let tensor = self.materialize(draw, shape)?;
        Var::from_tensor(&tensor)
    }

    /// Samples a replacement according to the configured scheme, or `None` when
    /// the scheme leaves this `(kind, role)` pair untouched.
    pub fn sample(
        &mut self,
        kind: LayerKind,
        role: ParamRole,
        shape: &[usize],
        fan_in: usize,
    ) -> Result<Option<Tensor>> {
        let draw = match self.scheme {
            InitScheme::Default => default_draw(kind, role, fan_in),
            InitScheme::Normal { conv_std, norm_std } => match (kind, role) {
                (LayerKind::Convolution, ParamRole::Weight) => Some(Draw::Normal {
                    mean: 0.0,
                    std: conv_std,
                }),
                (LayerKind::BatchNorm, ParamRole::Weight) => Some(Draw::Normal {
                    mean: 1.0,
                    std: norm_std,
                }),
                (LayerKind::BatchNorm, ParamRole::Bias) => Some(Draw::Constant(0.0)),
                (LayerKind::Convolution, ParamRole::Bias)
                | (LayerKind::Linear, _)
                | (LayerKind::Other, _) => None,
            },
        };
        draw.map(|draw| self.materialize(draw, shape)).transpose()
    }

    /// Re-samples `var` in place when the scheme covers it.
    pub fn reset(
        &mut self,
        var: &Var,
        kind: LayerKind,
        role: ParamRole,
        fan_in: usize,
    ) -> Result<()> {
        let shape = var.as_tensor().dims().to_vec();
        if let Some(tensor) = self.sample(kind, role, &shape, fan_in)? {
            var.set(&tensor)?;
        }
        Ok(())
    }

    fn materialize(&mut self, draw: Draw, shape: &[usize]) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = match draw {
            Draw::Uniform { bound } => (0..numel)
                .map(|_| self.rng.gen_range(-bound..=bound) as f32)
                .collect(),
            Draw::Normal { mean, std } => {
                let normal = Normal::new(mean, std).map_err(|err| {
                    Error::Msg(format!("invalid normal init ({mean}, {std}): {err}"))
                })?;
                (0..numel)
                    .map(|_| normal.sample(&mut self.rng) as f32)
                    .collect()
            }
            Draw::Constant(value) => vec![value as f32; numel],
        };
        Tensor::from_vec(values, shape, &self.device)
    }
}

fn default_draw(kind: LayerKind, role: ParamRole, fan_in: usize) -> Option<Draw> {
    match (kind, role) {
        (LayerKind::Convolution | LayerKind::Linear, _) => Some(Draw::Uniform {
            bound: 1.0 / (fan_in.max(1) as f64).sqrt(),
        }),
        (LayerKind::BatchNorm, ParamRole::Weight) => Some(Draw::Constant(1.0)),
        (LayerKind::BatchNorm, ParamRole::Bias) => Some(Draw::Constant(0.0)),
        (LayerKind::Other, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_scheme_skips_linear_layers() -> Result<()> {
        let mut init = ParamInit::new(InitScheme::normal(), 7, &Device::Cpu);
        assert!(init
            .sample(LayerKind::Linear, ParamRole::Weight, &[4, 4], 4)?
            .is_none());
        assert!(init
            .sample(LayerKind::Other, ParamRole::Weight, &[4], 4)?
            .is_none());
        Ok(())
    }

    #[test]
    fn normal_scheme_centres_batch_norm_scale_on_one() -> Result<()> {
        let mut init = ParamInit::new(InitScheme::normal(), 7, &Device::Cpu);
        let scale = init
            .sample(LayerKind::BatchNorm, ParamRole::Weight, &[512], 512)?
            .expect("batch norm weight is covered");
        let mean = scale.mean_all()?.to_vec0::<f32>()?;
        assert!((mean - 1.0).abs() < 0.01, "mean was {mean}");
        let shift = init
            .sample(LayerKind::BatchNorm, ParamRole::Bias, &[512], 512)?
            .expect("batch norm bias is covered");
        assert_eq!(shift.abs()?.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn default_scheme_respects_fan_in_bound() -> Result<()> {
        let mut init = ParamInit::new(InitScheme::Default, 3, &Device::Cpu);
        let var = init.create(LayerKind::Linear, ParamRole::Weight, &[8, 16], 16)?;
        let max = var.as_tensor().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= 0.25 + 1e-6);
        Ok(())
    }

    #[test]
    fn same_seed_gives_same_parameters() -> Result<()> {
        let mut a = ParamInit::new(InitScheme::Default, 11, &Device::Cpu);
        let mut b = ParamInit::new(InitScheme::Default, 11, &Device::Cpu);
        let wa = a.create(LayerKind::Convolution, ParamRole::Weight, &[2, 1, 3, 3], 9)?;
        let wb = b.create(LayerKind::Convolution, ParamRole::Weight, &[2, 1, 3, 3], 9)?;
        let diff = (wa.as_tensor() - wb.as_tensor())?
            .abs()?
            .sum_all()?
            .to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
