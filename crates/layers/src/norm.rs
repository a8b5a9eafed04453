//! Batch normalisation over the channel axis.
//!
//! Inputs are either `(batch, channels)` or `(batch, channels, height, width)`;
//! statistics are gathered over every axis except the channel axis. In
//! training mode the layer normalises with the biased batch variance and folds
//! the batch statistics into its running estimates:
//!
//! ```text
//! running_mean = (1 - momentum) * running_mean + momentum * batch_mean
//! running_var  = (1 - momentum) * running_var  + momentum * batch_var_unbiased
//! ```
//!
//! In evaluation mode the running estimates are used instead. Running
//! statistics are buffers, not parameters: they are never reported by
//! [`Layer::parameters`] and never receive gradients.

use std::sync::Mutex;

use candle_core::{DType, Error, Result, Tensor, Var};

use crate::{checks, init::ParamInit, Layer, LayerKind, ParamRole};

/// Configuration for [`BatchNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Number of channels being normalised.
    pub num_features: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight of the current batch in the running estimates.
    pub momentum: f64,
}

impl BatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }
}

/// Batch normalisation with learnable scale/shift and running statistics.
#[derive(Debug)]
pub struct BatchNorm {
    config: BatchNormConfig,
    weight: Var,
    bias: Var,
    running_mean: Mutex<Tensor>,
    running_var: Mutex<Tensor>,
}

impl BatchNorm {
    pub fn new(config: BatchNormConfig, init: &mut ParamInit) -> Result<Self> {
        let features = config.num_features;
        let weight = init.create(LayerKind::BatchNorm, ParamRole::Weight, &[features], features)?;
        let bias = init.create(LayerKind::BatchNorm, ParamRole::Bias, &[features], features)?;
        let running_mean = Tensor::zeros(features, DType::F32, init.device())?;
        let running_var = Tensor::ones(features, DType::F32, init.device())?;
        Ok(Self {
            config,
            weight,
            bias,
            running_mean: Mutex::new(running_mean),
            running_var: Mutex::new(running_var),
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }

    /// Snapshot of the running mean buffer.
    pub fn running_mean(&self) -> Result<Tensor> {
        let guard = self
            .running_mean
            .lock()
            .map_err(|_| Error::Msg("batch norm running mean lock poisoned".into()))?;
        Ok(guard.clone())
    }

    /// Snapshot of the running variance buffer.
    pub fn running_var(&self) -> Result<Tensor> {
        let guard = self
            .running_var
            .lock()
            .map_err(|_| Error::Msg("batch norm running variance lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn broadcast_shape(&self, rank: usize) -> Vec<usize> {
        let mut shape = vec![1; rank];
        shape[1] = self.config.num_features;
        shape
    }

    fn validate_input(&self, input: &Tensor) -> Result<()> {
        match input.rank() {
            2 => checks::expect_batch_features("batch_norm.input", input, self.config.num_features),
            4 => checks::expect_nchw("batch_norm.input", input, self.config.num_features),
            _ => Err(Error::Msg(format!(
                "batch_norm.input: expected rank 2 or 4, got {:?}",
                input.dims()
            ))),
        }
    }

    /// Returns `(mean, biased_var)` shaped `(channels, 1)` and the number of
    /// values each statistic was gathered over.
    fn batch_statistics(&self, input: &Tensor) -> Result<(Tensor, Tensor, usize)> {
        let channels = self.config.num_features;
        let per_channel = input.transpose(0, 1)?.reshape((channels, ()))?;
        let count = per_channel.dim(1)?;
        let mean = per_channel.mean_keepdim(1)?;
        let centered = per_channel.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        Ok((mean, var, count))
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let unbiased = var
            .detach()
            .flatten_all()?
            .affine(count as f64 / (count - 1) as f64, 0.0)?;
        let mean = mean.detach().flatten_all()?;

        let mut running_mean = self
            .running_mean
            .lock()
            .map_err(|_| Error::Msg("batch norm running mean lock poisoned".into()))?;
        *running_mean = (running_mean.affine(1.0 - momentum, 0.0)? + mean.affine(momentum, 0.0)?)?;
        drop(running_mean);

        let mut running_var = self
            .running_var
            .lock()
            .map_err(|_| Error::Msg("batch norm running variance lock poisoned".into()))?;
        *running_var =
            (running_var.affine(1.0 - momentum, 0.0)? + unbiased.affine(momentum, 0.0)?)?;
        Ok(())
    }
}

impl Layer for BatchNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNorm
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.validate_input(input)?;
        let shape = self.broadcast_shape(input.rank());

        let (mean, var) = if train {
            let (mean, var, count) = self.batch_statistics(input)?;
            if count < 2 {
                return Err(Error::Msg(format!(
                    "batch_norm: expected more than one value per channel in training, got input {:?}",
                    input.dims()
                )));
            }
            self.update_running(&mean, &var, count)?;
            (mean.reshape(shape.as_slice())?, var.reshape(shape.as_slice())?)
        } else {
            (
                self.running_mean()?.reshape(shape.as_slice())?,
                self.running_var()?.reshape(shape.as_slice())?,
            )
        };

        let denom = (var + self.config.epsilon)?.sqrt()?;
        let normalized = input.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        let weight = self.weight.as_tensor().reshape(shape.as_slice())?;
        let bias = self.bias.as_tensor().reshape(shape.as_slice())?;
        normalized.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    fn parameters(&self) -> Vec<(&'static str, Var)> {
        vec![("weight", self.weight.clone()), ("bias", self.bias.clone())]
    }

    fn reset_parameters(&self, init: &mut ParamInit) -> Result<()> {
        let features = self.config.num_features;
        init.reset(&self.weight, LayerKind::BatchNorm, ParamRole::Weight, features)?;
        init.reset(&self.bias, LayerKind::BatchNorm, ParamRole::Bias, features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InitScheme;
    use candle_core::Device;

    fn layer(features: usize) -> Result<BatchNorm> {
        let mut init = ParamInit::new(InitScheme::Default, 0, &Device::Cpu);
        BatchNorm::new(BatchNormConfig::new(features), &mut init)
    }

    #[test]
    fn training_output_is_standardised_per_channel() -> Result<()> {
        let norm = layer(2)?;
        let input = Tensor::from_vec(vec![1f32, 10., 3., 20., 5., 30.], (3, 2), &Device::Cpu)?;
        let output = norm.forward_t(&input, true)?;
        let mean = output.mean(0)?.to_vec1::<f32>()?;
        let var = output.sqr()?.mean(0)?.to_vec1::<f32>()?;
        for channel in 0..2 {
            assert!(mean[channel].abs() < 1e-5);
            assert!((var[channel] - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn running_statistics_follow_momentum() -> Result<()> {
        let norm = layer(1)?;
        let input = Tensor::from_vec(vec![2f32, 4.], (2, 1), &Device::Cpu)?;
        norm.forward_t(&input, true)?;
        // batch mean 3, unbiased variance 2
        let mean = norm.running_mean()?.to_vec1::<f32>()?;
        let var = norm.running_var()?.to_vec1::<f32>()?;
        assert!((mean[0] - 0.3).abs() < 1e-6);
        assert!((var[0] - 1.1).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn eval_mode_uses_running_statistics() -> Result<()> {
        let norm = layer(3)?;
        let input = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let output = norm.forward_t(&input, false)?;
        let expected = 1.0 / (1.0f32 + 1e-5).sqrt();
        let max_diff = (output - expected as f64)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max_diff < 1e-6);
        Ok(())
    }

    #[test]
    fn single_value_per_channel_is_rejected_in_training() -> Result<()> {
        let norm = layer(4)?;
        let input = Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?;
        assert!(norm.forward_t(&input, true).is_err());
        assert!(norm.forward_t(&input, false).is_ok());
        Ok(())
    }

    #[test]
    fn buffers_are_not_parameters() -> Result<()> {
        let norm = layer(4)?;
        let names: Vec<_> = norm.parameters().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["weight", "bias"]);
        Ok(())
    }
}
