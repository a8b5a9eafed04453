//! Adam parameter groups and the split of trainable parameters between the
//! discriminator objective and the generator+recognition objective.

use std::collections::HashSet;

use candle_core::{backprop::GradStore, DType, Tensor, TensorId, Var};
use model::{DiscriminatorHead, DiscriminatorNet, GeneratorNet};

use crate::{
    config::{self, ContinuousLossMode},
    TrainingError,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

/// Learning-rate pair for the two objectives. Only Adam is accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSettings {
    pub discriminator: AdamConfig,
    pub generator: AdamConfig,
}

impl TryFrom<&config::OptimizerConfig> for AdamSettings {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        if !value.algorithm.trim().eq_ignore_ascii_case("adam") {
            return Err(TrainingError::unsupported(format!(
                "optimizer '{}' (only adam is implemented)",
                value.algorithm
            )));
        }
        let with_lr = |learning_rate| AdamConfig {
            learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
        };
        Ok(AdamSettings {
            discriminator: with_lr(value.discriminator_lr),
            generator: with_lr(value.generator_lr),
        })
    }
}

/// One Adam instance over a fixed set of parameters. Gradients are buffered
/// per parameter so several backward passes can accumulate before a step.
#[derive(Debug)]
pub struct AdamGroup {
    name: &'static str,
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
    grad: Option<Tensor>,
}

impl AdamGroup {
    pub fn new(
        name: &'static str,
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(format!(
                "{} optimizer requires at least one parameter",
                name
            )));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (param_name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "{} optimizer received non-floating parameter '{}'",
                    name, param_name
                )));
            }
            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name: param_name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
                grad: None,
            });
        }

        Ok(Self {
            name,
            config,
            params,
            step: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn contains(&self, var: &Var) -> bool {
        let id = var.as_tensor().id();
        self.params.iter().any(|slot| slot.param.as_tensor().id() == id)
    }

    fn ids(&self) -> impl Iterator<Item = (TensorId, &str)> {
        self.params
            .iter()
            .map(|slot| (slot.param.as_tensor().id(), slot.name.as_str()))
    }

    /// Clears the buffered gradients.
    pub fn zero_grad(&mut self) {
        for slot in &mut self.params {
            slot.grad = None;
        }
    }

    /// Adds the gradients `grads` holds for this group's parameters to the
    /// buffer. Gradients of parameters outside the group are ignored.
    /// Returns how many parameters received a gradient.
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<usize, TrainingError> {
        let mut touched = 0;
        for slot in &mut self.params {
            let grad = match grads.get(slot.param.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32).map_err(to_runtime_error)?,
                None => continue,
            };
            slot.grad = Some(match slot.grad.take() {
                Some(prev) => prev.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            });
            touched += 1;
        }
        Ok(touched)
    }

    /// Buffered gradients with their parameter names.
    pub fn gradients(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params
            .iter()
            .filter_map(|slot| slot.grad.as_ref().map(|grad| (slot.name.as_str(), grad)))
    }

    /// Applies one Adam update from the buffered gradients. Parameters without
    /// a buffered gradient keep their value and moments.
    pub fn step(&mut self) -> Result<(), TrainingError> {
        if self.params.iter().all(|slot| slot.grad.is_none()) {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for slot in &mut self.params {
            let grad = match slot.grad.as_ref() {
                Some(grad) => grad,
                None => continue,
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let next = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .and_then(|p| p.sub(&update))
                .map_err(to_runtime_error)?;
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }
}

/// Discriminator heads updated from the real/fake objective.
pub const DISCRIMINATOR_HEADS: [DiscriminatorHead; 2] =
    [DiscriminatorHead::Shared, DiscriminatorHead::RealFake];

/// Discriminator heads updated together with the generator. The variance head
/// only joins when the Gaussian likelihood makes it part of the objective.
pub fn recognition_heads(mode: ContinuousLossMode) -> Vec<DiscriminatorHead> {
    let mut heads = vec![
        DiscriminatorHead::Q,
        DiscriminatorHead::Discrete,
        DiscriminatorHead::ContinuousMean,
    ];
    if mode == ContinuousLossMode::GaussianNll {
        heads.push(DiscriminatorHead::ContinuousVariance);
    }
    heads
}

/// The two optimizers of a run. Built once and never reset.
#[derive(Debug)]
pub struct OptimizerPartition {
    pub discriminator: AdamGroup,
    pub generator: AdamGroup,
}

impl OptimizerPartition {
    pub fn new(
        config: &config::OptimizerConfig,
        mode: ContinuousLossMode,
        generator: &dyn GeneratorNet,
        discriminator: &dyn DiscriminatorNet,
    ) -> Result<Self, TrainingError> {
        let settings = AdamSettings::try_from(config)?;

        let d_params: Vec<(String, Var)> = DISCRIMINATOR_HEADS
            .iter()
            .flat_map(|head| discriminator.head_parameters(*head))
            .collect();
        let mut g_params = generator.parameters();
        g_params.extend(
            recognition_heads(mode)
                .into_iter()
                .flat_map(|head| discriminator.head_parameters(head)),
        );

        let partition = Self {
            discriminator: AdamGroup::new("discriminator", d_params, settings.discriminator)?,
            generator: AdamGroup::new("generator", g_params, settings.generator)?,
        };
        partition.ensure_disjoint()?;
        Ok(partition)
    }

    fn ensure_disjoint(&self) -> Result<(), TrainingError> {
        let mut seen = HashSet::new();
        for (id, _) in self.discriminator.ids() {
            seen.insert(id);
        }
        for (id, name) in self.generator.ids() {
            if seen.contains(&id) {
                return Err(TrainingError::initialization(format!(
                    "parameter '{}' is owned by both optimizers",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
