use std::f64::consts::PI;

use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::DiscriminatorOutput;

use crate::{config::ContinuousLossMode, config::LossConfig, latent::LatentSample, TrainingError};

/// Probabilities are clamped into `[EPS, 1 - EPS]` before taking logarithms.
const PROB_EPS: f64 = 1e-7;

/// Target of the adversarial loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Real,
    Fake,
}

impl Label {
    fn value(self) -> f64 {
        match self {
            Label::Real => 1.0,
            Label::Fake => 0.0,
        }
    }
}

/// Mean binary cross entropy between `probability` (`(batch,)`) and `targets`
/// of the same shape.
pub fn binary_cross_entropy(probability: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    if probability.dims() != targets.dims() {
        return Err(TrainingError::shape(format!(
            "probabilities {:?} do not match targets {:?}",
            probability.dims(),
            targets.dims()
        )));
    }
    let p = probability
        .clamp(PROB_EPS, 1.0 - PROB_EPS)
        .map_err(to_runtime_error)?;
    let log_p = p.log().map_err(to_runtime_error)?;
    let log_not_p = p
        .affine(-1.0, 1.0)
        .and_then(|t| t.log())
        .map_err(to_runtime_error)?;
    let not_targets = targets.affine(-1.0, 1.0).map_err(to_runtime_error)?;
    let per_sample = ((targets * &log_p).map_err(to_runtime_error)?
        + (&not_targets * &log_not_p).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;
    per_sample
        .mean_all()
        .and_then(|t| t.neg())
        .map_err(to_runtime_error)
}

/// BCE against a constant label; the label tensor is sized from the observed
/// batch so trailing partial batches need no special handling.
pub fn adversarial_loss(probability: &Tensor, label: Label) -> Result<Tensor, TrainingError> {
    if probability.rank() != 1 {
        return Err(TrainingError::shape(format!(
            "expected per-sample probabilities shaped (batch,), got {:?}",
            probability.dims()
        )));
    }
    let targets = Tensor::full(label.value() as f32, probability.dims(), probability.device())
        .and_then(|t| t.to_dtype(probability.dtype()))
        .map_err(to_runtime_error)?;
    binary_cross_entropy(probability, &targets)
}

/// Cross entropy per discrete slot, summed over slots (unweighted).
///
/// `logits` are raw scores `(batch, n_c_disc, dim_c_disc)`; `targets` are
/// category indices `(n_c_disc, batch)`.
pub fn categorical_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let (batch, slots, categories) = logits.dims3().map_err(|_| {
        TrainingError::shape(format!(
            "expected discrete logits (batch, slots, categories), got {:?}",
            logits.dims()
        ))
    })?;
    if targets.dims() != [slots, batch] {
        return Err(TrainingError::shape(format!(
            "discrete targets {:?} do not match logits {:?}",
            targets.dims(),
            logits.dims()
        )));
    }
    if categories == 0 {
        return Err(TrainingError::shape("discrete logits have no categories"));
    }
    let targets = targets.to_dtype(DType::U32).map_err(to_runtime_error)?;

    let mut total: Option<Tensor> = None;
    for slot in 0..slots {
        let slot_logits = logits
            .narrow(1, slot, 1)
            .and_then(|t| t.squeeze(1))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&slot_logits, D::Minus1).map_err(to_runtime_error)?;
        let slot_targets = targets
            .narrow(0, slot, 1)
            .and_then(|t| t.reshape((batch, 1)))
            .map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&slot_targets, 1)
            .and_then(|t| t.mean_all())
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;
        total = Some(match total {
            Some(acc) => (acc + nll).map_err(to_runtime_error)?,
            None => nll,
        });
    }
    total.ok_or_else(|| TrainingError::shape("discrete logits have no slots"))
}

/// Squared error per continuous channel, averaged over the batch: `(dim_c_cont,)`.
pub fn continuous_mse(mu: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    expect_same_shape("continuous mean", mu, target)?;
    (mu - target)
        .and_then(|t| t.sqr())
        .and_then(|t| t.mean(0))
        .map_err(to_runtime_error)
}

/// Gaussian negative log-likelihood per continuous channel, averaged over the
/// batch: `(x - mu)^2 / (2 var) + ln(var) / 2 + ln(2 pi) / 2`.
pub fn gaussian_nll(target: &Tensor, mu: &Tensor, var: &Tensor) -> Result<Tensor, TrainingError> {
    expect_same_shape("continuous mean", mu, target)?;
    expect_same_shape("continuous variance", var, target)?;
    let var = var.clamp(PROB_EPS, f64::MAX).map_err(to_runtime_error)?;
    let squared = (target - mu).and_then(|t| t.sqr()).map_err(to_runtime_error)?;
    let scaled = squared
        .div(&var.affine(2.0, 0.0).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;
    let log_term = var
        .log()
        .and_then(|t| t.affine(0.5, 0.5 * (2.0 * PI).ln()))
        .map_err(to_runtime_error)?;
    (scaled + log_term)
        .and_then(|t| t.mean(0))
        .map_err(to_runtime_error)
}

/// Generator+recognition objective split into its terms.
#[derive(Debug, Clone)]
pub struct InfoLossOutput {
    /// `adversarial + categorical + continuous.sum()`, the tensor to backprop.
    pub loss: Tensor,
    /// BCE of the fake batch against the real label.
    pub adversarial: Tensor,
    /// Discrete recovery loss, already scaled by `lambda_disc`.
    pub categorical: Tensor,
    /// Continuous recovery loss per channel, already scaled by `lambda_cont`.
    pub continuous: Tensor,
}

/// Combines the adversarial and mutual-information terms.
#[derive(Debug, Clone)]
pub struct LossComposer {
    lambda_disc: f64,
    lambda_cont: f64,
    mode: ContinuousLossMode,
}

impl LossComposer {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            lambda_disc: config.lambda_disc,
            lambda_cont: config.lambda_cont,
            mode: config.continuous_mode,
        }
    }

    pub fn mode(&self) -> ContinuousLossMode {
        self.mode
    }

    /// Discriminator loss on one path: real images against [`Label::Real`],
    /// detached fakes against [`Label::Fake`].
    pub fn discriminator(
        &self,
        output: &DiscriminatorOutput,
        label: Label,
    ) -> Result<Tensor, TrainingError> {
        adversarial_loss(&output.probability, label)
    }

    /// Generator+recognition objective for non-detached fakes generated from
    /// `sample`.
    pub fn info(
        &self,
        output: &DiscriminatorOutput,
        sample: &LatentSample,
    ) -> Result<InfoLossOutput, TrainingError> {
        let adversarial = adversarial_loss(&output.probability, Label::Real)?;
        let categorical = categorical_loss(&output.disc_logits, &sample.disc_idx)?
            .affine(self.lambda_disc, 0.0)
            .map_err(to_runtime_error)?;
        let continuous = match self.mode {
            ContinuousLossMode::Mse => continuous_mse(&output.cont_mu, &sample.cont)?,
            ContinuousLossMode::GaussianNll => {
                gaussian_nll(&sample.cont, &output.cont_mu, &output.cont_var)?
            }
        }
        .affine(self.lambda_cont, 0.0)
        .map_err(to_runtime_error)?;

        let loss = (&adversarial + &categorical)
            .and_then(|t| t + continuous.sum_all()?)
            .map_err(to_runtime_error)?;
        Ok(InfoLossOutput {
            loss,
            adversarial,
            categorical,
            continuous,
        })
    }
}

fn expect_same_shape(label: &str, a: &Tensor, b: &Tensor) -> Result<(), TrainingError> {
    if a.dims() != b.dims() {
        return Err(TrainingError::shape(format!(
            "{} {:?} does not match target {:?}",
            label,
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0::<f32>().expect("scalar tensor")
    }

    fn probs(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).expect("tensor")
    }

    #[test]
    fn perfect_discriminator_has_near_zero_loss() -> Result<(), TrainingError> {
        let real = adversarial_loss(&probs(&[1.0, 1.0, 1.0]), Label::Real)?;
        let fake = adversarial_loss(&probs(&[0.0, 0.0]), Label::Fake)?;
        assert!(scalar(&real) < 1e-5);
        assert!(scalar(&fake) < 1e-5);
        Ok(())
    }

    #[test]
    fn maximally_wrong_discriminator_is_large_but_finite() -> Result<(), TrainingError> {
        let real = scalar(&adversarial_loss(&probs(&[0.0, 0.0]), Label::Real)?);
        let fake = scalar(&adversarial_loss(&probs(&[1.0, 1.0]), Label::Fake)?);
        for loss in [real, fake] {
            assert!(loss.is_finite());
            assert!(loss > 10.0, "loss was {loss}");
        }
        Ok(())
    }

    #[test]
    fn bce_matches_closed_form() -> Result<(), TrainingError> {
        let loss = scalar(&adversarial_loss(&probs(&[0.5, 0.25]), Label::Real)?);
        let expected = -((0.5f32).ln() + (0.25f32).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn confident_correct_logits_approach_zero() -> Result<(), TrainingError> {
        let logits = Tensor::from_vec(
            vec![50f32, 0., 0., 0., 50., 0.],
            (2, 1, 3),
            &Device::Cpu,
        )
        .map_err(to_runtime_error)?;
        let targets = Tensor::from_vec(vec![0u32, 1], (1, 2), &Device::Cpu).map_err(to_runtime_error)?;
        assert!(scalar(&categorical_loss(&logits, &targets)?) < 1e-4);
        Ok(())
    }

    #[test]
    fn uniform_logits_cost_log_k_per_slot() -> Result<(), TrainingError> {
        let k = 10usize;
        let logits = Tensor::zeros((4, 2, k), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let targets = Tensor::from_vec(vec![0u32, 3, 5, 9, 1, 1, 2, 2], (2, 4), &Device::Cpu)
            .map_err(to_runtime_error)?;
        let loss = scalar(&categorical_loss(&logits, &targets)?);
        let expected = 2.0 * (k as f32).ln();
        assert!((loss - expected).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn categorical_rejects_transposed_targets() -> Result<(), TrainingError> {
        let logits = Tensor::zeros((4, 1, 3), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let targets = Tensor::zeros((4, 1), DType::U32, &Device::Cpu).map_err(to_runtime_error)?;
        assert!(matches!(
            categorical_loss(&logits, &targets),
            Err(TrainingError::Shape(_))
        ));
        Ok(())
    }

    #[test]
    fn mse_is_reported_per_channel() -> Result<(), TrainingError> {
        let mu = Tensor::from_vec(vec![0f32, 1., 0., 1.], (2, 2), &Device::Cpu).map_err(to_runtime_error)?;
        let target = Tensor::from_vec(vec![1f32, 1., -1., 1.], (2, 2), &Device::Cpu)
            .map_err(to_runtime_error)?;
        let per_channel = continuous_mse(&mu, &target)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;
        assert_eq!(per_channel, vec![1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn unit_variance_nll_is_half_squared_error_plus_constant() -> Result<(), TrainingError> {
        let x = Tensor::from_vec(vec![1f32, 0.], (2, 1), &Device::Cpu).map_err(to_runtime_error)?;
        let mu = Tensor::zeros((2, 1), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let var = Tensor::ones((2, 1), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let nll = gaussian_nll(&x, &mu, &var)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;
        let expected = 0.25 + 0.5 * (2.0 * std::f32::consts::PI).ln();
        assert!((nll[0] - expected).abs() < 1e-5);
        Ok(())
    }
}
