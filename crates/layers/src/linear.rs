//! Dense affine projection.
//!
//! Linear layers expect inputs shaped `(batch, in_dim)` and return
//! `(batch, out_dim)`. The weight is stored as `(out_dim, in_dim)` and
//! multiplied transposed, matching the usual `y = x Wᵀ + b` convention. Both
//! tensors are [`Var`]s so optimisers can update them in place.

use candle_core::{Result, Tensor, Var};

use crate::{checks, init::ParamInit, Layer, LayerKind, ParamRole};

/// Dense affine projection with a learnable bias.
#[derive(Debug, Clone)]
pub struct Linear {
    input_dim: usize,
    output_dim: usize,
    weight: Var,
    bias: Var,
}

impl Linear {
    /// Builds a linear layer with fan-in scaled uniform parameters.
    pub fn new(input_dim: usize, output_dim: usize, init: &mut ParamInit) -> Result<Self> {
        let weight = init.create(
            LayerKind::Linear,
            ParamRole::Weight,
            &[output_dim, input_dim],
            input_dim,
        )?;
        let bias = init.create(LayerKind::Linear, ParamRole::Bias, &[output_dim], input_dim)?;
        Ok(Self {
            input_dim,
            output_dim,
            weight,
            bias,
        })
    }

    /// Constructs a layer from pre-existing parameter values.
    pub fn from_tensors(weight: &Tensor, bias: &Tensor) -> Result<Self> {
        checks::expect_rank("linear.weight", weight, 2)?;
        let (output_dim, input_dim) = weight.dims2()?;
        checks::expect_shape("linear.bias", bias, &[output_dim])?;
        Ok(Self {
            input_dim,
            output_dim,
            weight: Var::from_tensor(weight)?,
            bias: Var::from_tensor(bias)?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }
}

impl Layer for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_features("linear.input", input, self.input_dim)?;
        input
            .matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    fn parameters(&self) -> Vec<(&'static str, Var)> {
        vec![("weight", self.weight.clone()), ("bias", self.bias.clone())]
    }

    fn reset_parameters(&self, init: &mut ParamInit) -> Result<()> {
        init.reset(&self.weight, LayerKind::Linear, ParamRole::Weight, self.input_dim)?;
        init.reset(&self.bias, LayerKind::Linear, ParamRole::Bias, self.input_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InitScheme;
    use candle_core::Device;

    #[test]
    fn forward_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (2, 3), &device)?;
        let bias = Tensor::from_vec(vec![0.5f32, -0.5], 2, &device)?;
        let linear = Linear::from_tensors(&weight, &bias)?;
        let input = Tensor::from_vec(vec![1f32, 0., -1.], (1, 3), &device)?;
        let output = linear.forward_t(&input, true)?.to_vec2::<f32>()?;
        assert_eq!(output, vec![vec![-1.5, -2.5]]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_feature_width() -> Result<()> {
        let device = Device::Cpu;
        let mut init = ParamInit::new(InitScheme::Default, 0, &device);
        let linear = Linear::new(4, 2, &mut init)?;
        let input = Tensor::zeros((3, 5), candle_core::DType::F32, &device)?;
        assert!(linear.forward_t(&input, false).is_err());
        Ok(())
    }

    #[test]
    fn normal_scheme_leaves_linear_untouched() -> Result<()> {
        let device = Device::Cpu;
        let mut init = ParamInit::new(InitScheme::Default, 1, &device);
        let linear = Linear::new(4, 2, &mut init)?;
        let before = linear.weight().to_vec2::<f32>()?;
        let mut normal = ParamInit::new(InitScheme::normal(), 2, &device);
        linear.reset_parameters(&mut normal)?;
        assert_eq!(before, linear.weight().to_vec2::<f32>()?);
        Ok(())
    }
}
