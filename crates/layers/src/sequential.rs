//! Ordered layer container and the reshape glue between dense and
//! convolutional sections.

use candle_core::{Error, Result, Tensor, Var};

use crate::{init::ParamInit, Layer, LayerKind};

/// Reshapes every sample while keeping the batch axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshape {
    sample_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(sample_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            sample_shape: sample_shape.into(),
        }
    }

    /// Collapses everything after the batch axis.
    pub fn flatten(features: usize) -> Self {
        Self::new(vec![features])
    }
}

impl Layer for Reshape {
    fn kind(&self) -> LayerKind {
        LayerKind::Other
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        let batch = input.dim(0)?;
        let expected: usize = self.sample_shape.iter().product();
        let actual = input.elem_count() / batch.max(1);
        if actual != expected {
            return Err(Error::Msg(format!(
                "reshape: cannot view {:?} as (batch, {:?})",
                input.dims(),
                self.sample_shape
            )));
        }
        let mut shape = Vec::with_capacity(self.sample_shape.len() + 1);
        shape.push(batch);
        shape.extend_from_slice(&self.sample_shape);
        input.reshape(shape)
    }
}

/// Layers applied in insertion order. Parameters are exposed as
/// `<index>.<name>` so containers can prefix them further.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer, builder style.
    pub fn add<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer kinds in order, for introspection.
    pub fn kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|layer| layer.kind()).collect()
    }

    /// Parameters named `<prefix>.<index>.<name>`.
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| {
                layer
                    .parameters()
                    .into_iter()
                    .map(move |(name, var)| (format!("{prefix}.{idx}.{name}"), var))
            })
            .collect()
    }

    /// Visits every layer with the initialisation policy.
    pub fn apply_init(&self, init: &mut ParamInit) -> Result<()> {
        for layer in &self.layers {
            layer.reset_parameters(init)?;
        }
        Ok(())
    }
}

impl Layer for Sequential {
    fn kind(&self) -> LayerKind {
        LayerKind::Other
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward_t(&hidden, train)?;
        }
        Ok(hidden)
    }

    fn reset_parameters(&self, init: &mut ParamInit) -> Result<()> {
        self.apply_init(init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Activation, ActivationKind, BatchNorm, BatchNormConfig, InitScheme, Linear,
    };
    use candle_core::{DType, Device};

    fn stack(init: &mut ParamInit) -> Result<Sequential> {
        Ok(Sequential::new()
            .add(Linear::new(4, 8, init)?)
            .add(BatchNorm::new(BatchNormConfig::new(8), init)?)
            .add(Activation::new(ActivationKind::Relu)?)
            .add(Reshape::new(vec![2, 2, 2])))
    }

    #[test]
    fn parameters_are_named_by_position() -> Result<()> {
        let mut init = ParamInit::new(InitScheme::Default, 0, &Device::Cpu);
        let seq = stack(&mut init)?;
        let names: Vec<String> = seq
            .named_parameters("trunk")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["trunk.0.weight", "trunk.0.bias", "trunk.1.weight", "trunk.1.bias"]
        );
        Ok(())
    }

    #[test]
    fn forward_threads_through_every_layer() -> Result<()> {
        let mut init = ParamInit::new(InitScheme::Default, 0, &Device::Cpu);
        let seq = stack(&mut init)?;
        let input = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let output = seq.forward_t(&input, true)?;
        assert_eq!(output.dims(), &[3, 2, 2, 2]);
        assert!(output.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| *v >= 0.0));
        Ok(())
    }

    #[test]
    fn reshape_rejects_mismatched_volume() -> Result<()> {
        let input = Tensor::zeros((2, 6), DType::F32, &Device::Cpu)?;
        assert!(Reshape::new(vec![2, 2]).forward_t(&input, false).is_err());
        Ok(())
    }
}
