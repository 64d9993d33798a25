use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

///
/// A stack of `Linear` + ReLU layers, `in_dim -> layers[0] -> ... -> layers[L-1]`
///
/// # Returns `(stack, out_dim)`
/// * `stack` - identity when `layers` is empty
/// * `out_dim` - the last entry of `layers`, or `in_dim`
///
pub fn stack_relu_linear(
    in_dim: usize,
    layers: &[usize],
    vb: VarBuilder,
) -> Result<(StackLayers<Linear>, usize)> {
    let mut stack = StackLayers::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in layers.iter().enumerate() {
        let layer = candle_nn::linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?;
        stack.push_with_act(layer, Activation::Relu);
        prev_dim = next_dim;
    }
    Ok((stack, prev_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn empty_stack_is_identity() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (stack, out_dim) = stack_relu_linear(3, &[], vb)?;
        assert!(stack.is_empty());
        assert_eq!(out_dim, 3);

        let x = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        let y = stack.forward(&x)?;
        assert_eq!(x.to_vec2::<f32>()?, y.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn relu_stack_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (stack, out_dim) = stack_relu_linear(3, &[8, 5], vb)?;
        assert_eq!(stack.len(), 2);
        assert_eq!(out_dim, 5);

        let x = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        let y = stack.forward(&x)?;
        assert_eq!(y.dims(), &[4, 5]);
        assert!(y.min_all()?.to_scalar::<f32>()? >= 0.);
        Ok(())
    }
}
