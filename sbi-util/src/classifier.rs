use crate::candle_aux_layers::{stack_relu_linear, StackLayers};
use crate::density::Standardize;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// A classifier `d(θ, x)` scoring parameter-observation pairs.
///
/// Trained to tell joint pairs from marginal pairs, its logit estimates
/// log p(x | θ) - log p(x) up to a constant.
pub trait RatioClassifier {
    /// * `theta_nd` - parameters (n x d)
    /// * `x_nm` - observations (n x m ...), aligned with `theta_nd`
    ///
    /// # Returns
    /// logits (n,)
    fn logits(&self, theta_nd: &Tensor, x_nm: &Tensor) -> Result<Tensor>;
}

/// ReLU MLP on `[θ, x]` with a single logit output
pub struct MlpClassifier {
    standardize: Option<Standardize>,
    fc: StackLayers<Linear>,
    out: Linear,
}

pub struct MlpClassifierArgs<'a> {
    pub dim_theta: usize,
    pub dim_obs: usize,
    pub layers: &'a [usize],
    pub standardize: Option<Standardize>,
}

impl MlpClassifier {
    pub fn new(args: MlpClassifierArgs, vb: VarBuilder) -> Result<Self> {
        let (fc, fc_dim) =
            stack_relu_linear(args.dim_theta + args.dim_obs, args.layers, vb.pp("nn.fc"))?;
        let out = candle_nn::linear(fc_dim, 1, vb.pp("nn.out"))?;
        Ok(Self {
            standardize: args.standardize,
            fc,
            out,
        })
    }
}

impl RatioClassifier for MlpClassifier {
    fn logits(&self, theta_nd: &Tensor, x_nm: &Tensor) -> Result<Tensor> {
        let h_nm = match &self.standardize {
            Some(z) => z.forward(x_nm)?,
            None => x_nm.flatten_from(1)?,
        };
        let input = Tensor::cat(&[theta_nd, &h_nm], 1)?;
        self.out.forward(&self.fc.forward(&input)?)?.squeeze(1)
    }
}
