use crate::candle_aux_layers::{stack_relu_linear, StackLayers};
use crate::candle_loss_functions::gaussian_log_density;
use crate::tensor_util::randn_with;

use super::standardize::Standardize;
use super::traits::ConditionalDensity;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use rand::Rng;

/// Diagonal Gaussian q(θ | x) = N(μ(x), diag σ(x)²), a single-component
/// mixture density network. With no hidden layers μ and ln σ are affine
/// in x.
pub struct ConditionalGaussian {
    dim_theta: usize,
    dim_obs: usize,
    standardize: Option<Standardize>,
    fc: StackLayers<Linear>,
    theta_mean: Linear,
    theta_ln_std: Linear,
}

pub struct ConditionalGaussianArgs<'a> {
    pub dim_theta: usize,
    pub dim_obs: usize,
    pub layers: &'a [usize],
    pub standardize: Option<Standardize>,
}

impl ConditionalGaussian {
    const MIN_LN_STD: f64 = -6.;
    const MAX_LN_STD: f64 = 6.;

    /// Will create a new conditional Gaussian module
    ///
    /// # Arguments
    /// * `args` - dimensions, hidden layers, optional z-scoring
    /// * `vb` - variable builder
    pub fn new(args: ConditionalGaussianArgs, vb: VarBuilder) -> Result<Self> {
        let (fc, fc_dim) = stack_relu_linear(args.dim_obs, args.layers, vb.pp("nn.fc"))?;
        let theta_mean = candle_nn::linear(fc_dim, args.dim_theta, vb.pp("nn.mean"))?;
        let theta_ln_std = candle_nn::linear(fc_dim, args.dim_theta, vb.pp("nn.ln_std"))?;
        Ok(Self {
            dim_theta: args.dim_theta,
            dim_obs: args.dim_obs,
            standardize: args.standardize,
            fc,
            theta_mean,
            theta_ln_std,
        })
    }

    ///
    /// Evaluate the Gaussian parameters
    /// * `x_nm` - observations (n x m ...)
    ///
    /// # Returns `(mean_nd, ln_std_nd)`
    ///
    pub fn gaussian_params(&self, x_nm: &Tensor) -> Result<(Tensor, Tensor)> {
        let h_nm = match &self.standardize {
            Some(z) => z.forward(x_nm)?,
            None => x_nm.flatten_from(1)?,
        };
        let h_nl = self.fc.forward(&h_nm)?;
        let mean_nd = self.theta_mean.forward(&h_nl)?;
        let ln_std_nd = self
            .theta_ln_std
            .forward(&h_nl)?
            .clamp(Self::MIN_LN_STD, Self::MAX_LN_STD)?;
        Ok((mean_nd, ln_std_nd))
    }
}

impl ConditionalDensity for ConditionalGaussian {
    fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, _normalize: bool) -> Result<Tensor> {
        let (mean_nd, ln_std_nd) = self.gaussian_params(x_nm)?;
        gaussian_log_density(theta_nd, &mean_nd, &ln_std_nd)
    }

    fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (mean_1d, ln_std_1d) = self.gaussian_params(x_1m)?;
        let eps_nd = randn_with(num_samples, self.dim_theta, rng, x_1m.device())?;
        let theta_nd = eps_nd
            .broadcast_mul(&ln_std_1d.exp()?)?
            .broadcast_add(&mean_1d)?;
        Ok(theta_nd.detach())
    }

    fn dim_theta(&self) -> usize {
        self.dim_theta
    }

    fn dim_obs(&self) -> usize {
        self.dim_obs
    }
}
