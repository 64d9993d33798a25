use crate::candle_aux_layers::{stack_relu_linear, StackLayers};
use crate::candle_loss_functions::standard_normal_log_density;
use crate::tensor_util::{create_alternating_binary_mask, randn_with, repeat_rows};

use super::standardize::Standardize;
use super::traits::ConditionalDensity;

use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use rand::Rng;

/// One conditional affine coupling transform
///
/// With a binary mask `b`, the masked coordinates pass through and
/// condition the rest:
///
/// z = b ⊙ θ + (1 - b) ⊙ (θ - t(b ⊙ θ, x)) ⊙ exp(-s(b ⊙ θ, x))
///
struct AffineCoupling {
    mask_1d: Tensor,
    inv_mask_1d: Tensor,
    conditioner: StackLayers<Linear>,
    shift: Linear,
    log_scale: Linear,
}

impl AffineCoupling {
    /// ln-scale is squashed into `[-MAX_LOG_SCALE, MAX_LOG_SCALE]`
    const MAX_LOG_SCALE: f64 = 3.;

    fn new(
        mask_1d: Tensor,
        dim_theta: usize,
        dim_context: usize,
        layers: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let inv_mask_1d = mask_1d.affine(-1., 1.)?;
        let (conditioner, fc_dim) =
            stack_relu_linear(dim_theta + dim_context, layers, vb.pp("conditioner"))?;
        let shift = candle_nn::linear(fc_dim, dim_theta, vb.pp("shift"))?;
        let log_scale = candle_nn::linear(fc_dim, dim_theta, vb.pp("log_scale"))?;
        Ok(Self {
            mask_1d,
            inv_mask_1d,
            conditioner,
            shift,
            log_scale,
        })
    }

    /// shift and ln-scale from the pass-through coordinates
    fn shift_and_log_scale(&self, masked_nd: &Tensor, h_nm: &Tensor) -> Result<(Tensor, Tensor)> {
        let input = Tensor::cat(&[masked_nd, h_nm], 1)?;
        let f_nl = self.conditioner.forward(&input)?;
        let shift_nd = self.shift.forward(&f_nl)?;
        let log_scale_nd = (self.log_scale.forward(&f_nl)?.tanh()? * Self::MAX_LOG_SCALE)?;
        Ok((shift_nd, log_scale_nd))
    }

    /// θ -> z with log |det ∂z/∂θ|
    fn forward(&self, theta_nd: &Tensor, h_nm: &Tensor) -> Result<(Tensor, Tensor)> {
        let masked_nd = theta_nd.broadcast_mul(&self.mask_1d)?;
        let (shift_nd, log_scale_nd) = self.shift_and_log_scale(&masked_nd, h_nm)?;
        let log_scale_nd = log_scale_nd.broadcast_mul(&self.inv_mask_1d)?;

        let moved_nd = (theta_nd - shift_nd)?
            .mul(&log_scale_nd.neg()?.exp()?)?
            .broadcast_mul(&self.inv_mask_1d)?;
        let z_nd = (masked_nd + moved_nd)?;
        let logdet_n = log_scale_nd.sum(1)?.neg()?;
        Ok((z_nd, logdet_n))
    }

    /// z -> θ
    fn inverse(&self, z_nd: &Tensor, h_nm: &Tensor) -> Result<Tensor> {
        let masked_nd = z_nd.broadcast_mul(&self.mask_1d)?;
        let (shift_nd, log_scale_nd) = self.shift_and_log_scale(&masked_nd, h_nm)?;
        let moved_nd = (z_nd.mul(&log_scale_nd.exp()?)? + shift_nd)?
            .broadcast_mul(&self.inv_mask_1d)?;
        masked_nd + moved_nd
    }
}

///
/// Conditional normalizing flow: a stack of affine couplings with
/// alternating masks on top of a standard normal base density
///
/// log q(θ | x) = log N(z; 0, I) + sum_l log |det ∂z_l/∂z_{l-1}|
///
pub struct AffineCouplingFlow {
    dim_theta: usize,
    dim_obs: usize,
    standardize: Option<Standardize>,
    transforms: Vec<AffineCoupling>,
}

pub struct AffineCouplingFlowArgs<'a> {
    pub dim_theta: usize,
    pub dim_obs: usize,
    pub num_transforms: usize,
    pub layers: &'a [usize],
    pub standardize: Option<Standardize>,
}

impl AffineCouplingFlow {
    /// Will create a new flow module
    ///
    /// # Arguments
    /// * `args` - dimensions, number of couplings, conditioner layers
    /// * `vb` - variable builder
    /// * `device` - where the coupling masks live
    pub fn new(args: AffineCouplingFlowArgs, vb: VarBuilder, device: &Device) -> Result<Self> {
        if args.num_transforms == 0 {
            candle_core::bail!("a flow needs at least one transform");
        }

        // a single parameter is transformed by every coupling
        let transforms = (0..args.num_transforms)
            .map(|l| {
                let mask_1d = if args.dim_theta == 1 {
                    Tensor::zeros((1, 1), candle_core::DType::F32, device)
                } else {
                    create_alternating_binary_mask(args.dim_theta, l % 2 == 0, device)
                        .map_err(candle_core::Error::wrap)
                }?;
                AffineCoupling::new(
                    mask_1d,
                    args.dim_theta,
                    args.dim_obs,
                    args.layers,
                    vb.pp(format!("coupling.{}", l)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dim_theta: args.dim_theta,
            dim_obs: args.dim_obs,
            standardize: args.standardize,
            transforms,
        })
    }

    pub fn num_transforms(&self) -> usize {
        self.transforms.len()
    }

    fn preprocess_context(&self, x_nm: &Tensor) -> Result<Tensor> {
        match &self.standardize {
            Some(z) => z.forward(x_nm),
            None => x_nm.flatten_from(1),
        }
    }

    /// θ -> z through every coupling
    ///
    /// # Returns `(z_nd, logdet_n)`
    pub fn transform(&self, theta_nd: &Tensor, x_nm: &Tensor) -> Result<(Tensor, Tensor)> {
        let h_nm = self.preprocess_context(x_nm)?;
        let mut z_nd = theta_nd.clone();
        let mut logdet_n = Tensor::zeros(theta_nd.dim(0)?, theta_nd.dtype(), theta_nd.device())?;
        for coupling in self.transforms.iter() {
            let (z_next, logdet) = coupling.forward(&z_nd, &h_nm)?;
            z_nd = z_next;
            logdet_n = (logdet_n + logdet)?;
        }
        Ok((z_nd, logdet_n))
    }

    /// z -> θ through every coupling in reverse order
    pub fn inverse(&self, z_nd: &Tensor, x_nm: &Tensor) -> Result<Tensor> {
        let h_nm = self.preprocess_context(x_nm)?;
        let mut theta_nd = z_nd.clone();
        for coupling in self.transforms.iter().rev() {
            theta_nd = coupling.inverse(&theta_nd, &h_nm)?;
        }
        Ok(theta_nd)
    }
}

impl ConditionalDensity for AffineCouplingFlow {
    fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, _normalize: bool) -> Result<Tensor> {
        let (z_nd, logdet_n) = self.transform(theta_nd, x_nm)?;
        standard_normal_log_density(&z_nd)? + logdet_n
    }

    fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let z_nd = randn_with(num_samples, self.dim_theta, rng, x_1m.device())?;
        let x_nm = repeat_rows(x_1m, num_samples).map_err(candle_core::Error::wrap)?;
        Ok(self.inverse(&z_nd, &x_nm)?.detach())
    }

    fn dim_theta(&self) -> usize {
        self.dim_theta
    }

    fn dim_obs(&self) -> usize {
        self.dim_obs
    }
}
