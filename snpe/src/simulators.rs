use sbi_util::distributions::{BoxUniform, Prior};
use sbi_util::error::{Result, SbiError};
use sbi_util::tensor_util::randn_with;

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// A stochastic simulator `x ~ p(x | θ)`
pub trait Simulator: Sync {
    /// * `theta_nd` - parameters (n x d)
    ///
    /// # Returns
    /// one simulated observation per row (n x m ...)
    fn simulate<R>(&self, theta_nd: &Tensor, rng: &mut R) -> candle_core::Result<Tensor>
    where
        R: Rng + ?Sized;
}

/// x = θ + σ ε with ε ~ N(0, I)
#[derive(Clone, Copy, Debug)]
pub struct LinearGaussian {
    pub noise_std: f32,
}

impl Default for LinearGaussian {
    fn default() -> Self {
        Self { noise_std: 1. }
    }
}

impl Simulator for LinearGaussian {
    fn simulate<R>(&self, theta_nd: &Tensor, rng: &mut R) -> candle_core::Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let (n, d) = theta_nd.dims2()?;
        let eps_nd = randn_with(n, d, rng, theta_nd.device())?.to_dtype(theta_nd.dtype())?;
        theta_nd + (eps_nd * self.noise_std as f64)?
    }
}

///
/// Run `simulator` over chunks of `batch_size` rows in parallel.
/// Each chunk gets its own generator seeded from `rng`, so the result
/// only depends on `rng` and `batch_size`.
///
pub fn simulate_in_batches<S, R>(
    simulator: &S,
    theta_nd: &Tensor,
    batch_size: usize,
    rng: &mut R,
) -> Result<Tensor>
where
    S: Simulator,
    R: Rng + ?Sized,
{
    if batch_size == 0 {
        return Err(SbiError::InvalidArgument(
            "simulation batch size must be positive".into(),
        ));
    }

    let ntot = theta_nd.dim(0)?;
    let base_seed = rng.random::<u64>();

    let chunks = (0..ntot)
        .step_by(batch_size)
        .map(|lb| (lb, batch_size.min(ntot - lb)))
        .collect::<Vec<_>>();

    let x_chunks = chunks
        .par_iter()
        .enumerate()
        .map(|(j, &(lb, len))| {
            let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(j as u64));
            simulator.simulate(&theta_nd.narrow(0, lb, len)?, &mut rng)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    if x_chunks.is_empty() {
        return Err(SbiError::InvalidArgument("no parameters to simulate".into()));
    }
    Ok(Tensor::cat(&x_chunks, 0)?)
}

/// Draws from the exact posterior of `LinearGaussian` under the prior
/// N(0, τ² I)
///
/// θ | x_o ~ N(τ² / (τ² + σ²) x_o, τ² σ² / (τ² + σ²) I)
pub fn linear_gaussian_posterior_gaussian_prior<R>(
    x_o: &Tensor,
    prior_var: f32,
    noise_std: f32,
    num_samples: usize,
    rng: &mut R,
) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let x_o_1d = x_o.flatten_all()?.unsqueeze(0)?.to_dtype(DType::F32)?;
    let d = x_o_1d.dim(1)?;

    let noise_var = noise_std * noise_std;
    let shrink = (prior_var / (prior_var + noise_var)) as f64;
    let post_std = ((prior_var * noise_var) / (prior_var + noise_var)).sqrt() as f64;

    let eps_nd = randn_with(num_samples, d, rng, x_o.device())?;
    Ok((eps_nd * post_std)?.broadcast_add(&(x_o_1d * shrink)?)?)
}

/// Draws from the exact posterior of `LinearGaussian` under a uniform
/// box prior: N(x_o, σ² I) restricted to the box, by rejection
pub fn linear_gaussian_posterior_box_prior<R>(
    x_o: &Tensor,
    prior: &BoxUniform,
    noise_std: f32,
    num_samples: usize,
    rng: &mut R,
) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    const MAX_TRIALS: usize = 1000;

    let x_o_1d = x_o.flatten_all()?.unsqueeze(0)?.to_dtype(DType::F32)?;
    let d = x_o_1d.dim(1)?;

    let mut accepted = vec![];
    let mut count = 0;
    for _ in 0..MAX_TRIALS {
        let theta_nd = (randn_with(num_samples, d, rng, x_o.device())? * noise_std as f64)?
            .broadcast_add(&x_o_1d)?;
        let inside: Vec<u32> = prior
            .support_mask(&theta_nd)?
            .to_vec1::<u8>()?
            .into_iter()
            .enumerate()
            .filter(|&(_, m)| m > 0)
            .map(|(i, _)| i as u32)
            .collect();
        if !inside.is_empty() {
            count += inside.len();
            let idx = Tensor::from_vec(inside.clone(), inside.len(), x_o.device())?;
            accepted.push(theta_nd.index_select(&idx, 0)?);
        }
        if count >= num_samples {
            return Ok(Tensor::cat(&accepted, 0)?.narrow(0, 0, num_samples)?);
        }
    }

    Err(SbiError::Numerical(format!(
        "only {} of {} posterior samples fell inside the prior box",
        count, num_samples
    )))
}

/// Pairwise squared Euclidean distances (n x m)
fn pairwise_sq_dist(a_nd: &Tensor, b_md: &Tensor) -> candle_core::Result<Tensor> {
    let a_sq = a_nd.sqr()?.sum_keepdim(1)?;
    let b_sq = b_md.sqr()?.sum_keepdim(1)?.transpose(0, 1)?;
    let ab = a_nd.matmul(&b_md.transpose(0, 1)?)?;
    (a_sq.broadcast_add(&b_sq)? - (ab * 2.)?)?.maximum(0.)
}

///
/// Unbiased estimate of the squared maximum mean discrepancy between
/// samples `x` (n x d) and `y` (m x d) with a Gaussian kernel. The
/// bandwidth is the median pairwise distance of the pooled samples.
///
pub fn unbiased_mmd_squared(x_nd: &Tensor, y_md: &Tensor) -> Result<f64> {
    let x_nd = x_nd.to_dtype(DType::F64)?;
    let y_md = y_md.to_dtype(DType::F64)?;
    let (nx, ny) = (x_nd.dim(0)?, y_md.dim(0)?);
    if nx < 2 || ny < 2 {
        return Err(SbiError::InvalidArgument(
            "need at least two samples on each side".into(),
        ));
    }

    let lower_triangle = |mat: Vec<Vec<f64>>| -> Vec<f64> {
        mat.into_iter()
            .enumerate()
            .flat_map(|(i, row)| row.into_iter().take(i))
            .collect()
    };

    let xx = lower_triangle(pairwise_sq_dist(&x_nd, &x_nd)?.to_vec2::<f64>()?);
    let yy = lower_triangle(pairwise_sq_dist(&y_md, &y_md)?.to_vec2::<f64>()?);
    let xy = pairwise_sq_dist(&x_nd, &y_md)?
        .flatten_all()?
        .to_vec1::<f64>()?;

    let mut dist: Vec<f64> = xx.iter().chain(xy.iter()).chain(yy.iter()).map(|d| d.sqrt()).collect();
    dist.sort_by(|a, b| a.total_cmp(b));
    let scale = dist[(dist.len() - 1) / 2];
    if !(scale > 0.) {
        return Err(SbiError::Numerical("degenerate samples: zero median distance".into()));
    }

    let c = -0.5 / (scale * scale);
    let k = |sq: &[f64]| sq.iter().map(|d| (c * d).exp()).sum::<f64>();
    let kxx = k(&xx) / (nx * (nx - 1)) as f64;
    let kyy = k(&yy) / (ny * (ny - 1)) as f64;
    let kxy = k(&xy) / (nx * ny) as f64;

    Ok(2. * (kxx + kyy - kxy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn linear_gaussian_moments() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let theta = Tensor::zeros((20_000, 2), DType::F32, &dev)?;
        let mut rng = StdRng::seed_from_u64(0);
        let x = simulate_in_batches(&LinearGaussian::default(), &theta, 1000, &mut rng)?;
        assert_eq!(x.dims(), &[20_000, 2]);

        let mean = x.mean(0)?.to_vec1::<f32>()?;
        let var = x.var(0)?.to_vec1::<f32>()?;
        for j in 0..2 {
            assert!(mean[j].abs() < 5e-2, "mean {:?}", mean);
            assert!((var[j].sqrt() - 1.).abs() < 5e-2, "var {:?}", var);
        }
        Ok(())
    }

    #[test]
    fn batching_is_reproducible() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let theta = Tensor::randn(0f32, 1f32, (103, 3), &dev)?;
        let sim = LinearGaussian { noise_std: 0.5 };

        let a = simulate_in_batches(&sim, &theta, 10, &mut StdRng::seed_from_u64(7))?;
        let b = simulate_in_batches(&sim, &theta, 10, &mut StdRng::seed_from_u64(7))?;
        assert_eq!(a.dims(), &[103, 3]);
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);

        assert!(simulate_in_batches(&sim, &theta, 0, &mut StdRng::seed_from_u64(7)).is_err());
        Ok(())
    }

    #[test]
    fn analytic_posteriors() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x_o = Tensor::new(&[2_f32, -2.], &dev)?;
        let mut rng = StdRng::seed_from_u64(3);

        let theta = linear_gaussian_posterior_gaussian_prior(&x_o, 1., 1., 20_000, &mut rng)?;
        let mean = theta.mean(0)?.to_vec1::<f32>()?;
        let var = theta.var(0)?.to_vec1::<f32>()?;
        assert!((mean[0] - 1.).abs() < 0.03 && (mean[1] + 1.).abs() < 0.03);
        assert!((var[0] - 0.5).abs() < 0.03 && (var[1] - 0.5).abs() < 0.03);

        let prior = BoxUniform::symmetric(2, -1., 1., &dev)?;
        let theta = linear_gaussian_posterior_box_prior(&x_o, &prior, 1., 500, &mut rng)?;
        assert_eq!(theta.dims(), &[500, 2]);
        let mask = prior.support_mask(&theta)?.to_dtype(DType::F32)?;
        assert_eq!(mask.sum_all()?.to_scalar::<f32>()?, 500.);
        Ok(())
    }

    #[test]
    fn mmd_separates_distributions() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(12);
        let x = randn_with(300, 2, &mut rng, &dev)?;
        let y = randn_with(300, 2, &mut rng, &dev)?;
        let z = (randn_with(300, 2, &mut rng, &dev)? + 2.)?;

        let same = unbiased_mmd_squared(&x, &y)?;
        let shifted = unbiased_mmd_squared(&x, &z)?;
        assert!(same.abs() < 0.02, "same {}", same);
        assert!(shifted > 0.2, "shifted {}", shifted);
        Ok(())
    }
}
