use sbi_util::density::ConditionalDensity;
use sbi_util::distributions::Prior;
use sbi_util::error::SbiError;
use sbi_util::tensor_util::repeat_rows;

use candle_core::{DType, Result, Tensor};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

///
/// A trained posterior q(θ | x) under a prior p(θ).
///
/// For a prior with bounded support, the density model may put mass
/// outside of it. Samples are then drawn by rejection, and normalized
/// log-probabilities are
///
/// log q(θ | x) - log P_q(θ ∈ support | x) inside the support, -inf outside.
///
pub struct NeuralPosterior<'a, D, P>
where
    D: ConditionalDensity,
    P: Prior,
{
    density: &'a D,
    prior: &'a P,
    num_leakage_samples: usize,
    max_sampling_rounds: usize,
    leakage_seed: u64,
}

impl<'a, D, P> NeuralPosterior<'a, D, P>
where
    D: ConditionalDensity,
    P: Prior,
{
    /// Acceptance rate below which sampling warns
    const LOW_ACCEPTANCE: f64 = 1e-3;

    pub fn new(density: &'a D, prior: &'a P) -> Self {
        Self {
            density,
            prior,
            num_leakage_samples: 10_000,
            max_sampling_rounds: 100,
            leakage_seed: 42,
        }
    }

    /// Number of model samples behind each acceptance-rate estimate
    pub fn with_num_leakage_samples(mut self, num_leakage_samples: usize) -> Self {
        self.num_leakage_samples = num_leakage_samples.max(1);
        self
    }

    /// Rejection-sampling attempts before giving up
    pub fn with_max_sampling_rounds(mut self, max_sampling_rounds: usize) -> Self {
        self.max_sampling_rounds = max_sampling_rounds.max(1);
        self
    }

    pub fn density(&self) -> &D {
        self.density
    }

    pub fn prior(&self) -> &P {
        self.prior
    }

    /// Fraction of q(θ | x_o) inside the prior support
    ///
    /// * `x_1m` - a single observation (1 x m ...)
    pub fn acceptance_rate(&self, x_1m: &Tensor) -> Result<f64> {
        let mut rng = StdRng::seed_from_u64(self.leakage_seed);
        let theta_nd = self.density.sample(self.num_leakage_samples, x_1m, &mut rng)?;
        let inside = self
            .prior
            .support_mask(&theta_nd)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(inside as f64 / self.num_leakage_samples as f64)
    }

    /// log acceptance rate per row of `x_nm`; identical rows share one
    /// estimate
    fn log_acceptance_n(&self, x_nm: &Tensor, n: usize) -> Result<Tensor> {
        let num_obs = x_nm.dim(0)?;
        let rows = x_nm
            .flatten_from(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let mut cache: HashMap<Vec<u32>, f64> = HashMap::new();
        let mut rates = Vec::with_capacity(num_obs);
        for (i, row) in rows.iter().enumerate() {
            let key: Vec<u32> = row.iter().map(|v| v.to_bits()).collect();
            let rate = match cache.get(&key) {
                Some(&r) => r,
                None => {
                    let r = self.acceptance_rate(&x_nm.narrow(0, i, 1)?)?;
                    cache.insert(key, r);
                    r
                }
            };
            rates.push(rate);
        }
        debug!(
            "leakage: {} acceptance estimates for {} observations",
            cache.len(),
            num_obs
        );

        if let Some(r) = rates.iter().find(|&&r| r <= 0.) {
            return Err(candle_core::Error::wrap(SbiError::Numerical(format!(
                "no posterior mass inside the prior support (acceptance {})",
                r
            ))));
        }

        let log_rates: Vec<f32> = rates.iter().map(|r| r.ln() as f32).collect();
        let log_acc = Tensor::from_vec(log_rates, num_obs, x_nm.device())?;
        if num_obs == 1 && n > 1 {
            log_acc.broadcast_as(n)?.contiguous()
        } else {
            Ok(log_acc)
        }
    }
}

impl<D, P> ConditionalDensity for NeuralPosterior<'_, D, P>
where
    D: ConditionalDensity,
    P: Prior,
{
    ///
    /// * `theta_nd` - parameters (n x d)
    /// * `x_nm` - observations (n x m ...), or a single one (1 x m ...)
    /// * `normalize` - correct for leakage outside a bounded prior
    ///
    /// With `normalize` under a bounded prior, every distinct
    /// observation row costs `num_leakage_samples` model draws.
    ///
    fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, normalize: bool) -> Result<Tensor> {
        let n = theta_nd.dim(0)?;
        let x_rep = if x_nm.dim(0)? == 1 && n > 1 {
            repeat_rows(x_nm, n).map_err(candle_core::Error::wrap)?
        } else {
            x_nm.clone()
        };

        let log_q_n = self.density.log_prob(theta_nd, &x_rep, false)?;
        if !normalize || !self.prior.has_bounded_support() {
            return Ok(log_q_n);
        }

        // one acceptance rate per distinct observation row
        let log_acc_n = self.log_acceptance_n(x_nm, n)?.to_dtype(log_q_n.dtype())?;
        let inside_n = self.prior.support_mask(theta_nd)?;
        let neg_inf_n = Tensor::full(f32::NEG_INFINITY, n, theta_nd.device())?
            .to_dtype(log_q_n.dtype())?;
        inside_n.where_cond(&(log_q_n - log_acc_n)?, &neg_inf_n)
    }

    /// Rejection sampling against the prior support
    fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        if !self.prior.has_bounded_support() {
            return self.density.sample(num_samples, x_1m, rng);
        }

        let mut accepted = vec![];
        let (mut num_accepted, mut num_drawn) = (0, 0);

        for _ in 0..self.max_sampling_rounds {
            let theta_nd = self.density.sample(num_samples, x_1m, rng)?;
            num_drawn += num_samples;

            let inside: Vec<u32> = self
                .prior
                .support_mask(&theta_nd)?
                .to_vec1::<u8>()?
                .into_iter()
                .enumerate()
                .filter(|&(_, m)| m > 0)
                .map(|(i, _)| i as u32)
                .collect();

            if !inside.is_empty() {
                num_accepted += inside.len();
                let idx = Tensor::from_vec(inside.clone(), inside.len(), theta_nd.device())?;
                accepted.push(theta_nd.index_select(&idx, 0)?);
            }
            if num_accepted >= num_samples {
                break;
            }
        }

        let rate = num_accepted as f64 / num_drawn.max(1) as f64;
        debug!("rejection sampling: {} / {} accepted", num_accepted, num_drawn);

        if num_accepted < num_samples {
            return Err(candle_core::Error::wrap(SbiError::Numerical(format!(
                "only {} of {} samples inside the prior support after {} draws",
                num_accepted, num_samples, num_drawn
            ))));
        }
        if rate < Self::LOW_ACCEPTANCE {
            warn!(
                "only {:.3}% of posterior samples fall inside the prior support",
                rate * 100.
            );
        }

        Tensor::cat(&accepted, 0)?.narrow(0, 0, num_samples)
    }

    fn dim_theta(&self) -> usize {
        self.density.dim_theta()
    }

    fn dim_obs(&self) -> usize {
        self.density.dim_obs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbi_util::candle_loss_functions::standard_normal_log_density;
    use sbi_util::distributions::{BoxUniform, GaussianPrior};
    use sbi_util::tensor_util::randn_with;

    use candle_core::Device;
    use std::cell::Cell;

    /// q(θ | x) = N(θ; x, I) in one dimension
    struct Centered;

    impl ConditionalDensity for Centered {
        fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, _: bool) -> Result<Tensor> {
            standard_normal_log_density(&(theta_nd - x_nm)?)
        }

        fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
        where
            R: Rng + ?Sized,
        {
            randn_with(num_samples, 1, rng, x_1m.device())?.broadcast_add(x_1m)
        }

        fn dim_theta(&self) -> usize {
            1
        }

        fn dim_obs(&self) -> usize {
            1
        }
    }

    #[test]
    fn unbounded_prior_passes_through() -> Result<()> {
        let dev = Device::Cpu;
        let prior = GaussianPrior::standard(1, &dev)?;
        let posterior = NeuralPosterior::new(&Centered, &prior);
        let theta = Tensor::new(&[[0_f32], [1.]], &dev)?;
        let x = Tensor::new(&[[0_f32]], &dev)?;
        let a = posterior.log_prob(&theta, &x, true)?.to_vec1::<f32>()?;
        let b = posterior.log_prob(&theta, &x, false)?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn leakage_is_renormalized() -> Result<()> {
        // half of N(0, 1) lies in [0, 10)
        let dev = Device::Cpu;
        let prior = BoxUniform::new(vec![0.], vec![10.], &dev)?;
        let posterior = NeuralPosterior::new(&Centered, &prior).with_num_leakage_samples(40_000);
        let x = Tensor::new(&[[0_f32]], &dev)?;
        approx::assert_abs_diff_eq!(posterior.acceptance_rate(&x)?, 0.5, epsilon = 0.02);

        let theta = Tensor::new(&[[0.5_f32], [-0.5]], &dev)?;
        let log_p = posterior.log_prob(&theta, &x, true)?.to_vec1::<f32>()?;
        let raw = Centered.log_prob(&theta.narrow(0, 0, 1)?, &x, false)?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(log_p[0], raw[0] + 2_f32.ln(), epsilon = 0.05);
        assert_eq!(log_p[1], f32::NEG_INFINITY);
        Ok(())
    }

    #[test]
    fn identical_observations_share_one_estimate() -> Result<()> {
        struct Counting {
            draws: Cell<usize>,
        }

        impl ConditionalDensity for Counting {
            fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, _: bool) -> Result<Tensor> {
                Centered.log_prob(theta_nd, x_nm, false)
            }

            fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
            where
                R: Rng + ?Sized,
            {
                self.draws.set(self.draws.get() + 1);
                Centered.sample(num_samples, x_1m, rng)
            }

            fn dim_theta(&self) -> usize {
                1
            }

            fn dim_obs(&self) -> usize {
                1
            }
        }

        let dev = Device::Cpu;
        let prior = BoxUniform::new(vec![-5.], vec![5.], &dev)?;
        let density = Counting {
            draws: Cell::new(0),
        };
        let posterior = NeuralPosterior::new(&density, &prior).with_num_leakage_samples(100);
        let theta = Tensor::new(&[[0_f32], [1.], [-1.], [0.5]], &dev)?;

        let same = Tensor::new(&[[0.5_f32], [0.5], [0.5], [0.5]], &dev)?;
        let log_p = posterior.log_prob(&theta, &same, true)?;
        assert_eq!(log_p.dims(), &[4]);
        assert_eq!(density.draws.get(), 1);

        density.draws.set(0);
        let two = Tensor::new(&[[0.5_f32], [-0.5], [0.5], [-0.5]], &dev)?;
        let log_p = posterior.log_prob(&theta, &two, true)?.to_vec1::<f32>()?;
        assert_eq!(density.draws.get(), 2);

        // the shared estimate matches a fresh single-row evaluation
        let first = posterior
            .log_prob(&theta.narrow(0, 0, 1)?, &two.narrow(0, 0, 1)?, true)?
            .to_vec1::<f32>()?;
        assert_eq!(log_p[0], first[0]);
        Ok(())
    }

    #[test]
    fn rejection_sampling_stays_in_support() -> Result<()> {
        let dev = Device::Cpu;
        let prior = BoxUniform::new(vec![0.], vec![10.], &dev)?;
        let posterior = NeuralPosterior::new(&Centered, &prior);
        let x = Tensor::new(&[[0_f32]], &dev)?;
        let mut rng = StdRng::seed_from_u64(1);
        let theta = posterior.sample(1000, &x, &mut rng)?;
        assert_eq!(theta.dims(), &[1000, 1]);
        assert!(theta.min_all()?.to_scalar::<f32>()? >= 0.);
        Ok(())
    }

    #[test]
    fn unreachable_support_fails() -> Result<()> {
        let dev = Device::Cpu;
        let prior = BoxUniform::new(vec![50.], vec![51.], &dev)?;
        let posterior = NeuralPosterior::new(&Centered, &prior).with_max_sampling_rounds(3);
        let x = Tensor::new(&[[0_f32]], &dev)?;
        let mut rng = StdRng::seed_from_u64(1);
        assert!(posterior.sample(10, &x, &mut rng).is_err());
        Ok(())
    }
}
