use candle_core::{Device, Result, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::traits::Prior;

/// Fixed (non-learnable) diagonal Gaussian prior p(θ) = N(μ, diag(τ²))
pub struct GaussianPrior {
    /// Prior mean μ: shape (1, d)
    mean_1d: Tensor,
    /// Prior scale τ: shape (1, d)
    std_1d: Tensor,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl GaussianPrior {
    /// Create a new fixed Gaussian prior.
    ///
    /// # Arguments
    /// * `mean` - Prior mean μ, one entry per parameter
    /// * `std` - Prior scale τ, one positive entry per parameter
    /// * `device` - where log-probabilities are evaluated
    pub fn new(mean: Vec<f32>, std: Vec<f32>, device: &Device) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            candle_core::bail!(
                "mean ({}) and std ({}) must have the same positive length",
                mean.len(),
                std.len()
            );
        }
        if std.iter().any(|&s| !(s > 0.)) {
            candle_core::bail!("prior scales must be positive: {:?}", std);
        }
        let d = mean.len();
        let mean_1d = Tensor::from_slice(&mean, (1, d), device)?;
        let std_1d = Tensor::from_slice(&std, (1, d), device)?;
        Ok(Self {
            mean_1d,
            std_1d,
            mean,
            std,
        })
    }

    /// N(0, I) in `dim` dimensions
    pub fn standard(dim: usize, device: &Device) -> Result<Self> {
        Self::new(vec![0.; dim], vec![1.; dim], device)
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// Prior variance τ² per parameter
    pub fn var(&self) -> Vec<f32> {
        self.std.iter().map(|s| s * s).collect()
    }
}

impl Prior for GaussianPrior {
    /// Compute log p(θ) = sum over d of log N(θ_d; μ_d, τ_d²)
    ///
    /// log N(θ; μ, τ²) = -0.5 * [(θ-μ)²/τ² + 2*ln(τ) + ln(2π)]
    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let dtype = theta_nd.dtype();
        let mean_1d = self.mean_1d.to_dtype(dtype)?;
        let ln_std_1d = self.std_1d.to_dtype(dtype)?.log()?;
        crate::candle_loss_functions::gaussian_log_density(theta_nd, &mean_1d, &ln_std_1d)
    }

    fn sample<R>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let d = self.dim();
        let data: Vec<f32> = (0..num_samples * d)
            .map(|i| {
                let eps: f32 = StandardNormal.sample(rng);
                self.mean[i % d] + self.std[i % d] * eps
            })
            .collect();
        Tensor::from_vec(data, (num_samples, d), self.mean_1d.device())
    }

    fn dim(&self) -> usize {
        self.mean.len()
    }
}
