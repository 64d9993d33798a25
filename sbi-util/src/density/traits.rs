use candle_core::{Result, Tensor};
use rand::Rng;

/// A differentiable conditional density q(θ | x)
pub trait ConditionalDensity {
    /// Evaluate log q(θ | x) row by row
    ///
    /// # Arguments
    /// * `theta_nd` - parameters (n x d)
    /// * `x_nm` - observations (n x m ...), aligned with `theta_nd`
    /// * `normalize` - whether to apply a normalization correction
    ///   (e.g., for mass leaking outside a bounded prior); plain
    ///   density estimators are already normalized and ignore it
    ///
    /// # Returns
    /// log-density (n,)
    fn log_prob(&self, theta_nd: &Tensor, x_nm: &Tensor, normalize: bool) -> Result<Tensor>;

    /// Draw `num_samples` parameter vectors given a single observation
    ///
    /// # Arguments
    /// * `x_1m` - one observation (1 x m ...)
    ///
    /// # Returns
    /// samples (num_samples x d)
    fn sample<R>(&self, num_samples: usize, x_1m: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized;

    fn dim_theta(&self) -> usize;

    fn dim_obs(&self) -> usize;
}
