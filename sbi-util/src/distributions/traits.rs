use candle_core::{DType, Result, Tensor};
use rand::Rng;

/// Prior distribution trait.
pub trait Prior {
    /// Compute log p(θ) under the prior.
    ///
    /// # Arguments
    /// * `theta_nd` - Parameter batch, shape (n, d)
    ///
    /// # Returns
    /// Log prior probability, shape (n,); `-inf` outside the support
    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor>;

    /// Draw `num_samples` parameter vectors, shape (num_samples, d)
    fn sample<R>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized;

    /// Per-row support indicator (`u8`), shape (n,)
    fn support_mask(&self, theta_nd: &Tensor) -> Result<Tensor> {
        Tensor::ones(theta_nd.dim(0)?, DType::U8, theta_nd.device())
    }

    /// Whether the support is a bounded box rather than all of R^d
    fn has_bounded_support(&self) -> bool {
        false
    }

    fn dim(&self) -> usize;
}
