use candle_core::{Device, Result, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::traits::Prior;

/// Uniform distribution on the box `[low, high)` in `d` dimensions.
///
/// The `d` coordinates are event dimensions: `log_prob` returns one
/// number per row, `-sum_d ln(high_d - low_d)` inside the box and
/// `-inf` outside.
pub struct BoxUniform {
    low_1d: Tensor,
    high_1d: Tensor,
    low: Vec<f32>,
    high: Vec<f32>,
    log_density: f64,
}

impl BoxUniform {
    /// * `low` - lower range (inclusive)
    /// * `high` - upper range (exclusive)
    pub fn new(low: Vec<f32>, high: Vec<f32>, device: &Device) -> Result<Self> {
        if low.len() != high.len() || low.is_empty() {
            candle_core::bail!(
                "low ({}) and high ({}) must have the same positive length",
                low.len(),
                high.len()
            );
        }
        if low.iter().zip(high.iter()).any(|(l, h)| !(l < h)) {
            candle_core::bail!("empty box: low {:?}, high {:?}", low, high);
        }

        let d = low.len();
        let log_density = -low
            .iter()
            .zip(high.iter())
            .map(|(&l, &h)| ((h - l) as f64).ln())
            .sum::<f64>();

        Ok(Self {
            low_1d: Tensor::from_slice(&low, (1, d), device)?,
            high_1d: Tensor::from_slice(&high, (1, d), device)?,
            low,
            high,
            log_density,
        })
    }

    /// The same interval `[low, high)` in every one of `dim` coordinates
    pub fn symmetric(dim: usize, low: f32, high: f32, device: &Device) -> Result<Self> {
        Self::new(vec![low; dim], vec![high; dim], device)
    }

    pub fn low(&self) -> &[f32] {
        &self.low
    }

    pub fn high(&self) -> &[f32] {
        &self.high
    }
}

impl Prior for BoxUniform {
    fn log_prob(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let n = theta_nd.dim(0)?;
        let dtype = theta_nd.dtype();
        let device = theta_nd.device();

        let inside_n = self.support_mask(theta_nd)?;
        let log_p_n = Tensor::full(self.log_density, n, device)?.to_dtype(dtype)?;
        let neg_inf_n = Tensor::full(f64::NEG_INFINITY, n, device)?.to_dtype(dtype)?;
        inside_n.where_cond(&log_p_n, &neg_inf_n)
    }

    fn sample<R>(&self, num_samples: usize, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let d = self.dim();
        let unifs = self
            .low
            .iter()
            .zip(self.high.iter())
            .map(|(&l, &h)| Uniform::new(l, h).map_err(candle_core::Error::wrap))
            .collect::<Result<Vec<_>>>()?;
        let data: Vec<f32> = (0..num_samples * d)
            .map(|i| {
                let j = i % d;
                let u = unifs[j].sample(rng);
                // `high` stays exclusive under rounding
                if u < self.high[j] {
                    u
                } else {
                    self.low[j]
                }
            })
            .collect();
        Tensor::from_vec(data, (num_samples, d), self.low_1d.device())
    }

    fn support_mask(&self, theta_nd: &Tensor) -> Result<Tensor> {
        let dtype = theta_nd.dtype();
        let above_nd = theta_nd.broadcast_ge(&self.low_1d.to_dtype(dtype)?)?;
        let below_nd = theta_nd.broadcast_lt(&self.high_1d.to_dtype(dtype)?)?;
        above_nd.mul(&below_nd)?.min(1)
    }

    fn has_bounded_support(&self) -> bool {
        true
    }

    fn dim(&self) -> usize {
        self.low.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn log_prob_inside_and_outside() -> Result<()> {
        let dev = Device::Cpu;
        let prior = BoxUniform::new(vec![0., -1.], vec![3., 1.], &dev)?;
        let theta = Tensor::new(&[[1_f32, 0.], [0., -1.], [3., 0.], [1., 5.]], &dev)?;
        let log_p = prior.log_prob(&theta)?.to_vec1::<f32>()?;

        let inside = -(6_f32).ln();
        assert!((log_p[0] - inside).abs() < 1e-6);
        assert!((log_p[1] - inside).abs() < 1e-6);
        assert_eq!(log_p[2], f32::NEG_INFINITY);
        assert_eq!(log_p[3], f32::NEG_INFINITY);

        let mask = prior.support_mask(&theta)?.to_vec1::<u8>()?;
        assert_eq!(mask, vec![1, 1, 0, 0]);
        Ok(())
    }

    #[test]
    fn samples_stay_in_the_box() -> Result<()> {
        let dev = Device::Cpu;
        let prior = BoxUniform::symmetric(3, -1., 1., &dev)?;
        let mut rng = StdRng::seed_from_u64(1);
        let theta = prior.sample(1000, &mut rng)?;
        assert_eq!(theta.dims(), &[1000, 3]);
        let mask = prior.support_mask(&theta)?.to_dtype(DType::F32)?;
        assert_eq!(mask.sum_all()?.to_scalar::<f32>()?, 1000.);
        Ok(())
    }

    #[test]
    fn empty_box_is_rejected() {
        assert!(BoxUniform::new(vec![1.], vec![1.], &Device::Cpu).is_err());
    }
}
