use candle_core::{DType, Result, Tensor};
use candle_nn::Module;
use log::warn;

/// Fixed z-scoring of flattened observations, `(x - mean) / std`
#[derive(Clone, Debug)]
pub struct Standardize {
    mean_1m: Tensor,
    std_1m: Tensor,
}

impl Standardize {
    /// Floor on the per-feature scale
    const MIN_STD: f64 = 1e-6;

    /// Estimate mean and scale from observations (n x m ...), n >= 2
    pub fn from_samples(x_nm: &Tensor) -> Result<Self> {
        let x_nm = x_nm.flatten_from(1)?;
        if x_nm.dim(0)? < 2 {
            candle_core::bail!("need at least two observations to z-score");
        }
        let mean_1m = x_nm.mean_keepdim(0)?;
        let std_1m = x_nm.var_keepdim(0)?.sqrt()?;

        let num_flat = std_1m
            .le(Self::MIN_STD)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        if num_flat > 0. {
            warn!("{} constant observation feature(s) left unscaled", num_flat);
        }

        let std_1m = std_1m.maximum(Self::MIN_STD)?;
        Ok(Self { mean_1m, std_1m })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean_1m
    }

    pub fn std(&self) -> &Tensor {
        &self.std_1m
    }
}

impl Module for Standardize {
    fn forward(&self, x_nm: &Tensor) -> Result<Tensor> {
        x_nm.flatten_from(1)?
            .broadcast_sub(&self.mean_1m)?
            .broadcast_div(&self.std_1m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn standardized_columns() -> Result<()> {
        let x = Tensor::new(&[[1_f32, 10.], [3., 10.], [5., 10.]], &Device::Cpu)?;
        let z = Standardize::from_samples(&x)?;
        let y = z.forward(&x)?.to_vec2::<f32>()?;
        assert!((y[0][0] + 1.).abs() < 1e-6);
        assert!(y[1][0].abs() < 1e-6);
        assert!((y[2][0] - 1.).abs() < 1e-6);
        // constant column stays finite
        assert!(y.iter().all(|row| row[1].abs() < 1e-3));
        Ok(())
    }
}
