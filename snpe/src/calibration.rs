use candle_core::{DType, Result, Tensor};

/// Per-example weight κ(x) on the contrastive loss
pub trait CalibrationKernel {
    /// * `x_nm` - observations (n x m ...)
    ///
    /// # Returns
    /// weights (n,), or a scalar tensor shared by every row
    fn weight(&self, x_nm: &Tensor) -> Result<Tensor>;
}

/// κ(x) = 1
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantKernel;

impl CalibrationKernel for ConstantKernel {
    fn weight(&self, x_nm: &Tensor) -> Result<Tensor> {
        Tensor::ones(x_nm.dim(0)?, DType::F32, x_nm.device())?.to_dtype(x_nm.dtype())
    }
}

/// κ(x) = exp(-|x - x_o|² / (2 h²)), concentrating training on
/// simulations close to the observation of interest
#[derive(Clone, Debug)]
pub struct GaussianDistanceKernel {
    x_o_1m: Tensor,
    bandwidth: f64,
}

impl GaussianDistanceKernel {
    pub fn new(x_o: &Tensor, bandwidth: f64) -> Result<Self> {
        if !(bandwidth > 0.) {
            candle_core::bail!("bandwidth must be positive, got {}", bandwidth);
        }
        let x_o_1m = x_o.flatten_all()?.unsqueeze(0)?;
        Ok(Self { x_o_1m, bandwidth })
    }
}

impl CalibrationKernel for GaussianDistanceKernel {
    fn weight(&self, x_nm: &Tensor) -> Result<Tensor> {
        let x_o_1m = self.x_o_1m.to_dtype(x_nm.dtype())?;
        let sq_n = x_nm.flatten_from(1)?.broadcast_sub(&x_o_1m)?.sqr()?.sum(1)?;
        (sq_n * (-0.5 / (self.bandwidth * self.bandwidth)))?.exp()
    }
}

impl<F> CalibrationKernel for F
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn weight(&self, x_nm: &Tensor) -> Result<Tensor> {
        self(x_nm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn constant_and_distance_kernels() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0_f32, 0.], [1., 0.], [0., 2.]], &dev)?;
        assert_eq!(ConstantKernel.weight(&x)?.to_vec1::<f32>()?, vec![1.; 3]);

        let x_o = Tensor::new(&[0_f32, 0.], &dev)?;
        let kernel = GaussianDistanceKernel::new(&x_o, 1.)?;
        let w = kernel.weight(&x)?.to_vec1::<f32>()?;
        assert!((w[0] - 1.).abs() < 1e-6);
        assert!((w[1] - (-0.5_f32).exp()).abs() < 1e-6);
        assert!((w[2] - (-2_f32).exp()).abs() < 1e-6);

        assert!(GaussianDistanceKernel::new(&x_o, 0.).is_err());
        Ok(())
    }

    #[test]
    fn closures_are_kernels() -> Result<()> {
        let half = |x: &Tensor| (Tensor::ones(x.dim(0)?, DType::F32, x.device())? * 0.5);
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(half.weight(&x)?.to_vec1::<f32>()?, vec![0.5, 0.5]);
        Ok(())
    }
}
