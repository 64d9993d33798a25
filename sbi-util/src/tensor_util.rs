use crate::candle_loss_functions::log_sum_exp;
use crate::error::{Result, SbiError};

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

///
/// Flatten `x` and repeat the whole flattened sequence `n` times back
/// to back, e.g., `[1, 2]` with `n = 3` gives `[1, 2, 1, 2, 1, 2]`
///
/// * `x` - any tensor
/// * `n` - number of copies (positive)
///
pub fn tile(x: &Tensor, n: usize) -> Result<Tensor> {
    if n == 0 {
        return Err(SbiError::InvalidArgument(
            "tile count must be a positive integer".into(),
        ));
    }
    Ok(x.flatten_all()?.repeat(n)?)
}

///
/// Each row of `x` is repeated `num_reps` times along the leading
/// dimension, e.g., rows `[a, b]` become `[a, a, b, b]` for
/// `num_reps = 2`. Trailing dimensions are preserved.
///
/// * `x` - batch tensor (n x ...)
/// * `num_reps` - number of repetitions (positive)
///
pub fn repeat_rows(x: &Tensor, num_reps: usize) -> Result<Tensor> {
    if num_reps == 0 {
        return Err(SbiError::InvalidArgument(
            "number of repetitions must be a positive integer".into(),
        ));
    }

    let dims = x.dims();
    if dims.is_empty() {
        return Err(SbiError::InvalidArgument(
            "can't repeat rows of a scalar tensor".into(),
        ));
    }

    let mut expanded = Vec::with_capacity(dims.len() + 1);
    expanded.push(dims[0]);
    expanded.push(num_reps);
    expanded.extend_from_slice(&dims[1..]);

    let x_nr = x.unsqueeze(1)?.broadcast_as(expanded)?;
    merge_leading_dims(&x_nr, 2)
}

///
/// Reshape `x` so that the first `num_dims` dimensions are merged into one
///
pub fn merge_leading_dims(x: &Tensor, num_dims: usize) -> Result<Tensor> {
    if num_dims == 0 {
        return Err(SbiError::InvalidArgument(
            "number of leading dims must be a positive integer".into(),
        ));
    }
    if num_dims > x.rank() {
        return Err(SbiError::InvalidArgument(format!(
            "number of leading dims {} can't be greater than total number of dims {}",
            num_dims,
            x.rank()
        )));
    }

    let dims = x.dims();
    let mut new_shape = Vec::with_capacity(dims.len() - num_dims + 1);
    new_shape.push(dims[..num_dims].iter().product::<usize>());
    new_shape.extend_from_slice(&dims[num_dims..]);

    Ok(x.reshape(new_shape)?)
}

///
/// Reshape the leading dimension of `x` into `shape`, keeping the
/// trailing dimensions. One entry of `shape` may be `-1`, which is
/// inferred from the element count.
///
/// * `x` - tensor (n x ...)
/// * `shape` - decomposition of `n`
///
pub fn split_leading_dim(x: &Tensor, shape: &[isize]) -> Result<Tensor> {
    if shape.is_empty() {
        return Err(SbiError::InvalidArgument(
            "target shape of the leading dim can't be empty".into(),
        ));
    }
    if x.rank() == 0 {
        return Err(SbiError::InvalidArgument(
            "can't split the leading dim of a scalar tensor".into(),
        ));
    }
    if shape.iter().any(|&s| s < -1) {
        return Err(SbiError::InvalidArgument(format!(
            "invalid target shape {:?}",
            shape
        )));
    }

    let num_holes = shape.iter().filter(|&&s| s == -1).count();
    if num_holes > 1 {
        return Err(SbiError::InvalidArgument(format!(
            "at most one dim can be inferred in {:?}",
            shape
        )));
    }

    let dims = x.dims();
    let lead = dims[0];
    let known: usize = shape
        .iter()
        .filter(|&&s| s >= 0)
        .map(|&s| s as usize)
        .product();

    let fill = if num_holes == 1 {
        if known == 0 || lead % known != 0 {
            return Err(SbiError::Shape(format!(
                "can't split leading dim {} into {:?}",
                lead, shape
            )));
        }
        lead / known
    } else {
        if known != lead {
            return Err(SbiError::Shape(format!(
                "can't split leading dim {} into {:?}",
                lead, shape
            )));
        }
        0
    };

    let mut new_shape: Vec<usize> = shape
        .iter()
        .map(|&s| if s == -1 { fill } else { s as usize })
        .collect();
    new_shape.extend_from_slice(&dims[1..]);

    Ok(x.reshape(new_shape)?)
}

///
/// Sum all elements of `x` except for the first `num_batch_dims` dimensions
///
pub fn sum_except_batch(x: &Tensor, num_batch_dims: usize) -> Result<Tensor> {
    if num_batch_dims > x.rank() {
        return Err(SbiError::InvalidArgument(format!(
            "number of batch dims {} exceeds rank {}",
            num_batch_dims,
            x.rank()
        )));
    }
    if num_batch_dims == 0 {
        return Ok(x.sum_all()?);
    }
    if num_batch_dims == x.rank() {
        return Ok(x.clone());
    }
    let reduce_dims: Vec<usize> = (num_batch_dims..x.rank()).collect();
    Ok(x.sum(reduce_dims)?)
}

/// A binary mask (1 x features) alternating 1 and 0; with `even`
/// the even positions are set
pub fn create_alternating_binary_mask(
    features: usize,
    even: bool,
    device: &Device,
) -> Result<Tensor> {
    let start = if even { 0 } else { 1 };
    let mask: Vec<f32> = (0..features)
        .map(|j| if j % 2 == start { 1. } else { 0. })
        .collect();
    Ok(Tensor::from_vec(mask, (1, features), device)?)
}

/// A binary mask (1 x features) with the first `ceil(features / 2)` set
pub fn create_mid_split_binary_mask(features: usize, device: &Device) -> Result<Tensor> {
    let midpoint = features.div_ceil(2);
    let mask: Vec<f32> = (0..features)
        .map(|j| if j < midpoint { 1. } else { 0. })
        .collect();
    Ok(Tensor::from_vec(mask, (1, features), device)?)
}

/// A binary mask (1 x features) with `ceil(features / 2)` randomly chosen entries set
pub fn create_random_binary_mask<R>(features: usize, rng: &mut R, device: &Device) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let mut mask = vec![0_f32; features];
    for j in rand::seq::index::sample(rng, features, features.div_ceil(2)) {
        mask[j] = 1.;
    }
    Ok(Tensor::from_vec(mask, (1, features), device)?)
}

/// A single parameter vector `(d,)` becomes a batch `(1, d)`
pub fn ensure_parameter_batched(theta: &Tensor) -> Result<Tensor> {
    if theta.rank() == 1 {
        Ok(theta.unsqueeze(0)?)
    } else {
        Ok(theta.clone())
    }
}

/// A single observation gets a leading batch dim. A leading dim larger
/// than one is taken to be part of a multi-dimensional observation
/// (e.g., an image) rather than a batch.
pub fn ensure_observation_batched(x: &Tensor) -> Result<Tensor> {
    match x.dims() {
        [] => Ok(x.reshape((1, 1))?),
        [_] => Ok(x.unsqueeze(0)?),
        [n, ..] if *n > 1 => Ok(x.unsqueeze(0)?),
        _ => Ok(x.clone()),
    }
}

/// Tensors of rank 0 or 1 become `(1, n)`
pub fn atleast_2d(x: &Tensor) -> Result<Tensor> {
    if x.rank() >= 2 {
        Ok(x.clone())
    } else {
        Ok(x.reshape((1, x.elem_count()))?)
    }
}

/// Standard normal draws (n x d) from an explicit generator
pub fn randn_with<R>(n: usize, d: usize, rng: &mut R, device: &Device) -> candle_core::Result<Tensor>
where
    R: Rng + ?Sized,
{
    let data: Vec<f32> = (0..n * d).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_vec(data, (n, d), device)
}

/// Whether every element of `x` is finite
pub fn all_finite(x: &Tensor) -> Result<bool> {
    let values = x.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

/// Fail with `SbiError::Numerical` unless every element of `x` is finite
pub fn check_finite(x: &Tensor, what: &str) -> Result<()> {
    if all_finite(x)? {
        Ok(())
    } else {
        Err(SbiError::Numerical(format!(
            "NaN/inf detected in {} eval",
            what
        )))
    }
}

///
/// Log density of a Gaussian kernel density estimate at `query`
///
/// bandwidth = N^(-1 / (D + 4)) with isotropic covariance
///
/// * `samples_nd` - kernel centers (N x D)
/// * `query` - a single point (D,) or (1 x D)
///
pub fn gaussian_kde_log_eval(samples_nd: &Tensor, query: &Tensor) -> Result<f64> {
    let (n, d) = samples_nd.dims2()?;
    let query_1d = query.reshape((1, d))?.to_dtype(samples_nd.dtype())?;

    let std = (n as f64).powf(-1. / (d as f64 + 4.));
    let ln_2pi = (2. * std::f64::consts::PI).ln();
    let log_norm = -(n as f64).ln() - 0.5 * d as f64 * ln_2pi - d as f64 * std.ln();

    let sq_n = query_1d
        .broadcast_sub(samples_nd)?
        .sqr()?
        .sum_keepdim(1)?
        .transpose(0, 1)?;
    let log_kernel_1n = ((sq_n * (-0.5 / (std * std)))? + log_norm)?;

    let ret = log_sum_exp(&log_kernel_1n, 1)?;
    Ok(ret.squeeze(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
