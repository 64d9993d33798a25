use candle_core::{Result, Tensor};

/// Numerically stable log-sum-exp along `dim` (the dim is removed)
///
/// lse(i) = max(i) + log sum_j exp( x(i,j) - max(i) )
///
/// The max shift is detached; it cancels in the gradient.
///
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max_keep = x.max_keepdim(dim)?.detach();
    let lse = x
        .broadcast_sub(&max_keep)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?;
    (lse + max_keep)?.squeeze(dim)
}

/// log sigmoid(x) = -softplus(-x) = min(x, 0) - log(1 + exp(-|x|))
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let neg_part = x.minimum(0.)?;
    let log1p = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    neg_part - log1p
}

/// Binary cross-entropy on logits averaged over all elements
///
/// bce = - mean [ y * log sigmoid(z) + (1 - y) * log sigmoid(-z) ]
///
/// * `logits` - classifier outputs `z`
/// * `labels` - targets `y` in {0, 1}, same shape as `logits`
///
pub fn binary_cross_entropy_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let pos = labels.mul(&log_sigmoid(logits)?)?;
    let neg = labels
        .affine(-1., 1.)?
        .mul(&log_sigmoid(&logits.neg()?)?)?;
    (pos + neg)?.mean_all()?.neg()
}

/// Diagonal Gaussian log density summed over the last dimension
///
/// llik(i) = -0.5 * sum_d [ (x(i,d) - mu(i,d))^2 / sigma(i,d)^2 + 2 ln sigma(i,d) + ln 2π ]
///
/// * `x_nd` - points (n x d)
/// * `mean_nd` - means, broadcastable to (n x d)
/// * `ln_std_nd` - log standard deviations, broadcastable to (n x d)
///
pub fn gaussian_log_density(x_nd: &Tensor, mean_nd: &Tensor, ln_std_nd: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let z_nd = x_nd
        .broadcast_sub(mean_nd)?
        .broadcast_div(&ln_std_nd.exp()?)?;
    let elem_nd = ((z_nd.sqr()? * 0.5)?.broadcast_add(ln_std_nd)? + 0.5 * ln_2pi)?;
    elem_nd.sum(x_nd.rank() - 1)?.neg()
}

/// Standard normal log density summed over the last dimension
pub fn standard_normal_log_density(z_nd: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let d = z_nd.dim(z_nd.rank() - 1)? as f64;
    ((z_nd.sqr()?.sum(z_nd.rank() - 1)? * (-0.5))? - 0.5 * d * ln_2pi)
}
