//! Elementwise divergences and likelihoods used by the variational bound.
use tch::{Kind, Tensor};

/// Mean over all non-batch dimensions.
pub fn mean_flat(xs: &Tensor) -> Tensor {
    xs.flatten(1, -1).mean_dim(Some([1i64].as_slice()), false, Kind::Float)
}

/// KL divergence between two Gaussians, elementwise.
pub fn normal_kl(mean1: &Tensor, logvar1: &Tensor, mean2: &Tensor, logvar2: &Tensor) -> Tensor {
    0.5 * (-1.0 + logvar2 - logvar1
        + (logvar1 - logvar2).exp()
        + (mean1 - mean2).square() * (-logvar2).exp())
}

/// A fast approximation of the cumulative distribution function of the
/// standard normal.
pub fn approx_standard_normal_cdf(xs: &Tensor) -> Tensor {
    let inner = (2.0f64 / std::f64::consts::PI).sqrt() * (xs + 0.044715f64 * xs.pow_tensor_scalar(3));
    0.5f64 * (1.0f64 + inner.tanh())
}

/// Log-likelihood of a Gaussian discretizing data scaled to [-1, 1] into 256
/// bins, elementwise.
pub fn discretized_gaussian_log_likelihood(
    xs: &Tensor,
    means: &Tensor,
    log_scales: &Tensor,
) -> Tensor {
    let centered_x = xs - means;
    let inv_stdv = (-log_scales).exp();
    let cdf_plus = approx_standard_normal_cdf(&(&inv_stdv * (&centered_x + 1.0 / 255.0)));
    let cdf_min = approx_standard_normal_cdf(&(&inv_stdv * (&centered_x - 1.0 / 255.0)));
    let log_cdf_plus = cdf_plus.clamp_min(1e-12).log();
    let log_one_minus_cdf_min = (1.0f64 - &cdf_min).clamp_min(1e-12).log();
    let log_cdf_delta = (cdf_plus - cdf_min).clamp_min(1e-12).log();
    let upper = log_one_minus_cdf_min.where_self(&xs.gt(0.999), &log_cdf_delta);
    log_cdf_plus.where_self(&xs.lt(-0.999), &upper)
}
