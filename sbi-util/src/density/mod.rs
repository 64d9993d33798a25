//! Conditional density estimators q(θ | x).
//!
//! Both estimators flatten trailing observation dimensions, so contexts
//! of shape `(n, d_x, ...)` are accepted. Observations can be z-scored
//! with a [`Standardize`] layer built from pilot simulations.

mod affine_coupling_flow;
mod conditional_gaussian;
mod standardize;
mod traits;

pub use affine_coupling_flow::{AffineCouplingFlow, AffineCouplingFlowArgs};
pub use conditional_gaussian::{ConditionalGaussian, ConditionalGaussianArgs};
pub use standardize::Standardize;
pub use traits::ConditionalDensity;
