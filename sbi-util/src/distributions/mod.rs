//! Prior distributions over simulator parameters.
//!
//! Every prior evaluates `log p(θ)` row-wise on a batch `(n x d)` and
//! draws batches with an explicitly passed random generator.

mod box_uniform;
mod gaussian_prior;
mod traits;

pub use box_uniform::BoxUniform;
pub use gaussian_prior::GaussianPrior;
pub use traits::Prior;
