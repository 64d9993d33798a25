pub mod atomic;
pub mod calibration;
pub mod cli;
pub mod inference;
pub mod posterior;
pub mod round_data;
pub mod simulators;
pub mod snpe_c;
pub mod sre;

pub use calibration::{CalibrationKernel, ConstantKernel, GaussianDistanceKernel};
pub use inference::{SnpeC, SnpeCConfig, Sre, SreConfig, TrainConfig};
pub use posterior::NeuralPosterior;
pub use snpe_c::ProposalPosterior;
pub use sre::{RatioEstimatorLoss, SreLoss};
