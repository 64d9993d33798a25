pub mod candle_aux_layers;
pub mod candle_loss_functions;
pub mod classifier;
pub mod density;
pub mod distributions;
pub mod error;
pub mod tensor_util;

pub use error::{Result, SbiError};

pub use candle_core;
pub use candle_nn;
