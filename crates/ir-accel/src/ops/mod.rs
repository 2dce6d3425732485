//! Accelerated operator adapters.

mod conv;

pub use conv::{ConvolutionFactory, SopConvolution};
