//! GLOW Sequence - Multi-scale normalizing flow over fixed-length sequence windows
//!
//! This library implements an exactly invertible GLOW model, featuring:
//! - Exact log-likelihood (in bits) via the change-of-variables formula
//! - Invertible transformations for both encoding and generation
//! - Multi-scale squeeze/split architecture over the sequence axis
//! - Temperature-controlled sampling
//!
//! Windows are `(batch, window_length, 1, channel_size)` arrays; latents are
//! `(batch, window_length * channel_size)` arrays.
//!
//! # Example
//!
//! ```no_run
//! use glow_sequence::{GLOWConfig, GLOWModel};
//! use ndarray::Array4;
//!
//! fn main() -> glow_sequence::Result<()> {
//!     let config = GLOWConfig::new(2, 2, 2, 16, 4);
//!     let mut model = GLOWModel::new(config)?;
//!
//!     let window = Array4::from_shape_fn((2, 16, 1, 4), |(b, t, _, c)| {
//!         ((b + t * c) as f64).sin()
//!     });
//!
//!     // The first forward call initializes every layer from the batch
//!     let (latent, bits) = model.forward(&window, true)?;
//!     println!("log-likelihood: {:.3} bits", bits);
//!
//!     let reconstructed = model.inverse(&latent, 1.0)?;
//!     assert_eq!(reconstructed.dim(), window.dim());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod model;
pub mod utils;

// Re-export main types
pub use error::{FlowError, Result};
pub use model::{
    ActNorm, AffineCoupling, Bijector, FeatureMap, FlowStep, GLOWConfig, GLOWModel,
    InvertibleConv1x1, LatentPrior, LevelShape,
};
pub use utils::Config;
