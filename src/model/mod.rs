//! GLOW model implementation
//!
//! This module provides:
//! - ops: channel split/concat and squeeze/unsqueeze helpers
//! - ActNorm: data-dependent activation normalization
//! - InvertibleConv1x1: learned invertible channel mixing
//! - AffineCoupling: affine coupling layer and its conditioning network
//! - FlowStep: complete flow step (ActNorm + 1x1 Conv + Coupling)
//! - LatentPrior: Gaussian priors over the held-out latent slices
//! - GLOWModel: full GLOW model with multi-scale architecture

mod coupling;
mod glow;
mod layers;
pub mod ops;
mod prior;

pub use coupling::{AffineCoupling, CouplingNet, SeqConv};
pub use glow::{GLOWConfig, GLOWModel, LevelShape};
pub use layers::{ActNorm, ActNormState, Bijector, FlowLayer, FlowStep, InvertibleConv1x1, Squeeze};
pub use ops::FeatureMap;
pub use prior::{ConditionalPrior, LatentPrior, LearnedPrior};
