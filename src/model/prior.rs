//! Gaussian priors over the latent slices held out at each scale
//!
//! Each prior reparametrizes a slice `v` into normalized coordinates
//! `z = (v - mean) / std` and scores `v` under `N(mean, std)`. The
//! intermediate variant predicts `(mean, log_std)` from the retained half,
//! the terminal variant learns them directly.

use ndarray::Array4;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::coupling::{normal, SeqConv};
use super::ops::{self, FeatureMap};
use crate::error::{FlowError, Result};

const NEAR_ZERO_STD: f64 = 1e-3;

fn normalize(v: &FeatureMap, mean: &FeatureMap, log_std: &FeatureMap) -> FeatureMap {
    (v - mean) / &log_std.mapv(f64::exp)
}

fn denormalize(z: &FeatureMap, mean: &FeatureMap, log_std: &FeatureMap, temperature: f64) -> FeatureMap {
    z * &log_std.mapv(|ls| ls.exp() * temperature) + mean
}

fn log_prob(v: &FeatureMap, mean: &FeatureMap, log_std: &FeatureMap) -> Result<f64> {
    let per_item = ops::gaussian_log_density(v, mean, log_std)?;
    Ok(ops::batch_mean_of_sums(&per_item))
}

/// Prior on an intermediate slice, conditioned on the retained channels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionalPrior {
    conv: Option<SeqConv>,
}

impl ConditionalPrior {
    pub fn new() -> Self {
        Self { conv: None }
    }

    /// Allocate the 1x1 projection from `retained` to `2 * held` channels.
    pub fn build(&mut self, held: usize, retained: usize) -> Result<()> {
        match &self.conv {
            None => {
                self.conv = Some(SeqConv::near_zero(retained, 2 * held, 1, 0.0)?);
                debug!(held, retained, "ConditionalPrior built");
                Ok(())
            }
            Some(conv) => Self::check(conv, held, retained),
        }
    }

    /// Projection layer, once built
    pub fn conv(&self) -> Option<&SeqConv> {
        self.conv.as_ref()
    }

    pub fn conv_mut(&mut self) -> Option<&mut SeqConv> {
        self.conv.as_mut()
    }

    fn check(conv: &SeqConv, held: usize, retained: usize) -> Result<()> {
        if conv.in_channels() != retained {
            return Err(FlowError::ChannelMismatch {
                expected: conv.in_channels(),
                got: retained,
            });
        }
        if conv.out_channels() != 2 * held {
            return Err(FlowError::ChannelMismatch {
                expected: conv.out_channels() / 2,
                got: held,
            });
        }
        Ok(())
    }

    fn mean_log_std(&self, held: usize, cond: &FeatureMap) -> Result<(FeatureMap, FeatureMap)> {
        let conv = self
            .conv
            .as_ref()
            .ok_or(FlowError::Uninitialized("ConditionalPrior"))?;
        Self::check(conv, held, cond.dim().3)?;
        ops::split_half(&conv.forward(cond)?)
    }

    pub fn forward(&self, v: &FeatureMap, cond: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let (mean, log_std) = self.mean_log_std(v.dim().3, cond)?;
        let z = normalize(v, &mean, &log_std);
        let log_p = if logdet { log_prob(v, &mean, &log_std)? } else { 0.0 };
        Ok((z, log_p))
    }

    pub fn reverse(&self, z: &FeatureMap, cond: &FeatureMap, temperature: f64) -> Result<FeatureMap> {
        let (mean, log_std) = self.mean_log_std(z.dim().3, cond)?;
        Ok(denormalize(z, &mean, &log_std, temperature))
    }
}

/// Prior on the coarsest slice with directly learned `(mean, log_std)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearnedPrior {
    /// Shape [1, length, width, 2 * channels]: means then log-stds
    params: Option<Array4<f64>>,
}

impl LearnedPrior {
    pub fn new() -> Self {
        Self { params: None }
    }

    /// Allocate near-zero parameters for slices shaped `(length, width, channels)`.
    pub fn build(&mut self, length: usize, width: usize, channels: usize) -> Result<()> {
        match &self.params {
            None => {
                self.params = Some(Array4::random(
                    (1, length, width, 2 * channels),
                    normal(0.0, NEAR_ZERO_STD)?,
                ));
                debug!(length, channels, "LearnedPrior built");
                Ok(())
            }
            Some(params) => Self::check(params, (length, width, channels)),
        }
    }

    /// Raw `(mean, log_std)` tensor, once built
    pub fn params(&self) -> Option<&Array4<f64>> {
        self.params.as_ref()
    }

    pub fn params_mut(&mut self) -> Option<&mut Array4<f64>> {
        self.params.as_mut()
    }

    fn check(params: &Array4<f64>, (length, width, channels): (usize, usize, usize)) -> Result<()> {
        let (_, l, w, c) = params.dim();
        if c != 2 * channels {
            return Err(FlowError::ChannelMismatch {
                expected: c / 2,
                got: channels,
            });
        }
        if (l, w) != (length, width) {
            return Err(FlowError::InvalidShape(format!(
                "terminal prior built for {}x{}, got {}x{}",
                l, w, length, width
            )));
        }
        Ok(())
    }

    fn mean_log_std(&self, v: &FeatureMap) -> Result<(FeatureMap, FeatureMap)> {
        let params = self
            .params
            .as_ref()
            .ok_or(FlowError::Uninitialized("LearnedPrior"))?;
        let (_, length, width, channels) = v.dim();
        Self::check(params, (length, width, channels))?;
        ops::split_half(params)
    }

    pub fn forward(&self, v: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let (mean, log_std) = self.mean_log_std(v)?;
        let z = normalize(v, &mean, &log_std);
        let log_p = if logdet { log_prob(v, &mean, &log_std)? } else { 0.0 };
        Ok((z, log_p))
    }

    pub fn reverse(&self, z: &FeatureMap, temperature: f64) -> Result<FeatureMap> {
        let (mean, log_std) = self.mean_log_std(z)?;
        Ok(denormalize(z, &mean, &log_std, temperature))
    }
}

/// Prior attached to one scale level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LatentPrior {
    /// Levels before the last: conditioned on the retained half
    Conditional(ConditionalPrior),
    /// Last level: unconditioned
    Learned(LearnedPrior),
}

impl LatentPrior {
    /// Build the prior from the first observed slice and its conditioning input.
    pub fn prime(&mut self, held: &FeatureMap, cond: Option<&FeatureMap>) -> Result<()> {
        let (_, length, width, channels) = held.dim();
        match self {
            LatentPrior::Conditional(prior) => {
                let cond = Self::require(cond)?;
                prior.build(channels, cond.dim().3)
            }
            LatentPrior::Learned(prior) => prior.build(length, width, channels),
        }
    }

    /// Normalize `held`, returning its log-probability when `logdet` is set.
    pub fn forward(
        &self,
        held: &FeatureMap,
        cond: Option<&FeatureMap>,
        logdet: bool,
    ) -> Result<(FeatureMap, f64)> {
        match self {
            LatentPrior::Conditional(prior) => prior.forward(held, Self::require(cond)?, logdet),
            LatentPrior::Learned(prior) => prior.forward(held, logdet),
        }
    }

    /// Map normalized `z` back to raw values, widened by `temperature`.
    pub fn reverse(
        &self,
        z: &FeatureMap,
        cond: Option<&FeatureMap>,
        temperature: f64,
    ) -> Result<FeatureMap> {
        match self {
            LatentPrior::Conditional(prior) => prior.reverse(z, Self::require(cond)?, temperature),
            LatentPrior::Learned(prior) => prior.reverse(z, temperature),
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            LatentPrior::Conditional(prior) => prior.conv().map_or(0, SeqConv::num_parameters),
            LatentPrior::Learned(prior) => prior.params().map_or(0, |p| p.len()),
        }
    }

    fn require(cond: Option<&FeatureMap>) -> Result<&FeatureMap> {
        cond.ok_or_else(|| {
            FlowError::InvalidShape("conditional prior needs the retained channels".into())
        })
    }
}
