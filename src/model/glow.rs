//! Multi-scale GLOW network
//!
//! Each of the `L` levels squeezes its input, runs `K` flow steps and holds
//! out part of the result as a latent slice scored by a Gaussian prior. The
//! latent vector concatenates the slices from the finest level to the coarsest.

use std::f64::consts::LN_2;

use ndarray::{concatenate, s, Array2, Array4, Axis};
use ndarray_rand::RandomExt;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use super::layers::{Bijector, FlowStep, Squeeze};
use super::ops::{self, FeatureMap};
use super::prior::{ConditionalPrior, LatentPrior, LearnedPrior};
use crate::error::{FlowError, Result};

/// Construction parameters of a GLOW network.
///
/// These fully determine every internal shape; an encoder and the decoder
/// inverting its latents must share them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GLOWConfig {
    /// Positions folded into channels by each squeeze
    pub factor_size: usize,
    /// Flow steps per level (K)
    pub num_steps: usize,
    /// Number of scale levels (L)
    pub num_levels: usize,
    /// Sequence length of one window
    pub window_length: usize,
    /// Input channel depth
    pub channel_size: usize,
    /// Width of the coupling sub-networks
    pub hidden_channels: usize,
    /// Kernel size of the coupling convolutions
    pub kernel_size: usize,
    /// Dropout rate inside the coupling sub-networks (training only)
    pub dropout: f64,
}

impl Default for GLOWConfig {
    fn default() -> Self {
        Self {
            factor_size: 2,
            num_steps: 4,
            num_levels: 3,
            window_length: 64,
            channel_size: 4,
            hidden_channels: 32,
            kernel_size: 4,
            dropout: 0.1,
        }
    }
}

/// Shapes of one scale level, derived once from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelShape {
    /// Sequence length after this level's squeeze
    pub length: usize,
    /// Channels after this level's squeeze
    pub channels: usize,
    /// Channels held out as the latent slice
    pub held_channels: usize,
    /// Per-sample size of the flattened latent slice
    pub latent_size: usize,
}

impl GLOWConfig {
    /// Create a configuration with default coupling network settings
    pub fn new(
        factor_size: usize,
        num_steps: usize,
        num_levels: usize,
        window_length: usize,
        channel_size: usize,
    ) -> Self {
        Self {
            factor_size,
            num_steps,
            num_levels,
            window_length,
            channel_size,
            ..Default::default()
        }
    }

    /// Check that every level can be squeezed and split.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("factor_size", self.factor_size),
            ("num_steps", self.num_steps),
            ("num_levels", self.num_levels),
            ("window_length", self.window_length),
            ("channel_size", self.channel_size),
            ("hidden_channels", self.hidden_channels),
            ("kernel_size", self.kernel_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(FlowError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FlowError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }

        let mut length = self.window_length;
        let mut channels = self.channel_size;
        for level in 0..self.num_levels {
            if length % self.factor_size != 0 {
                return Err(FlowError::InvalidConfig(format!(
                    "window length {} not divisible by {}^{}",
                    self.window_length,
                    self.factor_size,
                    self.num_levels
                )));
            }
            length /= self.factor_size;
            channels *= self.factor_size;
            if channels % 2 != 0 {
                return Err(FlowError::InvalidConfig(format!(
                    "level {} has odd channel count {}",
                    level, channels
                )));
            }
            channels /= 2;
        }
        Ok(())
    }

    /// Per-level shapes, finest level first.
    pub fn level_shapes(&self) -> Vec<LevelShape> {
        let mut shapes = Vec::with_capacity(self.num_levels);
        let mut length = self.window_length;
        let mut channels = self.channel_size;

        for level in 0..self.num_levels {
            length /= self.factor_size;
            channels *= self.factor_size;
            let held_channels = if level + 1 == self.num_levels {
                channels
            } else {
                channels / 2
            };
            shapes.push(LevelShape {
                length,
                channels,
                held_channels,
                latent_size: length * held_channels,
            });
            channels -= held_channels;
        }

        shapes
    }

    /// Per-sample latent size; always `window_length * channel_size`.
    pub fn latent_size(&self) -> usize {
        self.level_shapes().iter().map(|s| s.latent_size).sum()
    }
}

/// GLOW normalizing flow over `(batch, window_length, 1, channel_size)` windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ModelParts")]
pub struct GLOWModel {
    /// Model configuration
    pub config: GLOWConfig,
    shapes: Vec<LevelShape>,
    squeezes: Vec<Squeeze>,
    steps: Vec<Vec<FlowStep>>,
    priors: Vec<LatentPrior>,
    primed: bool,
}

/// Deserialized fields, checked against the configuration before use
#[derive(Deserialize)]
struct ModelParts {
    config: GLOWConfig,
    shapes: Vec<LevelShape>,
    squeezes: Vec<Squeeze>,
    steps: Vec<Vec<FlowStep>>,
    priors: Vec<LatentPrior>,
    primed: bool,
}

impl TryFrom<ModelParts> for GLOWModel {
    type Error = FlowError;

    fn try_from(parts: ModelParts) -> Result<Self> {
        let config = parts.config;
        config.validate()?;
        if parts.shapes != config.level_shapes() {
            return Err(FlowError::InvalidConfig(
                "level shapes disagree with the configuration".into(),
            ));
        }

        let levels = config.num_levels;
        if parts.squeezes.len() != levels
            || parts.steps.len() != levels
            || parts.priors.len() != levels
        {
            return Err(FlowError::InvalidConfig(format!(
                "expected {} levels, got {} squeezes, {} step lists and {} priors",
                levels,
                parts.squeezes.len(),
                parts.steps.len(),
                parts.priors.len()
            )));
        }

        let mut length = config.window_length;
        for (level, squeeze) in parts.squeezes.iter().enumerate() {
            if squeeze.factor != config.factor_size || squeeze.target_length != length {
                return Err(FlowError::InvalidConfig(format!(
                    "squeeze of level {} does not match the configuration",
                    level
                )));
            }
            length /= config.factor_size;
        }

        if let Some(level) = parts.steps.iter().position(|s| s.len() != config.num_steps) {
            return Err(FlowError::InvalidConfig(format!(
                "level {} does not have {} flow steps",
                level, config.num_steps
            )));
        }

        for (level, prior) in parts.priors.iter().enumerate() {
            let terminal = level + 1 == levels;
            if matches!(prior, LatentPrior::Learned(_)) != terminal {
                return Err(FlowError::InvalidConfig(format!(
                    "level {} has the wrong kind of prior",
                    level
                )));
            }
        }

        Ok(Self {
            config,
            shapes: parts.shapes,
            squeezes: parts.squeezes,
            steps: parts.steps,
            priors: parts.priors,
            primed: parts.primed,
        })
    }
}

impl GLOWModel {
    /// Create a new, unprimed GLOW model
    pub fn new(config: GLOWConfig) -> Result<Self> {
        config.validate()?;
        let shapes = config.level_shapes();

        let mut squeezes = Vec::with_capacity(config.num_levels);
        let mut steps = Vec::with_capacity(config.num_levels);
        let mut priors = Vec::with_capacity(config.num_levels);
        let mut length = config.window_length;

        for level in 0..config.num_levels {
            squeezes.push(Squeeze {
                factor: config.factor_size,
                target_length: length,
            });
            length /= config.factor_size;

            steps.push(
                (0..config.num_steps)
                    .map(|_| FlowStep::new(config.hidden_channels, config.kernel_size, config.dropout))
                    .collect(),
            );

            priors.push(if level + 1 == config.num_levels {
                LatentPrior::Learned(LearnedPrior::new())
            } else {
                LatentPrior::Conditional(ConditionalPrior::new())
            });
        }

        info!(
            levels = config.num_levels,
            steps = config.num_steps,
            latent_size = config.latent_size(),
            "GLOW model created"
        );

        Ok(Self {
            config,
            shapes,
            squeezes,
            steps,
            priors,
            primed: false,
        })
    }

    /// Per-level shapes, finest level first
    pub fn level_shapes(&self) -> &[LevelShape] {
        &self.shapes
    }

    /// Per-sample latent size
    pub fn latent_size(&self) -> usize {
        self.shapes.iter().map(|s| s.latent_size).sum()
    }

    /// Check if every layer has been built and initialized
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Flow steps of `level`
    pub fn steps(&self, level: usize) -> Option<&[FlowStep]> {
        self.steps.get(level).map(Vec::as_slice)
    }

    /// Mutable flow steps of `level`, for an external optimizer
    pub fn steps_mut(&mut self, level: usize) -> Option<&mut [FlowStep]> {
        self.steps.get_mut(level).map(Vec::as_mut_slice)
    }

    /// Prior of `level`
    pub fn prior(&self, level: usize) -> Option<&LatentPrior> {
        self.priors.get(level)
    }

    /// Mutable prior of `level`, for an external optimizer
    pub fn prior_mut(&mut self, level: usize) -> Option<&mut LatentPrior> {
        self.priors.get_mut(level)
    }

    /// Number of trainable values; zero before priming
    pub fn num_parameters(&self) -> usize {
        let steps: usize = self.steps.iter().flatten().map(FlowStep::num_parameters).sum();
        let priors: usize = self.priors.iter().map(LatentPrior::num_parameters).sum();
        steps + priors
    }

    /// Toggle dropout in every coupling network
    pub fn set_training(&mut self, training: bool) {
        for step in self.steps.iter_mut().flatten() {
            step.set_training(training);
        }
    }

    /// Map a window to its latent vector and log-likelihood in bits.
    ///
    /// The first call builds every layer and runs the ActNorm data
    /// initialization on `window`. Returns 0 for the likelihood when
    /// `compute_logdet` is false.
    pub fn forward(
        &mut self,
        window: &FeatureMap,
        compute_logdet: bool,
    ) -> Result<(Array2<f64>, f64)> {
        if !self.primed {
            self.prime(window)?;
        }
        self.encode(window, compute_logdet)
    }

    /// Build and initialize every layer from `window`.
    ///
    /// Runs once; must complete before the model is shared between threads.
    pub fn prime(&mut self, window: &FeatureMap) -> Result<()> {
        self.check_window(window)?;
        let last_level = self.config.num_levels - 1;
        let mut x = window.clone();

        for level in 0..self.config.num_levels {
            x = self.squeezes[level].prime(&x)?;

            let (last, body) = self.steps[level]
                .split_last_mut()
                .ok_or_else(|| FlowError::InvalidConfig("level without flow steps".into()))?;
            for step in body {
                x = ops::swap_halves(&step.prime(&x)?)?;
            }
            let y = last.prime(&x)?;

            if level == last_level {
                self.priors[level].prime(&y, None)?;
            } else {
                let (held, retained) = ops::split_half(&y)?;
                self.priors[level].prime(&held, Some(&retained))?;
                x = retained;
            }
        }

        self.primed = true;
        info!(parameters = self.num_parameters(), "GLOW model primed");
        Ok(())
    }

    /// Read-only forward pass; requires a primed model.
    ///
    /// Safe to call concurrently from several threads.
    pub fn encode(&self, window: &FeatureMap, compute_logdet: bool) -> Result<(Array2<f64>, f64)> {
        self.check_primed()?;
        self.check_window(window)?;
        let last_level = self.config.num_levels - 1;

        let mut x = window.clone();
        let mut total_log_det = 0.0;
        let mut slices = Vec::with_capacity(self.config.num_levels);

        for level in 0..self.config.num_levels {
            x = self.squeezes[level].forward(&x, false)?.0;

            let (last, body) = self.split_steps(level)?;
            for step in body {
                let (y, log_det) = step.forward(&x, compute_logdet)?;
                total_log_det += log_det;
                x = ops::swap_halves(&y)?;
            }
            let (y, log_det) = last.forward(&x, compute_logdet)?;
            total_log_det += log_det;

            let (z, log_p) = if level == last_level {
                self.priors[level].forward(&y, None, compute_logdet)?
            } else {
                let (held, retained) = ops::split_half(&y)?;
                let scored = self.priors[level].forward(&held, Some(&retained), compute_logdet)?;
                x = retained;
                scored
            };
            total_log_det += log_p;
            trace!(level, log_p, "level encoded");

            slices.push(ops::flatten(&z)?);
        }

        let views: Vec<_> = slices.iter().map(|slice| slice.view()).collect();
        let latent = concatenate(Axis(1), &views)?;

        let bits = if compute_logdet {
            total_log_det / LN_2
        } else {
            0.0
        };
        Ok((latent, bits))
    }

    /// Map latent vectors back to windows, scaling prior spread by `temperature`.
    pub fn inverse(&self, latent: &Array2<f64>, temperature: f64) -> Result<FeatureMap> {
        self.check_primed()?;
        let expected = self.latent_size();
        if latent.ncols() != expected {
            return Err(FlowError::LatentSize {
                expected,
                got: latent.ncols(),
            });
        }

        let batch = latent.nrows();
        let last_level = self.config.num_levels - 1;
        let mut end = expected;
        let mut carried: Option<FeatureMap> = None;

        for level in (0..self.config.num_levels).rev() {
            let shape = self.shapes[level];
            let start = end - shape.latent_size;
            let slice: Vec<f64> = latent.slice(s![.., start..end]).iter().copied().collect();
            end = start;
            let z = Array4::from_shape_vec((batch, shape.length, 1, shape.held_channels), slice)?;

            let mut x = if level == last_level {
                self.priors[level].reverse(&z, None, temperature)?
            } else {
                let retained = carried
                    .take()
                    .ok_or_else(|| FlowError::InvalidShape("missing coarser level output".into()))?;
                let held = self.priors[level].reverse(&z, Some(&retained), temperature)?;
                ops::concat_channels(&held, &retained)?
            };

            let (last, body) = self.split_steps(level)?;
            x = last.reverse(&x)?;
            for step in body.iter().rev() {
                x = step.reverse(&ops::swap_halves(&x)?)?;
            }

            carried = Some(self.squeezes[level].reverse(&x)?);
            trace!(level, "level decoded");
        }

        carried.ok_or_else(|| FlowError::InvalidConfig("network has no levels".into()))
    }

    /// Draw `num_samples` windows from the model.
    pub fn sample(&self, num_samples: usize, temperature: f64) -> Result<FeatureMap> {
        let z = Array2::random((num_samples, self.latent_size()), StandardNormal);
        self.inverse(&z, temperature)
    }

    /// Negative log-likelihood of `window` in bits per dimension.
    pub fn nll_bits_per_dim(&self, window: &FeatureMap) -> Result<f64> {
        let (_, bits) = self.encode(window, true)?;
        let dims = (self.config.window_length * self.config.channel_size) as f64;
        Ok(-bits / dims)
    }

    fn split_steps(&self, level: usize) -> Result<(&FlowStep, &[FlowStep])> {
        self.steps[level]
            .split_last()
            .ok_or_else(|| FlowError::InvalidConfig("level without flow steps".into()))
    }

    fn check_primed(&self) -> Result<()> {
        if self.primed {
            Ok(())
        } else {
            Err(FlowError::Uninitialized("GLOWModel"))
        }
    }

    fn check_window(&self, window: &FeatureMap) -> Result<()> {
        let (_, length, width, channels) = window.dim();
        let expected = (self.config.window_length, 1, self.config.channel_size);
        if (length, width, channels) != expected {
            return Err(FlowError::InvalidShape(format!(
                "window must be (batch, {}, 1, {}), got {:?}",
                self.config.window_length,
                self.config.channel_size,
                window.dim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand_distr::Normal;

    use crate::model::layers::Lu;

    fn create_window(config: &GLOWConfig, batch: usize) -> FeatureMap {
        Array4::random(
            (batch, config.window_length, 1, config.channel_size),
            Normal::new(0.5, 2.0).unwrap(),
        )
    }

    fn scenario_config() -> GLOWConfig {
        GLOWConfig {
            hidden_channels: 16,
            ..GLOWConfig::new(2, 2, 2, 16, 4)
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(GLOWConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_indivisible_window() {
        let config = GLOWConfig::new(2, 2, 3, 12, 4);
        assert!(matches!(config.validate(), Err(FlowError::InvalidConfig(_))));
        assert!(GLOWModel::new(config).is_err());
    }

    #[test]
    fn test_config_rejects_odd_level_channels() {
        // factor 3 on 2 channels: level 0 has 6 channels, level 1 has 9
        let config = GLOWConfig::new(3, 1, 2, 9, 2);
        assert!(matches!(config.validate(), Err(FlowError::InvalidConfig(_))));
        assert!(GLOWConfig::new(3, 1, 1, 9, 2).validate().is_ok());
    }

    #[test]
    fn test_channel_conservation() {
        for config in [
            scenario_config(),
            GLOWConfig::new(2, 1, 4, 32, 2),
            GLOWConfig::new(4, 1, 2, 32, 3),
        ] {
            config.validate().unwrap();
            let shapes = config.level_shapes();
            let mut incoming = config.channel_size * config.factor_size;
            for (level, shape) in shapes.iter().enumerate() {
                assert_eq!(shape.channels, incoming);
                let retained = shape.channels - shape.held_channels;
                if level + 1 == shapes.len() {
                    assert_eq!(retained, 0);
                } else {
                    assert_eq!(retained, shape.held_channels);
                }
                incoming = retained * config.factor_size;
            }
            assert_eq!(config.latent_size(), config.window_length * config.channel_size);
        }
    }

    #[test]
    fn test_scenario_shapes() {
        let shapes = scenario_config().level_shapes();
        assert_eq!(
            shapes,
            vec![
                LevelShape { length: 8, channels: 8, held_channels: 4, latent_size: 32 },
                LevelShape { length: 4, channels: 8, held_channels: 8, latent_size: 32 },
            ]
        );
    }

    #[test]
    fn test_end_to_end_scenario() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        let window = create_window(&config, 2);

        let (latent, bits) = model.forward(&window, true).unwrap();
        assert_eq!(latent.dim(), (2, 64));
        assert!(bits.is_finite());

        let reconstructed = model.inverse(&latent, 1.0).unwrap();
        assert_eq!(reconstructed.dim(), window.dim());
        for (a, b) in window.iter().zip(reconstructed.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_forward_of_inverse_recovers_latent() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 4), false).unwrap();

        let z = Array2::random((3, model.latent_size()), Normal::new(0.0, 0.5).unwrap());
        let window = model.inverse(&z, 1.0).unwrap();
        let (z_recovered, _) = model.encode(&window, false).unwrap();
        for (a, b) in z.iter().zip(z_recovered.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_single_level_single_step() {
        let config = GLOWConfig {
            hidden_channels: 8,
            ..GLOWConfig::new(4, 1, 1, 8, 2)
        };
        let mut model = GLOWModel::new(config.clone()).unwrap();
        let window = create_window(&config, 3);

        let (latent, _) = model.forward(&window, true).unwrap();
        assert_eq!(latent.ncols(), 16);
        let reconstructed = model.inverse(&latent, 1.0).unwrap();
        for (a, b) in window.iter().zip(reconstructed.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_logdet_disabled_returns_zero() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        let (_, bits) = model.forward(&create_window(&config, 2), false).unwrap();
        assert_eq!(bits, 0.0);
    }

    #[test]
    fn test_priming_happens_once() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        assert_eq!(model.num_parameters(), 0);

        let first = create_window(&config, 2);
        model.forward(&first, true).unwrap();
        assert!(model.is_primed());
        let (latent, _) = model.encode(&first, false).unwrap();

        // A second batch with other statistics must not re-initialize ActNorm
        model.forward(&(create_window(&config, 2) * 5.0), true).unwrap();
        let (latent_again, _) = model.encode(&first, false).unwrap();
        assert_eq!(latent, latent_again);
    }

    #[test]
    fn test_encode_and_inverse_require_priming() {
        let config = scenario_config();
        let model = GLOWModel::new(config.clone()).unwrap();
        assert!(matches!(
            model.encode(&create_window(&config, 1), true),
            Err(FlowError::Uninitialized(_))
        ));
        assert!(matches!(
            model.inverse(&Array2::zeros((1, 64)), 1.0),
            Err(FlowError::Uninitialized(_))
        ));
    }

    #[test]
    fn test_inverse_rejects_wrong_latent_size() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 2), false).unwrap();

        let err = model.inverse(&Array2::zeros((2, 63)), 1.0).unwrap_err();
        assert!(matches!(err, FlowError::LatentSize { expected: 64, got: 63 }));
    }

    #[test]
    fn test_forward_rejects_wrong_window() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config).unwrap();
        let err = model.forward(&Array4::zeros((2, 12, 1, 4)), true).unwrap_err();
        assert!(matches!(err, FlowError::InvalidShape(_)));
        assert!(!model.is_primed());
    }

    #[test]
    fn test_temperature_scales_deviation_from_prior_mean() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 2), false).unwrap();

        let z = Array2::random((1, model.latent_size()), Normal::new(0.0, 1.0).unwrap());
        let zeros = Array2::zeros(z.raw_dim());
        let mean_window = model.inverse(&zeros, 1.0).unwrap();

        let spread = |t: f64| {
            let window = model.inverse(&z, t).unwrap();
            (&window - &mean_window).mapv(|v| v * v).sum().sqrt()
        };
        let cold = spread(0.25);
        let hot = spread(1.5);
        assert!(cold > 0.0);
        assert!(hot > cold);
    }

    #[test]
    fn test_sample_shape() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 2), false).unwrap();

        let samples = model.sample(5, 0.7).unwrap();
        assert_eq!(samples.dim(), (5, 16, 1, 4));
        assert!(samples.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_nll_bits_per_dim_is_negated_normalized_bits() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        let window = create_window(&config, 2);
        let (_, bits) = model.forward(&window, true).unwrap();

        let nll = model.nll_bits_per_dim(&window).unwrap();
        assert_relative_eq!(nll, -bits / 64.0, epsilon = 1e-9);
    }

    #[test]
    fn test_concurrent_encode_after_priming() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 2), true).unwrap();

        let windows: Vec<_> = (0..4).map(|_| create_window(&config, 2)).collect();
        let expected: Vec<_> = windows
            .iter()
            .map(|w| model.encode(w, true).unwrap())
            .collect();

        let model = &model;
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = windows
                .iter()
                .map(|w| scope.spawn(move || model.encode(w, true).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, expected);
    }

    #[test]
    fn test_bits_match_change_of_variables() {
        let config = GLOWConfig {
            hidden_channels: 8,
            dropout: 0.0,
            ..GLOWConfig::new(2, 2, 2, 8, 2)
        };
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 4), false).unwrap();

        let window = create_window(&config, 1);
        let (latent, bits) = model.encode(&window, true).unwrap();

        // Central-difference Jacobian of the latent w.r.t. the window
        let n = model.latent_size();
        let step = 1e-6;
        let mut jacobian = Array2::zeros((n, n));
        for i in 0..n {
            let mut plus = window.clone();
            let mut minus = window.clone();
            plus.as_slice_mut().unwrap()[i] += step;
            minus.as_slice_mut().unwrap()[i] -= step;
            let (z_plus, _) = model.encode(&plus, false).unwrap();
            let (z_minus, _) = model.encode(&minus, false).unwrap();
            jacobian
                .column_mut(i)
                .assign(&((&z_plus.row(0) - &z_minus.row(0)) / (2.0 * step)));
        }

        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let log_density: f64 = latent.iter().map(|z| -0.5 * (ln_2pi + z * z)).sum();
        let log_det = Lu::factorize(&jacobian).unwrap().determinant().abs().ln();
        let expected = (log_density + log_det) / LN_2;

        assert_relative_eq!(bits, expected, max_relative = 1e-3);
    }

    #[test]
    fn test_model_serde_rejects_inconsistent_levels() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        model.forward(&create_window(&config, 2), false).unwrap();

        let mut value = serde_json::to_value(&model).unwrap();
        value["priors"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<GLOWModel>(value).is_err());

        let mut value = serde_json::to_value(&model).unwrap();
        value["steps"][1].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<GLOWModel>(value).is_err());

        let mut value = serde_json::to_value(&model).unwrap();
        value["config"]["num_levels"] = serde_json::json!(3);
        value["config"]["window_length"] = serde_json::json!(32);
        assert!(serde_json::from_value::<GLOWModel>(value).is_err());
    }

    #[test]
    fn test_model_serde_preserves_mapping() {
        let config = scenario_config();
        let mut model = GLOWModel::new(config.clone()).unwrap();
        let window = create_window(&config, 2);
        let (latent, bits) = model.forward(&window, true).unwrap();

        let json = serde_json::to_string(&model).unwrap();
        let restored: GLOWModel = serde_json::from_str(&json).unwrap();
        assert!(restored.is_primed());

        let (latent_restored, bits_restored) = restored.encode(&window, true).unwrap();
        for (a, b) in latent.iter().zip(latent_restored.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_relative_eq!(bits, bits_restored, epsilon = 1e-6);
    }
}
