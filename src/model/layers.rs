//! GLOW layer implementations
//!
//! Provides the building blocks of one flow step:
//! - ActNorm: per-channel affine normalization with data-dependent init
//! - InvertibleConv1x1: learned channel mixing
//! - Squeeze: trades sequence length for channel depth
//! - FlowStep: ActNorm -> 1x1 Conv -> Affine Coupling

use ndarray::{s, Array1, Array2, Axis, Zip};
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::coupling::{normal, AffineCoupling};
use super::ops::{self, FeatureMap};
use crate::error::{FlowError, Result};

/// Floor added to the std before inverting it in ActNorm initialization
const ACTNORM_EPS: f64 = 1e-6;
/// Floor added to |det W| before taking the log
const LOGDET_EPS: f64 = 1e-8;
/// Diagonal offset applied to a singular mixing matrix
const SINGULAR_OFFSET: f64 = 1e-6;
/// Pivots below this count as zero
const PIVOT_EPS: f64 = 1e-12;

/// Common interface of every invertible layer.
///
/// `prime` is the only mutating entry point: it allocates parameters from the
/// first observed input and runs any data-dependent initialization, then
/// returns the forward output. `forward` and `reverse` are pure functions of
/// the input and the current parameters.
pub trait Bijector {
    /// Build and initialize from `x`, returning the forward output.
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        Ok(self.forward(x, false)?.0)
    }

    /// Map `x` forward, returning the log-determinant when `logdet` is set (0 otherwise).
    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)>;

    /// Exact inverse of `forward`.
    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap>;
}

/// Lifecycle of an ActNorm layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActNormState {
    /// Channel count not yet observed
    Unbuilt,
    /// Parameters allocated (scale 1, shift 0) but data init has not run
    Uninitialized { scale: Array1<f64>, shift: Array1<f64> },
    /// Parameters set from data or assigned externally
    Initialized { scale: Array1<f64>, shift: Array1<f64> },
}

/// Activation Normalization layer
///
/// Computes `y = s * x + b` per channel. On the first priming call `s` and `b`
/// are set from the batch statistics so that the output is zero-mean and
/// unit-variance; afterwards they are ordinary parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActNorm {
    state: ActNormState,
}

impl Default for ActNorm {
    fn default() -> Self {
        Self::new()
    }
}

impl ActNorm {
    /// Create an unbuilt ActNorm layer
    pub fn new() -> Self {
        Self {
            state: ActNormState::Unbuilt,
        }
    }

    /// Allocate identity parameters for `channels` channels.
    pub fn build(&mut self, channels: usize) -> Result<()> {
        match &self.state {
            ActNormState::Unbuilt => {
                self.state = ActNormState::Uninitialized {
                    scale: Array1::ones(channels),
                    shift: Array1::zeros(channels),
                };
                Ok(())
            }
            _ => self.check_channels(channels),
        }
    }

    /// Run the data-dependent initialization if it has not run yet.
    ///
    /// Returns whether the statistics were computed by this call.
    pub fn initialize(&mut self, x: &FeatureMap) -> Result<bool> {
        let channels = x.dim().3;
        self.build(channels)?;
        if self.is_initialized() {
            return Ok(false);
        }

        let rows = ops::to_rows(x)?;
        let mean = rows
            .mean_axis(Axis(0))
            .ok_or_else(|| FlowError::InvalidShape("ActNorm initialized on empty batch".into()))?;
        let std = rows.std_axis(Axis(0), 0.0);

        let scale = std.mapv(|s| 1.0 / (s + ACTNORM_EPS));
        let shift = -&mean * &scale;
        debug!(channels, "ActNorm initialized from batch statistics");

        self.state = ActNormState::Initialized { scale, shift };
        Ok(true)
    }

    /// Overwrite the parameters, marking the layer initialized.
    pub fn assign(&mut self, scale: Array1<f64>, shift: Array1<f64>) -> Result<()> {
        if scale.len() != shift.len() {
            return Err(FlowError::InvalidShape(format!(
                "ActNorm scale has {} entries, shift has {}",
                scale.len(),
                shift.len()
            )));
        }
        if let Some(channels) = self.num_features() {
            if channels != scale.len() {
                return Err(FlowError::ChannelMismatch {
                    expected: channels,
                    got: scale.len(),
                });
            }
        }
        self.state = ActNormState::Initialized { scale, shift };
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> &ActNormState {
        &self.state
    }

    /// Check if the data-dependent initialization has happened
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ActNormState::Initialized { .. })
    }

    /// Channel count, once built
    pub fn num_features(&self) -> Option<usize> {
        match &self.state {
            ActNormState::Unbuilt => None,
            ActNormState::Uninitialized { scale, .. } | ActNormState::Initialized { scale, .. } => {
                Some(scale.len())
            }
        }
    }

    /// `(scale, shift)` once initialized
    pub fn parameters(&self) -> Option<(&Array1<f64>, &Array1<f64>)> {
        match &self.state {
            ActNormState::Initialized { scale, shift } => Some((scale, shift)),
            _ => None,
        }
    }

    fn check_channels(&self, got: usize) -> Result<()> {
        match self.num_features() {
            Some(expected) if expected != got => Err(FlowError::ChannelMismatch { expected, got }),
            _ => Ok(()),
        }
    }

    fn initialized_parameters(&self, x: &FeatureMap) -> Result<(&Array1<f64>, &Array1<f64>)> {
        self.check_channels(x.dim().3)?;
        self.parameters().ok_or(FlowError::Uninitialized("ActNorm"))
    }
}

impl Bijector for ActNorm {
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        self.initialize(x)?;
        Ok(self.forward(x, false)?.0)
    }

    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let (scale, shift) = self.initialized_parameters(x)?;
        let y = x * scale + shift;

        if logdet {
            let (_, length, width, _) = x.dim();
            let log_det = (length * width) as f64 * scale.mapv(|s| s.abs().ln()).sum();
            Ok((y, log_det))
        } else {
            Ok((y, 0.0))
        }
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        let (scale, shift) = self.initialized_parameters(y)?;
        Ok((y - shift) / scale)
    }
}

/// Invertible 1x1 Convolution
///
/// Replaces a fixed channel permutation with a learned square matrix `W`
/// applied independently at every position: `y = x @ W`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertibleConv1x1 {
    weight: Option<Array2<f64>>,
}

impl InvertibleConv1x1 {
    /// Create an unbuilt layer
    pub fn new() -> Self {
        Self { weight: None }
    }

    /// Create a layer with a given weight matrix
    pub fn with_weight(weight: Array2<f64>) -> Result<Self> {
        if weight.nrows() != weight.ncols() {
            return Err(FlowError::InvalidShape(format!(
                "mixing matrix must be square, got {:?}",
                weight.dim()
            )));
        }
        Ok(Self {
            weight: Some(weight),
        })
    }

    /// Allocate a random orthogonal `W` for `channels` channels.
    pub fn build(&mut self, channels: usize) -> Result<()> {
        match &self.weight {
            None => {
                self.weight = Some(random_orthogonal(channels)?);
                debug!(channels, "InvertibleConv1x1 built");
                Ok(())
            }
            Some(w) if w.nrows() != channels => Err(FlowError::ChannelMismatch {
                expected: w.nrows(),
                got: channels,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Learned weight matrix, once built
    pub fn weight(&self) -> Option<&Array2<f64>> {
        self.weight.as_ref()
    }

    /// Mutable weight access for an external optimizer
    pub fn weight_mut(&mut self) -> Option<&mut Array2<f64>> {
        self.weight.as_mut()
    }

    /// Weight actually used for mixing, factorized.
    ///
    /// A singular `W` is replaced by `W + δI` for both the mixing and the
    /// determinant, in both directions.
    fn effective_weight(&self, channels: usize) -> Result<(Array2<f64>, Lu)> {
        let weight = self
            .weight
            .as_ref()
            .ok_or(FlowError::Uninitialized("InvertibleConv1x1"))?;
        if weight.nrows() != channels {
            return Err(FlowError::ChannelMismatch {
                expected: weight.nrows(),
                got: channels,
            });
        }

        if let Some(lu) = Lu::factorize(weight) {
            return Ok((weight.clone(), lu));
        }

        warn!(channels, "singular mixing matrix, applying diagonal offset");
        let perturbed = weight + &(Array2::<f64>::eye(channels) * SINGULAR_OFFSET);
        let lu = Lu::factorize(&perturbed).ok_or(FlowError::SingularMatrix)?;
        Ok((perturbed, lu))
    }
}

impl Bijector for InvertibleConv1x1 {
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        self.build(x.dim().3)?;
        Ok(self.forward(x, false)?.0)
    }

    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let (batch, length, width, channels) = x.dim();
        let (weight, lu) = self.effective_weight(channels)?;

        let y = ops::to_rows(x)?.dot(&weight);
        let y = ops::from_rows(&y, batch, length, width)?;

        if logdet {
            let log_det = (length * width) as f64 * (lu.determinant().abs() + LOGDET_EPS).ln();
            Ok((y, log_det))
        } else {
            Ok((y, 0.0))
        }
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        let (batch, length, width, channels) = y.dim();
        let (_, lu) = self.effective_weight(channels)?;

        let x = ops::to_rows(y)?.dot(&lu.inverse());
        ops::from_rows(&x, batch, length, width)
    }
}

/// Random orthogonal matrix: Gaussian rows orthonormalized one at a time
fn random_orthogonal(n: usize) -> Result<Array2<f64>> {
    let mut q = Array2::random((n, n), normal(0.0, 1.0)?);

    for i in 0..n {
        let (done, mut rest) = q.view_mut().split_at(Axis(0), i);
        let mut row = rest.row_mut(0);
        for basis in done.rows() {
            let projection = basis.dot(&row);
            row.scaled_add(-projection, &basis);
        }
        let norm = row.dot(&row).sqrt();
        if norm < PIVOT_EPS {
            return Err(FlowError::SingularMatrix);
        }
        row /= norm;
    }

    Ok(q)
}

/// LU factorization with partial pivoting, `P W = L U`.
///
/// `L` (unit diagonal, below) and `U` (on and above the diagonal) share one
/// matrix. Factorizing once gives both the determinant and the inverse.
#[derive(Debug, Clone)]
pub(crate) struct Lu {
    factors: Array2<f64>,
    /// Row of `W` that ended up at each position
    permutation: Vec<usize>,
    sign: f64,
}

impl Lu {
    /// Factorize a square matrix; `None` when a pivot falls below 1e-12.
    pub(crate) fn factorize(matrix: &Array2<f64>) -> Option<Self> {
        let n = matrix.nrows();
        let mut factors = matrix.clone();
        let mut permutation: Vec<usize> = (0..n).collect();
        let mut sign = 1.0;

        for k in 0..n {
            let pivot = (k..n).max_by(|&a, &b| {
                factors[[a, k]].abs().total_cmp(&factors[[b, k]].abs())
            })?;
            if factors[[pivot, k]].abs() < PIVOT_EPS {
                return None;
            }
            if pivot != k {
                let (mut top, mut bottom) = factors.view_mut().split_at(Axis(0), pivot);
                Zip::from(top.row_mut(k))
                    .and(bottom.row_mut(0))
                    .for_each(std::mem::swap);
                permutation.swap(k, pivot);
                sign = -sign;
            }

            let head = factors.row(k).slice(s![k + 1..]).to_owned();
            let diagonal = factors[[k, k]];
            for i in (k + 1)..n {
                let multiplier = factors[[i, k]] / diagonal;
                factors[[i, k]] = multiplier;
                factors
                    .slice_mut(s![i, k + 1..])
                    .scaled_add(-multiplier, &head);
            }
        }

        Some(Self {
            factors,
            permutation,
            sign,
        })
    }

    pub(crate) fn determinant(&self) -> f64 {
        self.sign * self.factors.diag().product()
    }

    /// `W^-1`, solved against every identity column at once.
    pub(crate) fn inverse(&self) -> Array2<f64> {
        let n = self.factors.nrows();
        let mut x = Array2::from_shape_fn((n, n), |(i, j)| {
            if self.permutation[i] == j {
                1.0
            } else {
                0.0
            }
        });

        // L y = P
        for i in 1..n {
            let (solved, mut rest) = x.view_mut().split_at(Axis(0), i);
            let mut row = rest.row_mut(0);
            for (k, solved_row) in solved.rows().into_iter().enumerate() {
                row.scaled_add(-self.factors[[i, k]], &solved_row);
            }
        }

        // U x = y
        for i in (0..n).rev() {
            let (mut head, solved) = x.view_mut().split_at(Axis(0), i + 1);
            let mut row = head.row_mut(i);
            for (offset, solved_row) in solved.rows().into_iter().enumerate() {
                row.scaled_add(-self.factors[[i, i + 1 + offset]], &solved_row);
            }
            row /= self.factors[[i, i]];
        }

        x
    }
}

/// Squeeze layer bound to the sequence length it restores on reverse
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Squeeze {
    /// Number of consecutive positions folded into channels
    pub factor: usize,
    /// Sequence length before squeezing
    pub target_length: usize,
}

impl Bijector for Squeeze {
    fn forward(&self, x: &FeatureMap, _logdet: bool) -> Result<(FeatureMap, f64)> {
        if x.dim().1 != self.target_length {
            return Err(FlowError::InvalidShape(format!(
                "squeeze expects length {}, got {}",
                self.target_length,
                x.dim().1
            )));
        }
        Ok((ops::squeeze(x, self.factor)?, 0.0))
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        ops::unsqueeze(y, self.factor, self.target_length)
    }
}

/// The closed set of layers a flow step is assembled from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowLayer {
    ActNorm(ActNorm),
    Mix(InvertibleConv1x1),
    Coupling(AffineCoupling),
}

impl Bijector for FlowLayer {
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        match self {
            FlowLayer::ActNorm(layer) => layer.prime(x),
            FlowLayer::Mix(layer) => layer.prime(x),
            FlowLayer::Coupling(layer) => layer.prime(x),
        }
    }

    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        match self {
            FlowLayer::ActNorm(layer) => layer.forward(x, logdet),
            FlowLayer::Mix(layer) => layer.forward(x, logdet),
            FlowLayer::Coupling(layer) => layer.forward(x, logdet),
        }
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        match self {
            FlowLayer::ActNorm(layer) => layer.reverse(y),
            FlowLayer::Mix(layer) => layer.reverse(y),
            FlowLayer::Coupling(layer) => layer.reverse(y),
        }
    }
}

/// Complete Flow Step: ActNorm -> 1x1 Conv -> Affine Coupling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    layers: Vec<FlowLayer>,
}

impl FlowStep {
    /// Create a new flow step whose coupling network has `hidden_channels` features
    pub fn new(hidden_channels: usize, kernel_size: usize, dropout: f64) -> Self {
        Self {
            layers: vec![
                FlowLayer::ActNorm(ActNorm::new()),
                FlowLayer::Mix(InvertibleConv1x1::new()),
                FlowLayer::Coupling(AffineCoupling::new(hidden_channels, kernel_size, dropout)),
            ],
        }
    }

    /// Layers in forward order
    pub fn layers(&self) -> &[FlowLayer] {
        &self.layers
    }

    /// Mutable layer access for an external optimizer
    pub fn layers_mut(&mut self) -> &mut [FlowLayer] {
        &mut self.layers
    }

    /// Number of trainable values across the three layers
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| match layer {
                FlowLayer::ActNorm(norm) => norm.num_features().map_or(0, |c| 2 * c),
                FlowLayer::Mix(mix) => mix.weight().map_or(0, |w| w.len()),
                FlowLayer::Coupling(coupling) => {
                    coupling.net().map_or(0, |net| net.num_parameters())
                }
            })
            .sum()
    }

    /// Toggle dropout in the coupling network
    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            if let FlowLayer::Coupling(coupling) = layer {
                coupling.set_training(training);
            }
        }
    }
}

impl Bijector for FlowStep {
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        let mut h = x.clone();
        for layer in &mut self.layers {
            h = layer.prime(&h)?;
        }
        Ok(h)
    }

    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let mut h = x.clone();
        let mut total_log_det = 0.0;

        for layer in &self.layers {
            let (out, log_det) = layer.forward(&h, logdet)?;
            h = out;
            total_log_det += log_det;
        }

        Ok((h, total_log_det))
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        let mut h = y.clone();
        for layer in self.layers.iter().rev() {
            h = layer.reverse(&h)?;
        }
        Ok(h)
    }
}
