//! Affine Coupling Layer
//!
//! Splits the channels into two halves and transforms the first half with a
//! scale and shift predicted from the second half, which passes through
//! unchanged. Invertible by construction.

use ndarray::{s, Array1, Array3, Array4, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::layers::{ActNorm, Bijector};
use super::ops::{self, FeatureMap};
use crate::error::{FlowError, Result};

/// Bias the scale head starts from, so `s` begins near sigmoid(2)
const SCALE_BIAS_INIT: f64 = 2.0;
/// Std of the near-zero initializers
const NEAR_ZERO_STD: f64 = 1e-3;

/// Normal distribution with validated parameters
pub(crate) fn normal(mean: f64, std: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std).map_err(|e| FlowError::InvalidConfig(e.to_string()))
}

/// Convolution along the sequence axis with a `(kernel_size, 1)` kernel.
///
/// Uses "same" padding: `(k - 1) / 2` positions before, the rest after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqConv {
    /// Weights: shape [kernel_size, in_channels, out_channels]
    pub kernel: Array3<f64>,
    /// Bias terms: shape [out_channels]
    pub bias: Array1<f64>,
}

impl SeqConv {
    /// He-initialized convolution with zero bias
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Result<Self> {
        let std = (2.0 / (in_channels * kernel_size) as f64).sqrt();
        Self::with_init(in_channels, out_channels, kernel_size, normal(0.0, std)?, 0.0)
    }

    /// Convolution whose kernel is near zero and whose bias is `bias`
    pub fn near_zero(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: f64,
    ) -> Result<Self> {
        Self::with_init(
            in_channels,
            out_channels,
            kernel_size,
            normal(0.0, NEAR_ZERO_STD)?,
            bias,
        )
    }

    fn with_init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        init: Normal<f64>,
        bias: f64,
    ) -> Result<Self> {
        if kernel_size == 0 || in_channels == 0 || out_channels == 0 {
            return Err(FlowError::InvalidConfig(format!(
                "convolution {} -> {} with kernel {} is empty",
                in_channels, out_channels, kernel_size
            )));
        }
        Ok(Self {
            kernel: Array3::random((kernel_size, in_channels, out_channels), init),
            bias: Array1::from_elem(out_channels, bias),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dim().2
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.dim().0
    }

    /// Number of trainable values
    pub fn num_parameters(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    pub fn forward(&self, x: &FeatureMap) -> Result<FeatureMap> {
        let (batch, length, width, channels) = x.dim();
        if channels != self.in_channels() {
            return Err(FlowError::ChannelMismatch {
                expected: self.in_channels(),
                got: channels,
            });
        }

        let pad_before = (self.kernel_size() - 1) / 2;
        let mut output = Array4::zeros((batch, length, width, self.out_channels()));

        for b in 0..batch {
            for w in 0..width {
                for h in 0..length {
                    let mut acc = self.bias.clone();
                    for (tap, weight) in self.kernel.axis_iter(Axis(0)).enumerate() {
                        let pos = (h + tap) as isize - pad_before as isize;
                        if pos < 0 || pos >= length as isize {
                            continue;
                        }
                        let row = x.slice(s![b, pos as usize, w, ..]);
                        acc += &row.dot(&weight);
                    }
                    output.slice_mut(s![b, h, w, ..]).assign(&acc);
                }
            }
        }

        Ok(output)
    }
}

/// Sub-network predicting `(s, t)` from the untouched half
///
/// conv(k) -> ReLU -> ActNorm -> Dropout -> conv(1) -> ReLU -> ActNorm -> Dropout,
/// then two conv(k) heads squashed by a sigmoid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingNet {
    pub(crate) conv_in: SeqConv,
    pub(crate) norm_in: ActNorm,
    pub(crate) conv_hidden: SeqConv,
    pub(crate) norm_hidden: ActNorm,
    pub(crate) scale_head: SeqConv,
    pub(crate) shift_head: SeqConv,
    dropout: f64,
}

impl CouplingNet {
    pub fn new(
        half_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dropout: f64,
    ) -> Result<Self> {
        Ok(Self {
            conv_in: SeqConv::new(half_channels, hidden_channels, kernel_size)?,
            norm_in: ActNorm::new(),
            conv_hidden: SeqConv::new(hidden_channels, hidden_channels, 1)?,
            norm_hidden: ActNorm::new(),
            scale_head: SeqConv::near_zero(
                hidden_channels,
                half_channels,
                kernel_size,
                SCALE_BIAS_INIT,
            )?,
            shift_head: SeqConv::near_zero(hidden_channels, half_channels, kernel_size, 0.0)?,
            dropout,
        })
    }

    /// Channels of the conditioning half
    pub fn half_channels(&self) -> usize {
        self.conv_in.in_channels()
    }

    pub fn num_parameters(&self) -> usize {
        let norm = |n: &ActNorm| n.num_features().map_or(0, |c| 2 * c);
        self.conv_in.num_parameters()
            + self.conv_hidden.num_parameters()
            + self.scale_head.num_parameters()
            + self.shift_head.num_parameters()
            + norm(&self.norm_in)
            + norm(&self.norm_hidden)
    }

    /// Initialize the internal ActNorms from `x` and return `(s, t)`.
    fn prime(&mut self, x: &FeatureMap, training: bool) -> Result<(FeatureMap, FeatureMap)> {
        let h = relu(self.conv_in.forward(x)?);
        let h = self.norm_in.prime(&h)?;
        let h = relu(self.conv_hidden.forward(&self.dropout(h, training))?);
        let h = self.norm_hidden.prime(&h)?;
        self.heads(&self.dropout(h, training))
    }

    fn scale_shift(&self, x: &FeatureMap, training: bool) -> Result<(FeatureMap, FeatureMap)> {
        let h = relu(self.conv_in.forward(x)?);
        let h = self.dropout(self.norm_in.forward(&h, false)?.0, training);
        let h = relu(self.conv_hidden.forward(&h)?);
        let h = self.dropout(self.norm_hidden.forward(&h, false)?.0, training);
        self.heads(&h)
    }

    fn heads(&self, h: &FeatureMap) -> Result<(FeatureMap, FeatureMap)> {
        let scale = self.scale_head.forward(h)?.mapv(ops::sigmoid);
        let shift = self.shift_head.forward(h)?.mapv(ops::sigmoid);
        Ok((scale, shift))
    }

    fn dropout(&self, mut h: FeatureMap, training: bool) -> FeatureMap {
        if !training || self.dropout <= 0.0 {
            return h;
        }
        let keep = 1.0 - self.dropout;
        let mut rng = rand::thread_rng();
        h.mapv_inplace(|v| if rng.gen::<f64>() < self.dropout { 0.0 } else { v / keep });
        h
    }
}

fn relu(mut x: FeatureMap) -> FeatureMap {
    x.mapv_inplace(|v| v.max(0.0));
    x
}

/// Affine Coupling Layer
///
/// Forward: `v1 = u1 * s(u2) + t(u2)`, `v2 = u2`.
/// Reverse: `u1 = (v1 - t(v2)) / s(v2)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineCoupling {
    net: Option<CouplingNet>,
    hidden_channels: usize,
    kernel_size: usize,
    dropout: f64,
    training: bool,
}

impl AffineCoupling {
    /// Create an unbuilt coupling layer
    pub fn new(hidden_channels: usize, kernel_size: usize, dropout: f64) -> Self {
        Self {
            net: None,
            hidden_channels,
            kernel_size,
            dropout,
            training: false,
        }
    }

    /// Allocate the sub-network for a `channels`-wide input.
    pub fn build(&mut self, channels: usize) -> Result<()> {
        if channels % 2 != 0 {
            return Err(FlowError::OddChannels(channels));
        }
        match &self.net {
            None => {
                self.net = Some(CouplingNet::new(
                    channels / 2,
                    self.hidden_channels,
                    self.kernel_size,
                    self.dropout,
                )?);
                debug!(channels, hidden = self.hidden_channels, "AffineCoupling built");
                Ok(())
            }
            Some(net) if net.half_channels() * 2 != channels => Err(FlowError::ChannelMismatch {
                expected: net.half_channels() * 2,
                got: channels,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Sub-network, once built
    pub fn net(&self) -> Option<&CouplingNet> {
        self.net.as_ref()
    }

    /// Mutable sub-network access for an external optimizer
    pub fn net_mut(&mut self) -> Option<&mut CouplingNet> {
        self.net.as_mut()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn built_net(&self, x: &FeatureMap) -> Result<&CouplingNet> {
        let net = self
            .net
            .as_ref()
            .ok_or(FlowError::Uninitialized("AffineCoupling"))?;
        let channels = x.dim().3;
        if channels != net.half_channels() * 2 {
            return Err(FlowError::ChannelMismatch {
                expected: net.half_channels() * 2,
                got: channels,
            });
        }
        Ok(net)
    }
}

impl Bijector for AffineCoupling {
    fn prime(&mut self, x: &FeatureMap) -> Result<FeatureMap> {
        self.build(x.dim().3)?;
        let training = self.training;
        let net = self
            .net
            .as_mut()
            .ok_or(FlowError::Uninitialized("AffineCoupling"))?;

        let (u1, u2) = ops::split_half(x)?;
        let (scale, shift) = net.prime(&u2, training)?;
        let v1 = &u1 * &scale + &shift;
        ops::concat_channels(&v1, &u2)
    }

    fn forward(&self, x: &FeatureMap, logdet: bool) -> Result<(FeatureMap, f64)> {
        let net = self.built_net(x)?;
        let (u1, u2) = ops::split_half(x)?;
        let (scale, shift) = net.scale_shift(&u2, self.training)?;

        let v1 = &u1 * &scale + &shift;
        let y = ops::concat_channels(&v1, &u2)?;

        if logdet {
            let log_abs = ops::flatten(&scale.mapv(|s| s.abs().ln()))?;
            Ok((y, ops::batch_mean_of_sums(&log_abs)))
        } else {
            Ok((y, 0.0))
        }
    }

    fn reverse(&self, y: &FeatureMap) -> Result<FeatureMap> {
        let net = self.built_net(y)?;
        let (v1, v2) = ops::split_half(y)?;
        let (scale, shift) = net.scale_shift(&v2, false)?;

        let u1 = (&v1 - &shift) / &scale;
        ops::concat_channels(&u1, &v2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand_distr::Uniform;

    fn create_test_data(batch: usize, length: usize, channels: usize) -> FeatureMap {
        Array4::random((batch, length, 1, channels), Uniform::new(-1.0, 1.0))
    }

    #[test]
    fn test_seq_conv_same_padding_keeps_length() {
        let conv = SeqConv::new(3, 5, 4).unwrap();
        let y = conv.forward(&create_test_data(2, 7, 3)).unwrap();
        assert_eq!(y.dim(), (2, 7, 1, 5));
    }

    #[test]
    fn test_seq_conv_taps() {
        // kernel 4 covers positions h-1 ..= h+2
        let mut conv = SeqConv::near_zero(1, 1, 4, 0.0).unwrap();
        conv.kernel.fill(0.0);
        conv.kernel[[0, 0, 0]] = 1.0;
        conv.kernel[[3, 0, 0]] = 10.0;

        let x = Array4::from_shape_vec((1, 4, 1, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 30.0);
        assert_eq!(y[[0, 1, 0, 0]], 1.0 + 40.0);
        assert_eq!(y[[0, 2, 0, 0]], 2.0);
        assert_eq!(y[[0, 3, 0, 0]], 3.0);
    }

    #[test]
    fn test_coupling_invertibility() {
        let mut coupling = AffineCoupling::new(16, 4, 0.0);
        let x = create_test_data(3, 8, 6);
        coupling.prime(&x).unwrap();

        let (y, log_det) = coupling.forward(&x, true).unwrap();
        assert!(log_det < 0.0, "sigmoid scales are contractive");

        let x_recovered = coupling.reverse(&y).unwrap();
        for (a, b) in x.iter().zip(x_recovered.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_coupling_leaves_second_half_untouched() {
        let mut coupling = AffineCoupling::new(8, 4, 0.0);
        let x = create_test_data(2, 4, 4);
        let y = coupling.prime(&x).unwrap();
        assert_eq!(y.slice(s![.., .., .., 2..]), x.slice(s![.., .., .., 2..]));
    }

    #[test]
    fn test_coupling_identity_when_saturated() {
        let mut coupling = AffineCoupling::new(8, 4, 0.0);
        let x = create_test_data(2, 8, 4);
        coupling.prime(&x).unwrap();

        let net = coupling.net_mut().unwrap();
        net.scale_head.kernel.fill(0.0);
        net.scale_head.bias.fill(50.0);
        net.shift_head.kernel.fill(0.0);
        net.shift_head.bias.fill(-800.0);

        let (y, log_det) = coupling.forward(&x, true).unwrap();
        assert_eq!(log_det, 0.0);
        for (a, b) in x.iter().zip(y.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_coupling_rejects_odd_channels() {
        let mut coupling = AffineCoupling::new(8, 4, 0.0);
        let err = coupling.prime(&create_test_data(1, 4, 3)).unwrap_err();
        assert!(matches!(err, FlowError::OddChannels(3)));
    }

    #[test]
    fn test_coupling_requires_build_before_reverse() {
        let coupling = AffineCoupling::new(8, 4, 0.0);
        let err = coupling.reverse(&create_test_data(1, 4, 4)).unwrap_err();
        assert!(matches!(err, FlowError::Uninitialized(_)));
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut coupling = AffineCoupling::new(8, 4, 0.5);
        let x = create_test_data(2, 8, 4);
        coupling.prime(&x).unwrap();

        let (a, _) = coupling.forward(&x, false).unwrap();
        let (b, _) = coupling.forward(&x, false).unwrap();
        assert_eq!(a, b);

        coupling.set_training(true);
        let (c, _) = coupling.forward(&x, false).unwrap();
        assert_eq!(c.dim(), a.dim());
        assert_ne!(c, a);
        // the conditioning half passes through untouched even with dropout
        assert_eq!(c.slice(s![.., .., .., 2..]), a.slice(s![.., .., .., 2..]));
    }
}
