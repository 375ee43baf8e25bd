//! Stateless tensor helpers shared by the flow layers
//!
//! All feature maps use the `(batch, position, width, channel)` layout.

use ndarray::{concatenate, s, Array2, Array4, Axis};

use crate::error::{FlowError, Result};

/// Four-axis feature map: (batch, position, width, channel)
pub type FeatureMap = Array4<f64>;

/// Split the channel axis at `boundary`, counting from the end when negative.
pub fn split_channels(x: &FeatureMap, boundary: isize) -> Result<(FeatureMap, FeatureMap)> {
    let channels = x.dim().3 as isize;
    let at = if boundary < 0 { channels + boundary } else { boundary };
    if at < 0 || at > channels {
        return Err(FlowError::InvalidShape(format!(
            "split boundary {} outside 0..={} channels",
            boundary, channels
        )));
    }
    let at = at as usize;

    let left = x.slice(s![.., .., .., ..at]).to_owned();
    let right = x.slice(s![.., .., .., at..]).to_owned();
    Ok((left, right))
}

/// Split the channel axis into two equal halves.
pub fn split_half(x: &FeatureMap) -> Result<(FeatureMap, FeatureMap)> {
    let channels = x.dim().3;
    if channels % 2 != 0 {
        return Err(FlowError::OddChannels(channels));
    }
    split_channels(x, (channels / 2) as isize)
}

/// Join two feature maps along the channel axis.
pub fn concat_channels(left: &FeatureMap, right: &FeatureMap) -> Result<FeatureMap> {
    let (lb, lh, lw, _) = left.dim();
    let (rb, rh, rw, _) = right.dim();
    if (lb, lh, lw) != (rb, rh, rw) {
        return Err(FlowError::InvalidShape(format!(
            "cannot concat channels of {:?} and {:?}",
            left.dim(),
            right.dim()
        )));
    }
    Ok(concatenate(Axis(3), &[left.view(), right.view()])?)
}

/// Exchange the two channel halves. Applying it twice is the identity.
pub fn swap_halves(x: &FeatureMap) -> Result<FeatureMap> {
    let (a, b) = split_half(x)?;
    concat_channels(&b, &a)
}

/// Regroup `factor` consecutive positions into the channel axis.
///
/// `(B, H, 1, C)` becomes `(B, H / factor, 1, C * factor)`; position
/// `h * factor + j` lands in channel `j * C + c`.
pub fn squeeze(x: &FeatureMap, factor: usize) -> Result<FeatureMap> {
    let (batch, length, width, channels) = x.dim();
    if factor == 0 || length % factor != 0 {
        return Err(FlowError::InvalidShape(format!(
            "sequence length {} not divisible by squeeze factor {}",
            length, factor
        )));
    }
    if width != 1 {
        return Err(FlowError::InvalidShape(format!(
            "squeeze expects width 1, got {}",
            width
        )));
    }

    let values: Vec<f64> = x.iter().copied().collect();
    Ok(Array4::from_shape_vec(
        (batch, length / factor, 1, channels * factor),
        values,
    )?)
}

/// Exact inverse of [`squeeze`]; `target_length` is the sequence length to restore.
pub fn unsqueeze(x: &FeatureMap, factor: usize, target_length: usize) -> Result<FeatureMap> {
    let (batch, length, width, channels) = x.dim();
    if factor == 0 || channels % factor != 0 || length * factor != target_length {
        return Err(FlowError::InvalidShape(format!(
            "cannot unsqueeze {:?} by {} into length {}",
            x.dim(),
            factor,
            target_length
        )));
    }
    if width != 1 {
        return Err(FlowError::InvalidShape(format!(
            "unsqueeze expects width 1, got {}",
            width
        )));
    }

    let values: Vec<f64> = x.iter().copied().collect();
    Ok(Array4::from_shape_vec(
        (batch, target_length, 1, channels / factor),
        values,
    )?)
}

/// View every spatial position as one row: `(B*H*W, C)`.
pub(crate) fn to_rows(x: &FeatureMap) -> Result<Array2<f64>> {
    let (batch, length, width, channels) = x.dim();
    let values: Vec<f64> = x.iter().copied().collect();
    Ok(Array2::from_shape_vec((batch * length * width, channels), values)?)
}

/// Inverse of [`to_rows`].
pub(crate) fn from_rows(
    rows: &Array2<f64>,
    batch: usize,
    length: usize,
    width: usize,
) -> Result<FeatureMap> {
    let channels = rows.ncols();
    let values: Vec<f64> = rows.iter().copied().collect();
    Ok(Array4::from_shape_vec((batch, length, width, channels), values)?)
}

/// Flatten each batch element into one row.
pub(crate) fn flatten(x: &FeatureMap) -> Result<Array2<f64>> {
    let batch = x.dim().0;
    let per_item = x.len() / batch.max(1);
    let values: Vec<f64> = x.iter().copied().collect();
    Ok(Array2::from_shape_vec((batch, per_item), values)?)
}

/// Gaussian log-density of `v` under `(mean, log_std)`, summed per batch element.
pub(crate) fn gaussian_log_density(
    v: &FeatureMap,
    mean: &FeatureMap,
    log_std: &FeatureMap,
) -> Result<Array2<f64>> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let mut density = Array4::zeros(v.raw_dim());
    ndarray::Zip::from(&mut density)
        .and(v)
        .and_broadcast(mean)
        .and_broadcast(log_std)
        .for_each(|d, &x, &m, &ls| {
            let z = (x - m) / ls.exp();
            *d = -0.5 * (ln_2pi + 2.0 * ls + z * z);
        });
    flatten(&density)
}

/// Mean over the batch of each element's summed contribution.
pub(crate) fn batch_mean_of_sums(per_item: &Array2<f64>) -> f64 {
    per_item
        .sum_axis(Axis(1))
        .mean()
        .unwrap_or(0.0)
}

/// Logistic sigmoid
pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(batch: usize, length: usize, channels: usize) -> FeatureMap {
        Array4::from_shape_fn((batch, length, 1, channels), |(b, h, _, c)| {
            (b * 1000 + h * 10 + c) as f64
        })
    }

    #[test]
    fn test_split_concat_restores_input() {
        let x = ramp(2, 4, 6);
        let (left, right) = split_half(&x).unwrap();
        assert_eq!(left.dim().3, 3);
        assert_eq!(right.dim().3, 3);
        assert_eq!(concat_channels(&left, &right).unwrap(), x);
    }

    #[test]
    fn test_negative_boundary_counts_from_end() {
        let x = ramp(1, 2, 6);
        let (left, right) = split_channels(&x, -2).unwrap();
        assert_eq!(left.dim().3, 4);
        assert_eq!(right.dim().3, 2);
        assert_eq!(right[[0, 1, 0, 0]], x[[0, 1, 0, 4]]);
    }

    #[test]
    fn test_split_rejects_bad_boundary() {
        let x = ramp(1, 2, 4);
        assert!(matches!(split_channels(&x, 5), Err(FlowError::InvalidShape(_))));
        assert!(matches!(split_channels(&x, -5), Err(FlowError::InvalidShape(_))));
        assert!(matches!(split_half(&ramp(1, 2, 3)), Err(FlowError::OddChannels(3))));
    }

    #[test]
    fn test_swap_halves_is_involution() {
        let x = ramp(2, 3, 4);
        let swapped = swap_halves(&x).unwrap();
        assert_eq!(swapped[[0, 0, 0, 0]], x[[0, 0, 0, 2]]);
        assert_eq!(swap_halves(&swapped).unwrap(), x);
    }

    #[test]
    fn test_squeeze_layout() {
        let x = ramp(1, 4, 2);
        let y = squeeze(&x, 2).unwrap();
        assert_eq!(y.dim(), (1, 2, 1, 4));
        // position 3, channel 1 -> group 1, offset 1 -> channel 1 * 2 + 1
        assert_eq!(y[[0, 1, 0, 3]], x[[0, 3, 0, 1]]);
        assert_eq!(unsqueeze(&y, 2, 4).unwrap(), x);
    }

    #[test]
    fn test_unsqueeze_requires_matching_length() {
        let y = squeeze(&ramp(1, 8, 2), 2).unwrap();
        assert!(unsqueeze(&y, 2, 6).is_err());
        assert!(squeeze(&ramp(1, 5, 2), 2).is_err());
    }

    #[test]
    fn test_gaussian_log_density_standard_normal() {
        let v = Array4::zeros((1, 1, 1, 1));
        let zeros = Array4::zeros((1, 1, 1, 1));
        let density = gaussian_log_density(&v, &zeros, &zeros).unwrap();
        assert_abs_diff_eq!(
            density[[0, 0]],
            -0.5 * (2.0 * std::f64::consts::PI).ln(),
            epsilon = 1e-12
        );
    }
}
