use std::fmt;
use std::str::FromStr;

use ndarray::{Array, Array2, Array3, Axis, Dimension};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PreprocessError {
    #[error("unrecognized normalization mode \"{0}\"")]
    InvalidMode(String),

    #[error("clipping is not defined for the {0} normalization mode")]
    ClipUnsupported(NormalizationMode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizationMode {
    // linear map of [cmin, cmax] onto [0, 1]
    ZeroToOne,
    // linear map of [cmin, cmax] onto [-1, 1]
    MinusOneToOne,
    // (x - mean) / stddev, unbounded
    ZeroMeanUnitVariance,
}

impl NormalizationMode {
    // Bounds of the target range, None for the unbounded mode.
    fn target_range(&self) -> Option<(f32, f32)> {
        match self {
            NormalizationMode::ZeroToOne => Some((0.0, 1.0)),
            NormalizationMode::MinusOneToOne => Some((-1.0, 1.0)),
            NormalizationMode::ZeroMeanUnitVariance => None,
        }
    }
}

impl FromStr for NormalizationMode {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<NormalizationMode, PreprocessError> {
        match s {
            "ranged_zero_and_one" => Ok(NormalizationMode::ZeroToOne),
            "ranged_minus_one_and_one" => Ok(NormalizationMode::MinusOneToOne),
            "zero_mean" => Ok(NormalizationMode::ZeroMeanUnitVariance),
            _ => Err(PreprocessError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            NormalizationMode::ZeroToOne => "ranged_zero_and_one",
            NormalizationMode::MinusOneToOne => "ranged_minus_one_and_one",
            NormalizationMode::ZeroMeanUnitVariance => "zero_mean",
        };
        write!(f, "{name}")
    }
}

// Source-range selection for normalization. Explicit bounds beat the
// observed min/max, and percentile bounds beat both when given.
#[derive(Clone, Copy, Debug, Default)]
pub struct NormalizeOptions {
    pub cmin: Option<f32>,
    pub cmax: Option<f32>,
    pub percentile: Option<(f32, f32)>,
    pub clip: bool,
}

// Remap intensities onto the mode's target range. A resolved range of zero
// width is a defined no-op: the input comes back unchanged, never a division
// by zero. Clipping confines the result to the target range and is rejected
// for the unbounded mode.
pub fn normalize<D: Dimension>(
    img: &Array<f32, D>,
    mode: NormalizationMode,
    opts: &NormalizeOptions,
) -> Result<Array<f32, D>, PreprocessError> {
    if let (Some(lo), Some(hi)) = (opts.cmin, opts.cmax) {
        assert!(lo != hi, "explicit cmin and cmax must differ");
    }
    if opts.clip && mode.target_range().is_none() {
        return Err(PreprocessError::ClipUnsupported(mode));
    }
    if img.is_empty() {
        return Ok(img.clone());
    }

    let mut lo = opts
        .cmin
        .unwrap_or_else(|| img.fold(f32::INFINITY, |acc, &v| acc.min(v)));
    let mut hi = opts
        .cmax
        .unwrap_or_else(|| img.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)));
    if let Some((plo, phi)) = opts.percentile {
        lo = percentile(img, plo);
        hi = percentile(img, phi);
    }

    if hi - lo == 0.0 {
        return Ok(img.clone());
    }

    let out = match mode {
        NormalizationMode::ZeroToOne => img.mapv(|v| (v - lo) / (hi - lo)),
        NormalizationMode::MinusOneToOne => img.mapv(|v| 2.0 * (v - lo) / (hi - lo) - 1.0),
        NormalizationMode::ZeroMeanUnitVariance => {
            let n = img.len() as f64;
            let mean = img.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = img
                .iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / n;
            let std = var.sqrt();
            if std == 0.0 {
                // constant input, nothing to standardize
                return Ok(img.clone());
            }
            img.mapv(|v| ((v as f64 - mean) / std) as f32)
        }
    };

    if opts.clip {
        if let Some((t_lo, t_hi)) = mode.target_range() {
            return Ok(out.mapv(|v| v.clamp(t_lo, t_hi)));
        }
    }
    Ok(out)
}

// Percentile with linear interpolation between ranks, matching numpy's
// default. NaN on an empty array.
pub fn percentile<D: Dimension>(img: &Array<f32, D>, q: f32) -> f32 {
    let mut values: Vec<f32> = img.iter().copied().collect();
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(f32::total_cmp);

    let top = (values.len() - 1) as f64;
    let rank = (q as f64 / 100.0 * top).clamp(0.0, top);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    values[lo] + (values[hi] - values[lo]) * frac
}

#[allow(dead_code)]
pub fn clip<D: Dimension>(img: &Array<f32, D>, lo: f32, hi: f32) -> Array<f32, D> {
    assert!(lo <= hi, "clip bounds are reversed");
    img.mapv(|v| v.clamp(lo, hi))
}

#[allow(dead_code)]
pub fn gain<D: Dimension>(img: &Array<f32, D>, factor: f32) -> Array<f32, D> {
    img.mapv(|v| v * factor)
}

// Percentile-based contrast stretch onto [0, 1].
pub fn rescale_intensity<D: Dimension>(
    img: &Array<f32, D>,
    percentiles: (f32, f32),
) -> Result<Array<f32, D>, PreprocessError> {
    let opts = NormalizeOptions {
        percentile: Some(percentiles),
        clip: true,
        ..NormalizeOptions::default()
    };
    normalize(img, NormalizationMode::ZeroToOne, &opts)
}

fn interp(v: f32, xs: &[f32], ys: &[f32]) -> f32 {
    if v <= xs[0] {
        return ys[0];
    }
    if v >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let i = xs.partition_point(|&x| x <= v);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (v - x0) / (x1 - x0)
}

// Histogram equalization onto (0, 1]: values are ranked through the image's
// binned cumulative distribution, interpolated between bin centers. Constant
// or empty input comes back unchanged.
#[allow(dead_code)]
pub fn equalize_hist<D: Dimension>(img: &Array<f32, D>, nbins: usize) -> Array<f32, D> {
    assert!(nbins >= 2, "histogram needs at least two bins");
    if img.is_empty() {
        return img.clone();
    }
    let lo = img.fold(f32::INFINITY, |acc, &v| acc.min(v));
    let hi = img.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if hi - lo == 0.0 {
        return img.clone();
    }

    let scale = nbins as f32 / (hi - lo);
    let mut counts = vec![0usize; nbins];
    for &v in img.iter() {
        let bin = (((v - lo) * scale) as usize).min(nbins - 1);
        counts[bin] += 1;
    }

    let total = img.len() as f32;
    let mut cdf = vec![0.0f32; nbins];
    let mut acc = 0usize;
    for (bin, &count) in counts.iter().enumerate() {
        acc += count;
        cdf[bin] = acc as f32 / total;
    }

    let centers: Vec<f32> = (0..nbins)
        .map(|bin| lo + (bin as f32 + 0.5) / scale)
        .collect();

    img.mapv(|v| interp(v, &centers, &cdf))
}

// Coefficient of the cubic kernel used by OpenCV's INTER_CUBIC.
const CUBIC_A: f32 = -0.75;

fn cubic_weight(t: f32) -> f32 {
    let t = t.abs();
    if t <= 1.0 {
        ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        (((t - 5.0) * t + 8.0) * t - 4.0) * CUBIC_A
    } else {
        0.0
    }
}

// Sample positions and weights for one output coordinate. Taps falling
// outside the input are clamped to the border, replicating edge values.
fn cubic_taps(s: f32, n: usize) -> ([usize; 4], [f32; 4]) {
    let base = s.floor();
    let t = s - base;
    let base = base as isize;

    let mut idx = [0usize; 4];
    let mut weights = [0f32; 4];
    for (k, offset) in (-1isize..=2).enumerate() {
        idx[k] = (base + offset).clamp(0, n as isize - 1) as usize;
        weights[k] = cubic_weight(t - offset as f32);
    }
    (idx, weights)
}

// Cubic resample of a 2d array by a uniform scale factor. Output dimensions
// are round(factor * dim) per axis; destination pixels map back onto the
// source grid center-aligned, the way OpenCV's resize does.
pub fn resize(img: &Array2<f32>, factor: f32) -> Array2<f32> {
    assert!(
        factor > 0.0 && factor.is_finite(),
        "scale factor must be a positive finite number"
    );
    let (height, width) = img.dim();
    let out_h = (factor * height as f32).round() as usize;
    let out_w = (factor * width as f32).round() as usize;
    if height == 0 || width == 0 || out_h == 0 || out_w == 0 {
        return Array2::zeros((out_h, out_w));
    }

    let fy = out_h as f32 / height as f32;
    let fx = out_w as f32 / width as f32;

    // Separable kernel: horizontal pass, then vertical.
    let mut rows = Array2::zeros((height, out_w));
    for dx in 0..out_w {
        let sx = (dx as f32 + 0.5) / fx - 0.5;
        let (idx, weights) = cubic_taps(sx, width);
        for y in 0..height {
            let mut acc = 0.0;
            for k in 0..4 {
                acc += weights[k] * img[[y, idx[k]]];
            }
            rows[[y, dx]] = acc;
        }
    }

    let mut out = Array2::zeros((out_h, out_w));
    for dy in 0..out_h {
        let sy = (dy as f32 + 0.5) / fy - 0.5;
        let (idx, weights) = cubic_taps(sy, height);
        for dx in 0..out_w {
            let mut acc = 0.0;
            for k in 0..4 {
                acc += weights[k] * rows[[idx[k], dx]];
            }
            out[[dy, dx]] = acc;
        }
    }
    out
}

// Maximum-intensity projection along z.
pub fn max_projection(volume: &Array3<f32>) -> Array2<f32> {
    volume.fold_axis(Axis(0), f32::NEG_INFINITY, |acc, &v| acc.max(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array3};

    #[test]
    fn test_mode_tokens_round_trip() {
        for mode in [
            NormalizationMode::ZeroToOne,
            NormalizationMode::MinusOneToOne,
            NormalizationMode::ZeroMeanUnitVariance,
        ] {
            assert_eq!(mode.to_string().parse::<NormalizationMode>(), Ok(mode));
        }
        assert_eq!(
            "ranged_ten_and_twelve".parse::<NormalizationMode>(),
            Err(PreprocessError::InvalidMode(
                "ranged_ten_and_twelve".to_string()
            ))
        );
    }

    #[test]
    fn test_zero_to_one_round_trip() {
        let img = array![[2.0f32, 4.0], [6.0, 10.0]];
        let opts = NormalizeOptions {
            cmin: Some(2.0),
            cmax: Some(10.0),
            ..NormalizeOptions::default()
        };
        let normalized = normalize(&img, NormalizationMode::ZeroToOne, &opts).unwrap();
        assert_eq!(normalized[[0, 0]], 0.0);
        assert_eq!(normalized[[1, 1]], 1.0);

        let recovered = normalized.mapv(|v| v * 8.0 + 2.0);
        for (a, b) in recovered.iter().zip(img.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_degenerate_range_is_identity() {
        let img = Array2::from_elem((3, 3), 5.0f32);
        let opts = NormalizeOptions {
            cmin: Some(5.0),
            ..NormalizeOptions::default()
        };
        let out = normalize(&img, NormalizationMode::ZeroToOne, &opts).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_minus_one_to_one_endpoints() {
        let img = Array1::from(vec![0.0f32, 5.0, 10.0]);
        let out = normalize(
            &img,
            NormalizationMode::MinusOneToOne,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn test_zero_mean_unit_variance() {
        let img = Array1::from(vec![1.0f32, 2.0, 3.0, 4.0]);
        let out = normalize(
            &img,
            NormalizationMode::ZeroMeanUnitVariance,
            &NormalizeOptions::default(),
        )
        .unwrap();

        let mean: f32 = out.iter().sum::<f32>() / out.len() as f32;
        let var: f32 = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / out.len() as f32;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_clip_rejected_for_zero_mean() {
        let img = Array1::from(vec![1.0f32, 2.0]);
        let opts = NormalizeOptions {
            clip: true,
            ..NormalizeOptions::default()
        };
        assert_eq!(
            normalize(&img, NormalizationMode::ZeroMeanUnitVariance, &opts),
            Err(PreprocessError::ClipUnsupported(
                NormalizationMode::ZeroMeanUnitVariance
            ))
        );
    }

    #[test]
    fn test_clip_confines_to_target_range() {
        let img = Array1::from(vec![0.0f32, 5.0, 10.0]);
        let opts = NormalizeOptions {
            cmin: Some(2.0),
            cmax: Some(8.0),
            clip: true,
            ..NormalizeOptions::default()
        };
        let out = normalize(&img, NormalizationMode::ZeroToOne, &opts).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 1.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let img = Array1::from(vec![1.0f32, 2.0, 3.0, 4.0]);
        assert_eq!(percentile(&img, 0.0), 1.0);
        assert_eq!(percentile(&img, 100.0), 4.0);
        assert!((percentile(&img, 50.0) - 2.5).abs() < 1e-6);
        assert!((percentile(&img, 25.0) - 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_rescale_intensity_saturates_tails() {
        let img = Array1::from((0..101).map(|v| v as f32).collect::<Vec<_>>());
        let out = rescale_intensity(&img, (2.0, 98.0)).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[100], 1.0);
        assert!((out[50] - 0.5).abs() < 1e-6);
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_clip_and_gain() {
        let img = Array1::from(vec![-1.0f32, 0.5, 2.0]);
        assert_eq!(clip(&img, 0.0, 1.0), Array1::from(vec![0.0f32, 0.5, 1.0]));
        assert_eq!(gain(&img, 2.0), Array1::from(vec![-2.0f32, 1.0, 4.0]));
    }

    #[test]
    fn test_equalize_hist_is_monotone_in_unit_range() {
        let img = Array1::from(vec![0.0f32, 1.0, 1.0, 2.0, 3.0, 10.0]);
        let out = equalize_hist(&img, 256);
        for window in out.as_slice().unwrap().windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let flat = Array1::from(vec![3.0f32; 5]);
        assert_eq!(equalize_hist(&flat, 256), flat);
    }

    #[test]
    fn test_resize_rounds_output_dimensions() {
        let img = Array2::from_elem((10, 10), 1.0f32);
        assert_eq!(resize(&img, 0.3).dim(), (3, 3));
        assert_eq!(resize(&img, 0.25).dim(), (3, 3));
        assert_eq!(resize(&img, 2.0).dim(), (20, 20));
    }

    #[test]
    fn test_resize_identity_factor() {
        let img = Array2::from_shape_fn((6, 7), |(y, x)| (y * 10 + x) as f32);
        let out = resize(&img, 1.0);
        for (a, b) in out.iter().zip(img.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_resize_preserves_constant_images() {
        let img = Array2::from_elem((9, 12), 7.5f32);
        let out = resize(&img, 0.4);
        assert_eq!(out.dim(), (4, 5));
        for &v in out.iter() {
            assert!((v - 7.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_resize_to_nothing_is_empty() {
        let img = Array2::from_elem((2, 2), 1.0f32);
        assert_eq!(resize(&img, 0.1).dim(), (0, 0));
    }

    #[test]
    fn test_max_projection() {
        let volume = Array3::from_shape_fn((3, 2, 2), |(z, y, x)| (z * 4 + y * 2 + x) as f32);
        let proj = max_projection(&volume);
        assert_eq!(proj, array![[8.0, 9.0], [10.0, 11.0]]);
    }
}
