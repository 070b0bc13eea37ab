/// Resamples `values` to exactly `target` points by linear interpolation over
/// evenly spaced positions spanning the whole input. Endpoints are preserved,
/// so the overall shape survives both up- and downsampling.
pub fn resample(values: &[f64], target: usize) -> Vec<f64> {
    if target == 0 || values.is_empty() {
        return Vec::new();
    }
    if values.len() == target {
        return values.to_vec();
    }
    if values.len() == 1 {
        return vec![values[0]; target];
    }
    if target == 1 {
        return vec![values[0]];
    }

    let last = (values.len() - 1) as f64;
    let step = last / (target - 1) as f64;
    (0..target)
        .map(|i| {
            let pos = (i as f64 * step).min(last);
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(values.len() - 1);
            let frac = pos - lo as f64;
            values[lo] + (values[hi] - values[lo]) * frac
        })
        .collect()
}

/// Downsamples only when `n_segments` is set and smaller than the input.
pub fn downsample(values: &[f64], n_segments: Option<usize>) -> Vec<f64> {
    match n_segments {
        Some(n) if n < values.len() => resample(values, n),
        _ => values.to_vec(),
    }
}

/// Picks the first item of each of `n_segments` equal-width windows, matching
/// the point count produced by [`downsample`].
pub fn downsample_labels<T: Clone>(items: &[T], n_segments: Option<usize>) -> Vec<T> {
    match n_segments {
        Some(n) if n < items.len() => {
            if n == 0 {
                return Vec::new();
            }
            let step = items.len() / n;
            (0..n).map(|w| items[w * step].clone()).collect()
        }
        _ => items.to_vec(),
    }
}

/// Min-max scales into `[0, 1]`. A constant input scales to all zeros.
pub fn min_max_scale(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|v| if span > 0.0 { (v - min) / span } else { 0.0 })
        .collect()
}
