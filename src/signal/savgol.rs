//! Savitzky–Golay smoothing.
//!
//! Each output point is the value at that position of a least-squares
//! polynomial fitted over a window of neighbouring input points. Near the
//! edges the window is pinned to the first/last `window` samples and the
//! fitted polynomial is evaluated off-centre.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmoothingError {
    #[error("window length {0} must be odd")]
    EvenWindow(usize),
    #[error("polynomial order {order} must be less than window length {window}")]
    OrderTooLarge { window: usize, order: usize },
    #[error("window length {window} exceeds data length {len}")]
    WindowTooLong { window: usize, len: usize },
    #[error("least-squares system is singular")]
    Singular,
}

pub fn savgol_filter(data: &[f64], window: usize, order: usize) -> Result<Vec<f64>, SmoothingError> {
    if window % 2 == 0 {
        return Err(SmoothingError::EvenWindow(window));
    }
    if order >= window {
        return Err(SmoothingError::OrderTooLarge { window, order });
    }
    if window > data.len() {
        return Err(SmoothingError::WindowTooLong {
            window,
            len: data.len(),
        });
    }

    // weights[p] evaluates the fit at offset p inside the window.
    let weights = (0..window)
        .map(|p| fit_weights(window, order, p))
        .collect::<Result<Vec<_>, _>>()?;

    let n = data.len();
    let half = window / 2;
    let out = (0..n)
        .map(|i| {
            let (start, pos) = if i < half {
                (0, i)
            } else if i + half >= n {
                (n - window, i - (n - window))
            } else {
                (i - half, half)
            };
            weights[pos]
                .iter()
                .zip(&data[start..start + window])
                .map(|(w, y)| w * y)
                .sum()
        })
        .collect();
    Ok(out)
}

/// Linear weights `h` with `fit(pos) = sum(h[k] * y[k])` for a polynomial of
/// `order` fitted over `window` samples.
fn fit_weights(window: usize, order: usize, pos: usize) -> Result<Vec<f64>, SmoothingError> {
    let scale = (window as f64 / 2.0).max(1.0);
    let xs: Vec<f64> = (0..window)
        .map(|k| (k as f64 - pos as f64) / scale)
        .collect();
    let terms = order + 1;

    let mut gram = vec![vec![0.0; terms]; terms];
    for x in &xs {
        let powers: Vec<f64> = (0..terms).map(|j| x.powi(j as i32)).collect();
        for r in 0..terms {
            for c in 0..terms {
                gram[r][c] += powers[r] * powers[c];
            }
        }
    }

    let mut rhs = vec![0.0; terms];
    rhs[0] = 1.0;
    let z = solve(gram, rhs).ok_or(SmoothingError::Singular)?;

    Ok(xs
        .iter()
        .map(|x| (0..terms).map(|j| x.powi(j as i32) * z[j]).sum())
        .collect())
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    #[test]
    fn test_cubic_is_reproduced_exactly() {
        let data: Vec<f64> = (0..20)
            .map(|i| {
                let x = i as f64;
                0.5 * x * x * x - 2.0 * x * x + x - 3.0
            })
            .collect();
        let out = savgol_filter(&data, 7, 3).unwrap();
        for (a, b) in out.iter().zip(data.iter()) {
            assert_approx(*a, *b, 1e-6);
        }
    }

    #[test]
    fn test_known_interior_coefficients() {
        // Classic 5-point quadratic/cubic smoothing: (-3, 12, 17, 12, -3) / 35.
        let data = [0.0, 0.0, 35.0, 0.0, 0.0, 0.0, 0.0];
        let out = savgol_filter(&data, 5, 3).unwrap();
        assert_approx(out[2], 17.0, 1e-9);
        assert_approx(out[3], 12.0, 1e-9);
        assert_approx(out[4], -3.0, 1e-9);
    }

    #[test]
    fn test_smooths_noise() {
        let data: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let out = savgol_filter(&data, 9, 3).unwrap();
        let interior_max = out[5..35].iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(interior_max < 0.5, "interior still noisy: {interior_max}");
    }

    #[test]
    fn test_invalid_windows() {
        let data = [1.0; 10];
        assert_eq!(savgol_filter(&data, 6, 3), Err(SmoothingError::EvenWindow(6)));
        assert_eq!(
            savgol_filter(&data, 3, 3),
            Err(SmoothingError::OrderTooLarge { window: 3, order: 3 })
        );
        assert_eq!(
            savgol_filter(&data, 11, 3),
            Err(SmoothingError::WindowTooLong { window: 11, len: 10 })
        );
    }
}
