/// Dynamic time warping distance: square root of the summed squared
/// differences along the cheapest monotone alignment of `a` and `b`.
pub fn dtw_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    let m = b.len();
    let mut prev = vec![f64::INFINITY; m + 1];
    let mut curr = vec![f64::INFINITY; m + 1];
    prev[0] = 0.0;

    for &x in a {
        curr[0] = f64::INFINITY;
        for j in 1..=m {
            let d = (x - b[j - 1]).powi(2);
            curr[j] = d + prev[j - 1].min(prev[j]).min(curr[j - 1]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m].sqrt()
}

/// Optimal warping path as `(index_in_a, index_in_b)` pairs from the start
/// of both series to their ends.
pub fn dtw_path(a: &[f64], b: &[f64]) -> Vec<(usize, usize)> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let (n, m) = (a.len(), b.len());
    let mut cost = vec![vec![f64::INFINITY; m + 1]; n + 1];
    cost[0][0] = 0.0;
    for i in 1..=n {
        for j in 1..=m {
            let d = (a[i - 1] - b[j - 1]).powi(2);
            cost[i][j] = d + cost[i - 1][j - 1].min(cost[i - 1][j]).min(cost[i][j - 1]);
        }
    }

    let mut path = Vec::with_capacity(n + m);
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        path.push((i - 1, j - 1));
        let diag = cost[i - 1][j - 1];
        let up = cost[i - 1][j];
        let left = cost[i][j - 1];
        if diag <= up && diag <= left {
            i -= 1;
            j -= 1;
        } else if up <= left {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_series_have_zero_distance() {
        let a = [1.0, 2.0, 3.0, 2.0];
        assert_eq!(dtw_distance(&a, &a), 0.0);
    }

    #[test]
    fn test_time_shift_is_absorbed() {
        let a = [0.0, 0.0, 1.0, 2.0, 1.0, 0.0];
        let b = [0.0, 1.0, 2.0, 1.0, 0.0, 0.0];
        assert_eq!(dtw_distance(&a, &b), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = [0.0, 3.0, 1.0];
        let b = [1.0, 1.0, 2.0, 5.0];
        assert_eq!(dtw_distance(&a, &b), dtw_distance(&b, &a));
    }

    #[test]
    fn test_constant_offset() {
        let a = [0.0, 0.0, 0.0, 0.0];
        let b = [1.0, 1.0, 1.0, 1.0];
        assert_eq!(dtw_distance(&a, &b), 2.0);
    }

    #[test]
    fn test_path_spans_both_series() {
        let a = [0.0, 1.0, 2.0];
        let b = [0.0, 0.0, 1.0, 2.0];
        let path = dtw_path(&a, &b);
        assert_eq!(path.first(), Some(&(0, 0)));
        assert_eq!(path.last(), Some(&(2, 3)));
        assert!(path.windows(2).all(|w| w[1].0 >= w[0].0 && w[1].1 >= w[0].1));
    }
}
