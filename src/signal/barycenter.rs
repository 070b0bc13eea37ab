use super::dtw::{dtw_distance, dtw_path};

const DBA_MAX_ITERATIONS: usize = 10;
const DBA_TOLERANCE: f64 = 1e-9;

/// DTW barycenter averaging. Starts from the medoid and repeatedly replaces
/// every barycenter sample with the mean of all samples aligned to it.
pub fn dba(series: &[Vec<f64>]) -> Vec<f64> {
    let series: Vec<&Vec<f64>> = series.iter().filter(|s| !s.is_empty()).collect();
    match series.len() {
        0 => return Vec::new(),
        1 => return series[0].clone(),
        _ => {}
    }

    let mut center = medoid(&series).clone();
    for _ in 0..DBA_MAX_ITERATIONS {
        let mut sums = vec![0.0; center.len()];
        let mut counts = vec![0usize; center.len()];
        for s in &series {
            for (ci, si) in dtw_path(&center, s) {
                sums[ci] += s[si];
                counts[ci] += 1;
            }
        }
        let next: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .zip(&center)
            .map(|((sum, &count), old)| if count > 0 { sum / count as f64 } else { *old })
            .collect();
        let shift = next
            .iter()
            .zip(&center)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        center = next;
        if shift < DBA_TOLERANCE {
            break;
        }
    }
    center
}

fn medoid<'a>(series: &[&'a Vec<f64>]) -> &'a Vec<f64> {
    let mut best = 0;
    let mut best_cost = f64::INFINITY;
    for (i, a) in series.iter().enumerate() {
        let cost: f64 = series.iter().map(|b| dtw_distance(a, b)).sum();
        if cost < best_cost {
            best_cost = cost;
            best = i;
        }
    }
    series[best]
}
