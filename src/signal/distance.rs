use serde::Serialize;

use super::dtw::dtw_distance;

/// Square, symmetric pairwise distance matrix with a zero diagonal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceMatrix {
    size: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    /// Builds the matrix from the upper triangle of `dist`.
    pub fn from_fn(size: usize, mut dist: impl FnMut(usize, usize) -> f64) -> Self {
        let mut values = vec![0.0; size * size];
        for i in 0..size {
            for j in i + 1..size {
                let d = dist(i, j);
                values[i * size + j] = d;
                values[j * size + i] = d;
            }
        }
        Self { size, values }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.size + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.size..(i + 1) * self.size]
    }

    /// Upper triangle in row-major order: `(0,1), (0,2), …, (1,2), …`.
    pub fn condensed(&self) -> CondensedMatrix {
        let mut values = Vec::with_capacity(self.size * self.size.saturating_sub(1) / 2);
        for i in 0..self.size {
            for j in i + 1..self.size {
                values.push(self.get(i, j));
            }
        }
        CondensedMatrix {
            size: self.size,
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CondensedMatrix {
    size: usize,
    values: Vec<f64>,
}

impl CondensedMatrix {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i == j {
            return 0.0;
        }
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        let n = self.size;
        self.values[n * i - i * (i + 1) / 2 + (j - i - 1)]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

pub fn dtw_distance_matrix(series: &[Vec<f64>]) -> DistanceMatrix {
    DistanceMatrix::from_fn(series.len(), |i, j| dtw_distance(&series[i], &series[j]))
}

/// Euclidean distances between equal-length vectors.
pub fn euclidean_distance_matrix(series: &[Vec<f64>]) -> DistanceMatrix {
    DistanceMatrix::from_fn(series.len(), |i, j| {
        series[i]
            .iter()
            .zip(&series[j])
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    })
}
