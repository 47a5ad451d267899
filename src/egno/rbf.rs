//! Radial Basis Expansion
//!
//! Featurizes a scalar distance as a vector of Gaussian responses centered
//! on an evenly spaced grid. Centers are fixed at construction and are not
//! trainable. Every equivariant layer constructs one of these; it is not
//! wired into the edge model (see DESIGN.md).

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Gaussian grid featurizer over `[low, high]` with spacing `gap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbfExpansion {
    pub centers: Array1<f64>,
    pub gamma: f64,
}

impl RbfExpansion {
    /// `ceil((high - low) / gap)` centers spaced linearly over the range,
    /// `gamma = 1 / gap`.
    pub fn new(low: f64, high: f64, gap: f64) -> Self {
        let num_centers = ((high - low) / gap).ceil() as usize;
        let centers = if num_centers == 1 {
            Array1::from_elem(1, low)
        } else {
            Array1::from_iter(
                (0..num_centers)
                    .map(|i| low + (high - low) * i as f64 / (num_centers - 1) as f64),
            )
        };
        Self {
            centers,
            gamma: 1.0 / gap,
        }
    }

    pub fn num_centers(&self) -> usize {
        self.centers.len()
    }

    /// Expand one distance into the Gaussian response vector.
    pub fn expand(&self, dist: f64) -> Array1<f64> {
        self.centers
            .mapv(|c| (-self.gamma * (dist - c) * (dist - c)).exp())
    }

    /// Expand a batch of distances, one row per input.
    pub fn expand_batch(&self, dists: &Array1<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((dists.len(), self.num_centers()));
        for (i, &d) in dists.iter().enumerate() {
            out.row_mut(i).assign(&self.expand(d));
        }
        out
    }
}

impl Default for RbfExpansion {
    fn default() -> Self {
        Self::new(0.0, 30.0, 0.1)
    }
}
