//! Training Module
//!
//! Epoch loops, rollout evaluation, divergence metrics, and the shared
//! per-batch featurization: scalar node features from velocity
//! magnitudes, edge attributes from charge products plus current pairwise
//! squared distances, and the per-graph mean-centering offset.

mod metrics;
mod rollout;
mod trainer;

pub use metrics::{pearson_horizon, HorizonMetrics};
pub use rollout::{Rollout, RolloutState};
pub use trainer::{mse_per_timestep, BestResult, EarlyStopping, Trainer, TrainingResults};

use ndarray::Array2;

/// Scalar node features: one velocity magnitude per input frame. When
/// fewer frames than `channels` are supplied (rollout feedback), the last
/// frame's magnitude fills the remaining channels.
pub fn velocity_magnitudes(vel_inputs: &[Array2<f64>], channels: usize) -> Array2<f64> {
    let rows = vel_inputs[0].nrows();
    let mut nodes = Array2::zeros((rows, channels));
    for c in 0..channels {
        let frame = &vel_inputs[c.min(vel_inputs.len() - 1)];
        for i in 0..rows {
            nodes[[i, c]] = frame.row(i).iter().map(|v| v * v).sum::<f64>().sqrt();
        }
    }
    nodes
}

/// External edge attributes: the stored charge products with the current
/// pairwise squared distance appended.
pub fn edge_features(
    charge_attr: &Array2<f64>,
    loc: &Array2<f64>,
    rows: &[usize],
    cols: &[usize],
) -> Array2<f64> {
    let e = rows.len();
    let a = charge_attr.ncols();
    let mut out = Array2::zeros((e, a + 1));
    for (i, (&r, &c)) in rows.iter().zip(cols.iter()).enumerate() {
        for j in 0..a {
            out[[i, j]] = charge_attr[[i, j]];
        }
        let dist: f64 = loc
            .row(r)
            .iter()
            .zip(loc.row(c).iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        out[[i, a]] = dist;
    }
    out
}

/// Per-graph coordinate mean, replicated onto each of the graph's nodes.
pub fn graph_mean(loc: &Array2<f64>, n_nodes: usize) -> Array2<f64> {
    let batch = loc.nrows() / n_nodes;
    let mut out = Array2::zeros(loc.dim());
    for b in 0..batch {
        let mut mean = vec![0.0; loc.ncols()];
        for i in 0..n_nodes {
            for (k, m) in mean.iter_mut().enumerate() {
                *m += loc[[b * n_nodes + i, k]] / n_nodes as f64;
            }
        }
        for i in 0..n_nodes {
            for (k, m) in mean.iter().enumerate() {
                out[[b * n_nodes + i, k]] = *m;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_velocity_magnitudes_per_channel() {
        let v1 = array![[3.0, 4.0, 0.0]];
        let v2 = array![[0.0, 0.0, 2.0]];
        let nodes = velocity_magnitudes(&[v1, v2], 2);
        assert!((nodes[[0, 0]] - 5.0).abs() < 1e-12);
        assert!((nodes[[0, 1]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_velocity_magnitudes_replicates_last_frame() {
        let v = array![[3.0, 4.0, 0.0]];
        let nodes = velocity_magnitudes(&[v], 3);
        for c in 0..3 {
            assert!((nodes[[0, c]] - 5.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_edge_features_appends_squared_distance() {
        let charge = array![[1.0], [-1.0]];
        let loc = array![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        let out = edge_features(&charge, &loc, &[0, 1], &[1, 0]);
        assert_eq!(out.dim(), (2, 2));
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[0, 1]], 4.0);
        assert_eq!(out[[1, 1]], 4.0);
    }

    #[test]
    fn test_graph_mean_per_block() {
        let loc = array![
            [0.0, 0.0, 0.0],
            [2.0, 2.0, 2.0],
            [10.0, 0.0, 0.0],
            [20.0, 0.0, 0.0]
        ];
        let mean = graph_mean(&loc, 2);
        assert_eq!(mean[[0, 0]], 1.0);
        assert_eq!(mean[[1, 0]], 1.0);
        assert_eq!(mean[[2, 0]], 15.0);
        assert_eq!(mean[[3, 0]], 15.0);
    }
}
