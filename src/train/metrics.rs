//! Trajectory Divergence Metrics
//!
//! Batched Pearson correlation between predicted and true states, per
//! output timestep, and the prediction-horizon summaries derived from it.

use ndarray::Array2;

use crate::utils::math::pearson_correlation;

/// Correlation table plus the two horizon summaries.
#[derive(Debug, Clone)]
pub struct HorizonMetrics {
    /// Per-sample, per-timestep correlation, `(kept_batch, total_steps)`.
    pub correlations: Array2<f64>,

    /// First timestep index at which each sample's correlation drops below
    /// the threshold (full horizon when it never does), averaged over the
    /// kept batch rows.
    pub avg_horizon: f64,

    /// First timestep index at which any kept sample is below the
    /// threshold; the horizon length when none ever is.
    pub global_failure_index: usize,
}

/// Compute per-timestep Pearson correlations between `pred` and `truth`,
/// both `(total_steps * batch * n_nodes, 3)` time-major, flattening each
/// sample's `(n_nodes, 3)` state per timestep. Only the first
/// `batch_limit` batch rows are evaluated.
pub fn pearson_horizon(
    pred: &Array2<f64>,
    truth: &Array2<f64>,
    n_nodes: usize,
    total_steps: usize,
    batch_limit: usize,
    threshold: f64,
) -> HorizonMetrics {
    let batch_nodes = pred.nrows() / total_steps;
    let batch = batch_nodes / n_nodes;
    let kept = batch.min(batch_limit);
    let flat = n_nodes * pred.ncols();

    let mut correlations = Array2::zeros((kept, total_steps));
    for b in 0..kept {
        for t in 0..total_steps {
            let mut xs = Vec::with_capacity(flat);
            let mut ys = Vec::with_capacity(flat);
            for i in 0..n_nodes {
                let row = t * batch_nodes + b * n_nodes + i;
                xs.extend(pred.row(row).iter());
                ys.extend(truth.row(row).iter());
            }
            correlations[[b, t]] = pearson_correlation(&xs, &ys);
        }
    }

    let mut horizon_sum = 0.0;
    for b in 0..kept {
        let horizon = (0..total_steps)
            .find(|&t| correlations[[b, t]] < threshold)
            .unwrap_or(total_steps);
        horizon_sum += horizon as f64;
    }
    let avg_horizon = if kept > 0 {
        horizon_sum / kept as f64
    } else {
        0.0
    };

    let global_failure_index = (0..total_steps)
        .find(|&t| (0..kept).any(|b| correlations[[b, t]] < threshold))
        .unwrap_or(total_steps);

    HorizonMetrics {
        correlations,
        avg_horizon,
        global_failure_index,
    }
}
