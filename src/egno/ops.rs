//! Segment Reductions and Activations
//!
//! Scatter-style aggregation of per-edge rows into per-node accumulators,
//! keyed by source-node index, plus the scalar nonlinearities shared by the
//! model. Each forward op has a reverse-mode counterpart used by the manual
//! backward passes.

use ndarray::Array2;

/// Sum rows of `data` into `num_segments` accumulators.
///
/// Rows whose segment id never appears leave an all-zero accumulator.
pub fn segment_sum(data: &Array2<f64>, segment_ids: &[usize], num_segments: usize) -> Array2<f64> {
    let dim = data.ncols();
    let mut result = Array2::zeros((num_segments, dim));
    for (e, &seg) in segment_ids.iter().enumerate() {
        for d in 0..dim {
            result[[seg, d]] += data[[e, d]];
        }
    }
    result
}

/// Mean of rows per segment; counts are floored at 1 so empty segments
/// yield zero rather than NaN.
pub fn segment_mean(data: &Array2<f64>, segment_ids: &[usize], num_segments: usize) -> Array2<f64> {
    let dim = data.ncols();
    let mut result = Array2::zeros((num_segments, dim));
    let counts = segment_counts(segment_ids, num_segments);
    for (e, &seg) in segment_ids.iter().enumerate() {
        for d in 0..dim {
            result[[seg, d]] += data[[e, d]];
        }
    }
    for s in 0..num_segments {
        let c = counts[s].max(1) as f64;
        for d in 0..dim {
            result[[s, d]] /= c;
        }
    }
    result
}

/// Rows assigned to each segment.
pub fn segment_counts(segment_ids: &[usize], num_segments: usize) -> Vec<usize> {
    let mut counts = vec![0usize; num_segments];
    for &seg in segment_ids {
        counts[seg] += 1;
    }
    counts
}

/// Backward of `segment_sum`: each contributing row receives its segment's
/// gradient unchanged.
pub fn segment_sum_backward(grad: &Array2<f64>, segment_ids: &[usize]) -> Array2<f64> {
    let dim = grad.ncols();
    let mut out = Array2::zeros((segment_ids.len(), dim));
    for (e, &seg) in segment_ids.iter().enumerate() {
        for d in 0..dim {
            out[[e, d]] = grad[[seg, d]];
        }
    }
    out
}

/// Backward of `segment_mean`: the segment gradient divided by the floored
/// row count flows to each contributing row.
pub fn segment_mean_backward(
    grad: &Array2<f64>,
    segment_ids: &[usize],
    num_segments: usize,
) -> Array2<f64> {
    let counts = segment_counts(segment_ids, num_segments);
    let dim = grad.ncols();
    let mut out = Array2::zeros((segment_ids.len(), dim));
    for (e, &seg) in segment_ids.iter().enumerate() {
        let c = counts[seg].max(1) as f64;
        for d in 0..dim {
            out[[e, d]] = grad[[seg, d]] / c;
        }
    }
    out
}

/// SiLU activation, x * sigmoid(x).
pub fn silu(x: f64) -> f64 {
    x / (1.0 + (-x).exp())
}

/// Derivative of SiLU with respect to its pre-activation.
pub fn silu_prime(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 + x * (1.0 - s))
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_prime(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}
