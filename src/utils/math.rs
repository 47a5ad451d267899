//! Math Utilities

use ndarray::Array2;
use thiserror::Error;

/// Raised when a tensor picks up NaN/Inf values.
#[derive(Debug, Error)]
#[error("non-finite value in {0}")]
pub struct NonFiniteError(pub &'static str);

/// Fail fast when `a` contains NaN or Inf; `tag` names the tensor in the
/// error.
pub fn ensure_finite(tag: &'static str, a: &Array2<f64>) -> Result<(), NonFiniteError> {
    if a.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(NonFiniteError(tag))
    }
}

/// Calculate Pearson correlation between two equal-length series.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = x.iter().take(n).sum::<f64>() / n as f64;
    let mean_y = y.iter().take(n).sum::<f64>() / n as f64;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let (dx, dy) = (x[i] - mean_x, y[i] - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let denom = (var_x * var_y).sqrt();
    if denom < 1e-10 {
        0.0
    } else {
        cov / denom
    }
}
