//! Autoregressive Rollout
//!
//! Repeated application of a trained model: each step emits the model's
//! `num_timesteps` internal frames and feeds only the last sub-step's
//! position/velocity (with refreshed node features, edge attributes, and
//! mean-centering offset) into the next call. The sequence is a lazy,
//! finite, restartable iterator over prediction windows.

use anyhow::Result;
use ndarray::{s, Array2};

use crate::egno::{EgnoModel, ModelInput};

use super::{edge_features, graph_mean, velocity_magnitudes};

/// Position/velocity state fed between rollout steps.
#[derive(Debug, Clone)]
pub struct RolloutState {
    pub loc: Array2<f64>,
    pub vel: Array2<f64>,
}

/// Lazy rollout over `traj_len` model calls.
pub struct Rollout<'a> {
    model: &'a mut EgnoModel,
    charge_attr: &'a Array2<f64>,
    rows: &'a [usize],
    cols: &'a [usize],
    n_nodes: usize,
    initial: RolloutState,
    state: RolloutState,
    remaining: usize,
    traj_len: usize,
}

impl<'a> Rollout<'a> {
    pub fn new(
        model: &'a mut EgnoModel,
        initial: RolloutState,
        charge_attr: &'a Array2<f64>,
        rows: &'a [usize],
        cols: &'a [usize],
        n_nodes: usize,
        traj_len: usize,
    ) -> Self {
        Self {
            model,
            charge_attr,
            rows,
            cols,
            n_nodes,
            state: initial.clone(),
            initial,
            remaining: traj_len,
            traj_len,
        }
    }

    /// Rewind to the initial state.
    pub fn restart(&mut self) {
        self.state = self.initial.clone();
        self.remaining = self.traj_len;
    }

    /// Advance the held state by one model call and return that call's
    /// predicted window, `(num_timesteps * batch * n_nodes, 3)`.
    fn advance(&mut self) -> Result<Array2<f64>> {
        let channels = self.model.config().in_node_nf;
        let nodes = velocity_magnitudes(std::slice::from_ref(&self.state.vel), channels);
        let edge_attr = edge_features(self.charge_attr, &self.state.loc, self.rows, self.cols);
        let loc_mean = graph_mean(&self.state.loc, self.n_nodes);

        let (loc_pred, vel_pred, _) = self.model.forward(&ModelInput {
            loc: &self.state.loc,
            nodes: &nodes,
            rows: self.rows,
            cols: self.cols,
            edge_attr: &edge_attr,
            vel: &self.state.vel,
            loc_mean: &loc_mean,
        })?;

        // Only the last internal sub-step survives as the next input.
        let base_rows = self.state.loc.nrows();
        let t_n = loc_pred.nrows() / base_rows;
        let last = s![(t_n - 1) * base_rows..t_n * base_rows, ..];
        self.state.loc = loc_pred.slice(last).to_owned();
        self.state.vel = vel_pred.slice(last).to_owned();

        Ok(loc_pred)
    }

    /// Run all remaining steps and stack the windows time-major,
    /// `(traj_len * num_timesteps * batch * n_nodes, 3)`.
    pub fn run(&mut self) -> Result<Array2<f64>> {
        let mut windows = Vec::with_capacity(self.remaining);
        for window in &mut *self {
            windows.push(window?);
        }
        let total: usize = windows.iter().map(|w| w.nrows()).sum();
        let cols = windows.first().map_or(3, |w| w.ncols());
        let mut out = Array2::zeros((total, cols));
        let mut offset = 0;
        for w in windows {
            out.slice_mut(s![offset..offset + w.nrows(), ..]).assign(&w);
            offset += w.nrows();
        }
        Ok(out)
    }
}

impl Iterator for Rollout<'_> {
    type Item = Result<Array2<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.advance())
    }
}
