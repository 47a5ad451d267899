//! Trajectory Dataset
//!
//! Loads one partition of an n-body dataset from its `.npy` arrays and
//! slices per-sample training windows out of the stored trajectories.
//! The particle count is fixed per dataset; the fully-connected directed
//! edge pairing is built once and replicated per batch graph with
//! `n_nodes * batch_index` offsets.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Array4, Ix3, Ix4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;
use thiserror::Error;

use crate::config::DatasetConfig;

use super::npy;

/// Fail-fast dataset errors.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown dataset name {0}")]
    UnknownDataset(String),

    #[error("unknown partition {0}")]
    UnknownPartition(String),

    #[error("dataset layout mismatch: expected trailing dims ({expected}, 3), got {got:?}")]
    ShapeMismatch { expected: usize, got: Vec<usize> },

    #[error("trajectory too short: need {needed} frames, stored {stored}")]
    TooFewFrames { needed: usize, stored: usize },
}

/// One training sample sliced out of a stored trajectory.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Latest input frame, `(n_nodes, 3)`.
    pub loc: Array2<f64>,
    pub vel: Array2<f64>,

    /// All input frames, `(num_inputs, n_nodes, 3)`.
    pub loc_inputs: Array3<f64>,
    pub vel_inputs: Array3<f64>,

    /// Charge product per directed edge, `(n_edges, 1)`.
    pub edge_attr: Array2<f64>,

    /// Target positions, time-major `(windows * num_timesteps, n_nodes, 3)`.
    pub targets_loc: Array3<f64>,
}

/// A collated mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Latest positions, `(batch * n_nodes, 3)`.
    pub loc: Array2<f64>,
    pub vel: Array2<f64>,

    /// Velocities of each input frame, each `(batch * n_nodes, 3)`.
    pub vel_inputs: Vec<Array2<f64>>,

    /// Charge products, `(batch * n_edges, 1)`.
    pub charge_attr: Array2<f64>,

    /// Target positions, `(windows * num_timesteps * batch * n_nodes, 3)`,
    /// time-major.
    pub targets_loc: Array2<f64>,

    pub batch_size: usize,
}

/// One partition of the n-body dataset.
pub struct NBodyDataset {
    pub partition: String,
    cfg: DatasetConfig,
    loc: Array4<f64>,
    vel: Array4<f64>,
    charges: Array3<f64>,
    edge_attr: Array3<f64>,
    rows: Vec<usize>,
    cols: Vec<usize>,
    frame_0: usize,
}

impl NBodyDataset {
    /// Load a partition from `cfg.data_dir`.
    pub fn new(cfg: &DatasetConfig, partition: &str) -> Result<Self> {
        let suffix = file_suffix(cfg, partition)?;
        let dir = Path::new(&cfg.data_dir);
        let loc = npy::read_npy(dir.join(format!("loc_{}.npy", suffix)))?;
        let vel = npy::read_npy(dir.join(format!("vel_{}.npy", suffix)))?;
        let charges = npy::read_npy(dir.join(format!("charges_{}.npy", suffix)))?;

        let loc = loc.into_dimensionality::<Ix4>()?;
        let vel = vel.into_dimensionality::<Ix4>()?;
        let charges = charges.into_dimensionality::<Ix3>()?;
        Self::from_arrays(cfg, partition, loc, vel, charges)
    }

    /// Build a partition from in-memory arrays (generator output, tests).
    pub fn from_arrays(
        cfg: &DatasetConfig,
        partition: &str,
        mut loc: Array4<f64>,
        mut vel: Array4<f64>,
        charges: Array3<f64>,
    ) -> Result<Self> {
        let n = cfg.n_balls;
        let frame_0 = start_frame(&cfg.dataset_name)?;

        // On-disk layout may carry (…, 3, n_nodes); transpose if so.
        if loc.shape()[2] == 3 && loc.shape()[3] == n && n != 3 {
            loc = loc
                .permuted_axes([0, 1, 3, 2])
                .as_standard_layout()
                .to_owned();
            vel = vel
                .permuted_axes([0, 1, 3, 2])
                .as_standard_layout()
                .to_owned();
        }
        if loc.shape()[2] != n || loc.shape()[3] != 3 {
            return Err(DataError::ShapeMismatch {
                expected: n,
                got: loc.shape().to_vec(),
            }
            .into());
        }

        let max_samples = cfg.max_samples.min(loc.shape()[0]);
        let loc = loc.slice(s![0..max_samples, .., .., ..]).to_owned();
        let vel = vel.slice(s![0..max_samples, .., .., ..]).to_owned();
        let charges = charges.slice(s![0..max_samples, .., ..]).to_owned();

        let needed = frame_0 + cfg.num_timesteps + 1;
        if loc.shape()[1] < needed {
            return Err(DataError::TooFewFrames {
                needed,
                stored: loc.shape()[1],
            }
            .into());
        }

        // Fully-connected directed pairing, no self loops.
        let mut rows = Vec::with_capacity(n * (n - 1));
        let mut cols = Vec::with_capacity(n * (n - 1));
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    rows.push(i);
                    cols.push(j);
                }
            }
        }

        // Per-edge charge products.
        let num_samples = loc.shape()[0];
        let mut edge_attr = Array3::zeros((num_samples, rows.len(), 1));
        for s_i in 0..num_samples {
            for (e, (&i, &j)) in rows.iter().zip(cols.iter()).enumerate() {
                edge_attr[[s_i, e, 0]] = charges[[s_i, i, 0]] * charges[[s_i, j, 0]];
            }
        }

        Ok(Self {
            partition: partition.to_string(),
            cfg: cfg.clone(),
            loc,
            vel,
            charges,
            edge_attr,
            rows,
            cols,
            frame_0,
        })
    }

    pub fn len(&self) -> usize {
        self.loc.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_nodes(&self) -> usize {
        self.cfg.n_balls
    }

    pub fn num_edges(&self) -> usize {
        self.rows.len()
    }

    pub fn num_frames(&self) -> usize {
        self.loc.shape()[1]
    }

    pub fn charges(&self, idx: usize) -> Array2<f64> {
        self.charges.slice(s![idx, .., ..]).to_owned()
    }

    /// Edge index replicated for `batch_size` graphs, each block offset by
    /// `n_nodes * batch_index`.
    pub fn get_edges(&self, batch_size: usize) -> (Vec<usize>, Vec<usize>) {
        let n = self.n_nodes();
        let mut rows = Vec::with_capacity(batch_size * self.rows.len());
        let mut cols = Vec::with_capacity(batch_size * self.cols.len());
        for b in 0..batch_size {
            rows.extend(self.rows.iter().map(|&r| r + b * n));
            cols.extend(self.cols.iter().map(|&c| c + b * n));
        }
        (rows, cols)
    }

    /// Slice one sample. `windows` is 1 for single-window training and
    /// `traj_len` for rollout evaluation, concatenating consecutive
    /// windows along the time axis.
    pub fn sample(&self, idx: usize, windows: usize) -> Result<Sample> {
        let t_n = self.cfg.num_timesteps;
        let n = self.n_nodes();
        let delta_frame = t_n;

        let last_needed = self.frame_0 + windows * t_n;
        if self.num_frames() <= last_needed {
            return Err(DataError::TooFewFrames {
                needed: last_needed + 1,
                stored: self.num_frames(),
            }
            .into());
        }

        let mut targets = Array3::zeros((windows * t_n, n, 3));
        for w in 0..windows {
            let f0 = self.frame_0 + w * t_n;
            for ii in 1..=t_n {
                let frame = f0 + delta_frame * ii / t_n;
                targets
                    .slice_mut(s![w * t_n + ii - 1, .., ..])
                    .assign(&self.loc.slice(s![idx, frame, .., ..]));
            }
        }

        let ni = self.cfg.num_inputs.max(1);
        let input_offsets: Vec<usize> = if ni == 1 {
            vec![0]
        } else {
            (0..ni).map(|j| j * (t_n - 1) / (ni - 1)).collect()
        };
        let mut loc_inputs = Array3::zeros((ni, n, 3));
        let mut vel_inputs = Array3::zeros((ni, n, 3));
        for (j, &off) in input_offsets.iter().enumerate() {
            loc_inputs
                .slice_mut(s![j, .., ..])
                .assign(&self.loc.slice(s![idx, self.frame_0 + off, .., ..]));
            vel_inputs
                .slice_mut(s![j, .., ..])
                .assign(&self.vel.slice(s![idx, self.frame_0 + off, .., ..]));
        }
        let latest = self.frame_0 + input_offsets[ni - 1];

        Ok(Sample {
            loc: self.loc.slice(s![idx, latest, .., ..]).to_owned(),
            vel: self.vel.slice(s![idx, latest, .., ..]).to_owned(),
            loc_inputs,
            vel_inputs,
            edge_attr: self.edge_attr.slice(s![idx, .., ..]).to_owned(),
            targets_loc: targets,
        })
    }

    /// Collate samples into one batch with time-major targets.
    pub fn collate(&self, indices: &[usize], windows: usize) -> Result<Batch> {
        let b = indices.len();
        let n = self.n_nodes();
        let e = self.num_edges();
        let t_total = windows * self.cfg.num_timesteps;
        let ni = self.cfg.num_inputs.max(1);

        let mut loc = Array2::zeros((b * n, 3));
        let mut vel = Array2::zeros((b * n, 3));
        let mut vel_inputs = vec![Array2::zeros((b * n, 3)); ni];
        let mut charge_attr = Array2::zeros((b * e, 1));
        let mut targets = Array2::zeros((t_total * b * n, 3));

        for (bi, &idx) in indices.iter().enumerate() {
            let sample = self.sample(idx, windows)?;
            loc.slice_mut(s![bi * n..(bi + 1) * n, ..])
                .assign(&sample.loc);
            vel.slice_mut(s![bi * n..(bi + 1) * n, ..])
                .assign(&sample.vel);
            for j in 0..ni {
                vel_inputs[j]
                    .slice_mut(s![bi * n..(bi + 1) * n, ..])
                    .assign(&sample.vel_inputs.slice(s![j, .., ..]));
            }
            charge_attr
                .slice_mut(s![bi * e..(bi + 1) * e, ..])
                .assign(&sample.edge_attr);
            for t in 0..t_total {
                targets
                    .slice_mut(s![t * b * n + bi * n..t * b * n + (bi + 1) * n, ..])
                    .assign(&sample.targets_loc.slice(s![t, .., ..]));
            }
        }

        Ok(Batch {
            loc,
            vel,
            vel_inputs,
            charge_attr,
            targets_loc: targets,
            batch_size: b,
        })
    }

    /// Index groups for one epoch; shuffles when an RNG is supplied and
    /// drops the ragged tail when `drop_last`.
    pub fn batch_indices(
        &self,
        batch_size: usize,
        rng: Option<&mut StdRng>,
        drop_last: bool,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        let mut out: Vec<Vec<usize>> = order
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        if drop_last {
            out.retain(|chunk| chunk.len() == batch_size);
        }
        out
    }
}

/// File suffix for a partition's `.npy` arrays, e.g.
/// `valid_charged5_initvel1small`.
pub fn file_suffix(cfg: &DatasetConfig, partition: &str) -> Result<String> {
    let base = match partition {
        "train" => "train",
        "val" => "valid",
        "test" => "test",
        other => return Err(DataError::UnknownPartition(other.to_string()).into()),
    };
    let suffix = match cfg.dataset_name.as_str() {
        "nbody" => format!("{}_{}{}_initvel1", base, cfg.dataset, cfg.n_balls),
        "nbody_small" | "nbody_small_out_dist" => {
            format!("{}_{}{}_initvel1small", base, cfg.dataset, cfg.n_balls)
        }
        other => return Err(DataError::UnknownDataset(other.to_string()).into()),
    };
    Ok(suffix)
}

fn start_frame(dataset_name: &str) -> Result<usize> {
    match dataset_name {
        "nbody" => Ok(6),
        "nbody_small" => Ok(30),
        "nbody_small_out_dist" => Ok(20),
        other => Err(DataError::UnknownDataset(other.to_string()).into()),
    }
}
