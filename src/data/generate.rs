//! Synthetic Trajectory Generation
//!
//! Simulates charged particles under softened Coulomb interactions with a
//! kick-drift-kick leapfrog integrator and subsamples the trajectories
//! into the frame arrays the dataset loader expects. Unit masses; charges
//! are random signs.

use ndarray::{s, Array2, Array3, Array4, ArrayD};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;

use anyhow::Result;

use super::npy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub n_balls: usize,

    /// Frames stored per trajectory (after subsampling).
    pub num_frames: usize,

    /// Integrator step.
    pub dt: f64,

    /// Integrator steps per stored frame.
    pub sample_every: usize,

    /// Softening length added to pair distances.
    pub softening: f64,

    pub interaction_strength: f64,

    /// Magnitude of the initial velocities.
    pub initial_vel_norm: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            n_balls: 5,
            num_frames: 140,
            dt: 0.001,
            sample_every: 100,
            softening: 0.1,
            interaction_strength: 1.0,
            initial_vel_norm: 0.5,
        }
    }
}

/// One generated partition: positions and velocities
/// `(samples, frames, n_nodes, 3)`, charges `(samples, n_nodes, 1)`.
pub struct GeneratedPartition {
    pub loc: Array4<f64>,
    pub vel: Array4<f64>,
    pub charges: Array3<f64>,
}

/// Softened Coulomb accelerations; like charges repel.
fn accelerations(
    loc: &Array2<f64>,
    charges: &Array2<f64>,
    cfg: &GeneratorConfig,
) -> Array2<f64> {
    let n = loc.nrows();
    let mut acc = Array2::zeros((n, 3));
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let mut diff = [0.0; 3];
            let mut d2 = cfg.softening * cfg.softening;
            for k in 0..3 {
                diff[k] = loc[[i, k]] - loc[[j, k]];
                d2 += diff[k] * diff[k];
            }
            let inv_d3 = 1.0 / (d2 * d2.sqrt());
            let f = cfg.interaction_strength * charges[[i, 0]] * charges[[j, 0]] * inv_d3;
            for k in 0..3 {
                acc[[i, k]] += f * diff[k];
            }
        }
    }
    acc
}

/// Simulate one trajectory from a random initial state.
pub fn simulate_trajectory(
    cfg: &GeneratorConfig,
    rng: &mut StdRng,
) -> (Array3<f64>, Array3<f64>, Array2<f64>) {
    let n = cfg.n_balls;
    let normal = Normal::new(0.0, 1.0).expect("valid normal");

    let charges = Array2::from_shape_fn((n, 1), |_| if rng.gen::<bool>() { 1.0 } else { -1.0 });
    let mut loc = Array2::from_shape_fn((n, 3), |_| normal.sample(rng));
    let mut vel = Array2::from_shape_fn((n, 3), |_| normal.sample(rng));
    // Rescale initial speeds to a common magnitude.
    for mut row in vel.rows_mut() {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-12);
        for v in row.iter_mut() {
            *v *= cfg.initial_vel_norm / norm;
        }
    }

    let mut loc_frames = Array3::zeros((cfg.num_frames, n, 3));
    let mut vel_frames = Array3::zeros((cfg.num_frames, n, 3));
    loc_frames.slice_mut(s![0, .., ..]).assign(&loc);
    vel_frames.slice_mut(s![0, .., ..]).assign(&vel);

    let half_dt = 0.5 * cfg.dt;
    let mut acc = accelerations(&loc, &charges, cfg);
    for frame in 1..cfg.num_frames {
        for _ in 0..cfg.sample_every {
            // Kick.
            vel = vel + &(half_dt * &acc);
            // Drift.
            loc = loc + &(cfg.dt * &vel);
            // Second kick from the updated positions.
            acc = accelerations(&loc, &charges, cfg);
            vel = vel + &(half_dt * &acc);
        }
        loc_frames.slice_mut(s![frame, .., ..]).assign(&loc);
        vel_frames.slice_mut(s![frame, .., ..]).assign(&vel);
    }

    (loc_frames, vel_frames, charges)
}

/// Generate a full partition of independent trajectories.
pub fn generate_partition(
    cfg: &GeneratorConfig,
    num_samples: usize,
    rng: &mut StdRng,
) -> GeneratedPartition {
    let n = cfg.n_balls;
    let mut loc = Array4::zeros((num_samples, cfg.num_frames, n, 3));
    let mut vel = Array4::zeros((num_samples, cfg.num_frames, n, 3));
    let mut charges = Array3::zeros((num_samples, n, 1));
    for s_i in 0..num_samples {
        let (l, v, q) = simulate_trajectory(cfg, rng);
        loc.slice_mut(s![s_i, .., .., ..]).assign(&l);
        vel.slice_mut(s![s_i, .., .., ..]).assign(&v);
        charges.slice_mut(s![s_i, .., ..]).assign(&q);
    }
    GeneratedPartition { loc, vel, charges }
}

/// Write a partition as the loader's three `.npy` files.
pub fn write_partition(
    dir: impl AsRef<Path>,
    suffix: &str,
    partition: &GeneratedPartition,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let loc: ArrayD<f64> = partition.loc.clone().into_dyn();
    let vel: ArrayD<f64> = partition.vel.clone().into_dyn();
    let charges: ArrayD<f64> = partition.charges.clone().into_dyn();
    npy::write_npy(dir.join(format!("loc_{}.npy", suffix)), &loc)?;
    npy::write_npy(dir.join(format!("vel_{}.npy", suffix)), &vel)?;
    npy::write_npy(dir.join(format!("charges_{}.npy", suffix)), &charges)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn quick_cfg() -> GeneratorConfig {
        GeneratorConfig {
            num_frames: 8,
            sample_every: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_trajectory_shapes_and_finiteness() {
        let cfg = quick_cfg();
        let mut rng = StdRng::seed_from_u64(0);
        let (loc, vel, charges) = simulate_trajectory(&cfg, &mut rng);
        assert_eq!(loc.shape(), &[8, 5, 3]);
        assert_eq!(vel.shape(), &[8, 5, 3]);
        assert_eq!(charges.shape(), &[5, 1]);
        assert!(loc.iter().all(|v| v.is_finite()));
        assert!(vel.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_charges_are_unit_signs() {
        let cfg = quick_cfg();
        let mut rng = StdRng::seed_from_u64(1);
        let (_, _, charges) = simulate_trajectory(&cfg, &mut rng);
        assert!(charges.iter().all(|&q| q == 1.0 || q == -1.0));
    }

    #[test]
    fn test_particles_actually_move() {
        let cfg = quick_cfg();
        let mut rng = StdRng::seed_from_u64(2);
        let (loc, _, _) = simulate_trajectory(&cfg, &mut rng);
        let first = loc.slice(s![0, .., ..]);
        let last = loc.slice(s![7, .., ..]);
        let displacement: f64 = first
            .iter()
            .zip(last.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(displacement > 1e-4);
    }

    #[test]
    fn test_generated_partition_feeds_the_loader() {
        let cfg = GeneratorConfig {
            num_frames: 45,
            sample_every: 2,
            n_balls: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let part = generate_partition(&cfg, 4, &mut rng);

        let ds_cfg = crate::config::DatasetConfig {
            n_balls: 3,
            num_timesteps: 10,
            max_samples: 4,
            ..Default::default()
        };
        let ds = crate::data::NBodyDataset::from_arrays(
            &ds_cfg,
            "train",
            part.loc,
            part.vel,
            part.charges,
        )
        .unwrap();
        assert_eq!(ds.len(), 4);
        let sample = ds.sample(0, 1).unwrap();
        assert!(sample.targets_loc.iter().all(|v| v.is_finite()));
    }
}
