//! Configuration
//!
//! Immutable configuration structures passed into each component's
//! constructor. Defaults mirror the reference hyperparameters for the
//! small charged five-body benchmark.

use serde::{Deserialize, Serialize};

/// Behavior of the equivariant layer's coordinate/velocity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerVariant {
    /// Position update only: `x' = x + mean_agg * coords_weight`.
    Basic,
    /// One integrator sub-step per layer:
    /// `v' = v + agg * coords_weight / n_layers`, `x' = x + v' / n_layers`.
    VelocityIntegrator,
}

/// Radial basis grid parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RbfConfig {
    pub low: f64,
    pub high: f64,
    pub gap: f64,
}

impl Default for RbfConfig {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 30.0,
            gap: 0.1,
        }
    }
}

/// Configuration for the stacked equivariant model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Scalar node feature channels (velocity magnitudes; equals the
    /// number of input frames).
    pub in_node_nf: usize,

    /// External edge attribute channels (charge product + initial
    /// squared distance).
    pub in_edge_nf: usize,

    /// External node attribute channels appended to the node model input
    /// (0 for the n-body pipeline).
    pub nodes_att_dim: usize,

    /// Hidden width.
    pub hidden_nf: usize,

    /// Number of message-passing layers.
    pub n_layers: usize,

    /// Coordinate/velocity update behavior.
    pub variant: LayerVariant,

    /// Gate edge messages with a learned sigmoid attention weight.
    pub attention: bool,

    /// Residual node update (`h' = h + mlp(...)`).
    pub recurrent: bool,

    /// Normalize coordinate differences by `sqrt(radial) + 1`.
    pub norm_diff: bool,

    /// Normalize the relative velocity in the velocity-cosine radial term.
    pub norm_vel: bool,

    /// Scale on the aggregated coordinate update.
    pub coords_weight: f64,

    /// Future frames emitted per forward pass.
    pub num_timesteps: usize,

    /// Sinusoidal time-encoding width.
    pub time_emb_dim: usize,

    /// Retained temporal Fourier modes; 0 disables the temporal
    /// convolution entirely.
    pub num_modes: usize,

    /// Apply the temporal convolution between layers.
    pub use_time_conv: bool,

    /// Historical input frames.
    pub num_inputs: usize,

    /// Check tensors for NaN/Inf at layer boundaries and fail with a
    /// typed error instead of propagating silently.
    pub check_finite: bool,

    /// Radial basis grid (constructed by every layer; see DESIGN.md).
    pub rbf: RbfConfig,

    /// Parameter initialization seed.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_node_nf: 1,
            in_edge_nf: 2,
            nodes_att_dim: 0,
            hidden_nf: 64,
            n_layers: 4,
            variant: LayerVariant::VelocityIntegrator,
            attention: false,
            recurrent: true,
            norm_diff: false,
            norm_vel: true,
            coords_weight: 1.0,
            num_timesteps: 10,
            time_emb_dim: 32,
            num_modes: 2,
            use_time_conv: true,
            num_inputs: 1,
            check_finite: true,
            rbf: RbfConfig::default(),
            seed: 1,
        }
    }
}

impl ModelConfig {
    pub fn new(hidden_nf: usize, n_layers: usize) -> Self {
        Self {
            hidden_nf,
            n_layers,
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: LayerVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_attention(mut self, attention: bool) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_num_timesteps(mut self, t: usize) -> Self {
        self.num_timesteps = t;
        self
    }

    pub fn with_num_inputs(mut self, n: usize) -> Self {
        self.num_inputs = n.max(1);
        self.in_node_nf = n.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Configuration for the training/evaluation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,

    /// Validate/test every this many epochs.
    pub test_interval: usize,

    /// Epochs without validation improvement before stopping.
    pub patience: usize,

    /// Autoregressive rollout length (model calls) for test evaluation.
    pub traj_len: usize,

    /// Leading timesteps of the rollout used for the reported MSE.
    pub rollout_loss_steps: usize,

    /// Batch rows kept for the correlation metric.
    pub corr_batch_limit: usize,

    /// Correlation threshold defining the prediction horizon.
    pub corr_threshold: f64,

    /// Output folder for checkpoints and the result log.
    pub outf: String,

    /// Experiment name (subfolder of `outf`).
    pub exp_name: String,

    /// Shuffle seed for train batches.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1000,
            batch_size: 100,
            lr: 5e-4,
            weight_decay: 1e-12,
            test_interval: 5,
            patience: 50,
            traj_len: 10,
            rollout_loss_steps: 20,
            corr_batch_limit: 25,
            corr_threshold: 0.5,
            outf: "exp_results".to_string(),
            exp_name: "exp_1".to_string(),
            seed: 1,
        }
    }
}

/// Which stored dataset to load and how to slice it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset family: "nbody" or "nbody_small".
    pub dataset_name: String,

    /// Interaction kind encoded in the file suffix, e.g. "charged".
    pub dataset: String,

    pub data_dir: String,
    pub n_balls: usize,
    pub max_samples: usize,
    pub num_timesteps: usize,
    pub num_inputs: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_name: "nbody_small".to_string(),
            dataset: "charged".to_string(),
            data_dir: ".".to_string(),
            n_balls: 5,
            max_samples: 3000,
            num_timesteps: 10,
            num_inputs: 1,
        }
    }
}

/// A full experiment: model, training, and dataset configuration,
/// loadable from one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub data: DatasetConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_hyperparameters() {
        let m = ModelConfig::default();
        assert_eq!(m.hidden_nf, 64);
        assert_eq!(m.n_layers, 4);
        assert_eq!(m.num_timesteps, 10);
        assert_eq!(m.num_modes, 2);

        let t = TrainConfig::default();
        assert_eq!(t.batch_size, 100);
        assert_eq!(t.patience, 50);
        assert_eq!(t.corr_batch_limit, 25);
        assert_eq!(t.rollout_loss_steps, 20);
        assert!((t.lr - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_num_inputs_sets_node_channels() {
        let m = ModelConfig::default().with_num_inputs(3);
        assert_eq!(m.in_node_nf, 3);
        assert_eq!(m.num_inputs, 3);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let m = ModelConfig::default().with_attention(true);
        let s = serde_json::to_string(&m).unwrap();
        let back: ModelConfig = serde_json::from_str(&s).unwrap();
        assert!(back.attention);
        assert_eq!(back.hidden_nf, m.hidden_nf);
    }
}
