//! # Equivariant N-Body Trajectory Prediction
//!
//! Research training pipelines for E(n)-equivariant graph neural
//! operators predicting charged-particle trajectories. The model passes
//! messages over a fixed fully-connected particle graph and emits a whole
//! window of future frames per forward call; training runs real gradient
//! descent through hand-written reverse-mode passes on `ndarray`.
//!
//! ## Architecture
//!
//! - `egno`: the equivariant layer family, temporal spectral convolution,
//!   and the stacked model
//! - `data`: `.npy` trajectory partitions, batching, and the synthetic
//!   charged-particle generator
//! - `train`: epoch loops, early stopping, autoregressive rollout, and
//!   the Pearson prediction-horizon metric
//! - `optim`: Adam/SGD over the model's flat parameter slices
//! - `config`: immutable configuration passed into every constructor
//!
//! ## Example
//!
//! ```rust,no_run
//! use equivariant_nbody::{
//!     DatasetConfig, EgnoModel, ModelConfig, NBodyDataset, TrainConfig, Trainer,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let data_cfg = DatasetConfig::default();
//!     let train_ds = NBodyDataset::new(&data_cfg, "train")?;
//!     let val_ds = NBodyDataset::new(&data_cfg, "val")?;
//!     let test_ds = NBodyDataset::new(&data_cfg, "test")?;
//!
//!     let model = EgnoModel::new(ModelConfig::default());
//!     let mut trainer = Trainer::new(model, TrainConfig::default());
//!     let best = trainer.run(&train_ds, &val_ds, &test_ds)?;
//!     println!("best val loss {:.6} at epoch {}", best.val_loss, best.epoch);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data;
pub mod egno;
pub mod optim;
pub mod train;
pub mod utils;

// Re-export commonly used types
pub use config::{
    DatasetConfig, ExperimentConfig, LayerVariant, ModelConfig, RbfConfig, TrainConfig,
};
pub use data::{Batch, DataError, NBodyDataset, Sample};
pub use egno::{EgnoModel, EquivariantLayer, ModelInput, RbfExpansion};
pub use optim::{Adam, Optimizer, Sgd};
pub use train::{
    pearson_horizon, BestResult, EarlyStopping, HorizonMetrics, Rollout, RolloutState, Trainer,
};
pub use utils::{load_json, save_json};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
