//! Evaluate a trained checkpoint with autoregressive rollout.
//!
//! Usage:
//! ```bash
//! cargo run --release --bin evaluate -- \
//!     --checkpoint exp_results/exp_1/saved_model.json --data-dir datasets
//! ```

use anyhow::Result;
use clap::Parser;
use equivariant_nbody::{
    load_json, DatasetConfig, EgnoModel, NBodyDataset, TrainConfig, Trainer,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rollout evaluation of a trained model")]
struct Args {
    /// Trained model checkpoint (JSON)
    #[arg(long)]
    checkpoint: PathBuf,

    /// Dataset directory
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Dataset family: nbody or nbody_small
    #[arg(long, default_value = "nbody_small")]
    dataset: String,

    /// Partition to evaluate
    #[arg(long, default_value = "test")]
    partition: String,

    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Rollout length in model calls
    #[arg(long, default_value = "10")]
    traj_len: usize,

    /// Leading timesteps used for the reported MSE
    #[arg(long, default_value = "20")]
    rollout_loss_steps: usize,

    /// Batch rows kept for the correlation metric
    #[arg(long, default_value = "25")]
    corr_batch_limit: usize,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let model: EgnoModel = load_json(&args.checkpoint)?;
    info!(
        checkpoint = %args.checkpoint.display(),
        parameters = model.num_parameters(),
        "checkpoint loaded"
    );

    let data_cfg = DatasetConfig {
        dataset_name: args.dataset.clone(),
        data_dir: args.data_dir.clone(),
        max_samples: usize::MAX,
        num_timesteps: model.config().num_timesteps,
        num_inputs: model.config().num_inputs,
        ..Default::default()
    };
    let ds = NBodyDataset::new(&data_cfg, &args.partition)?;
    info!(partition = %args.partition, samples = ds.len(), "dataset loaded");

    let train_cfg = TrainConfig {
        batch_size: args.batch_size,
        traj_len: args.traj_len,
        rollout_loss_steps: args.rollout_loss_steps,
        corr_batch_limit: args.corr_batch_limit,
        ..Default::default()
    };
    let mut trainer = Trainer::new(model, train_cfg);
    let (loss, avg_horizon) = trainer.rollout_epoch(&ds)?;

    info!(loss, avg_horizon, "rollout evaluation complete");
    println!(
        "rollout loss = {:.6}, avg prediction horizon = {:.3} steps",
        loss, avg_horizon
    );
    Ok(())
}
