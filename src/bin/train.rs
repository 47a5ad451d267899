//! Train an equivariant model on an n-body dataset.
//!
//! Usage:
//! ```bash
//! cargo run --release --bin train -- --data-dir datasets
//! cargo run --release --bin train -- --config configs/exp.json
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use equivariant_nbody::{
    load_json, DatasetConfig, EgnoModel, ExperimentConfig, ModelConfig, NBodyDataset,
    TrainConfig, Trainer,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an equivariant n-body model")]
struct Args {
    /// Experiment name (output subfolder)
    #[arg(long, default_value = "exp_1")]
    exp_name: String,

    /// Folder for the result log and checkpoints
    #[arg(long, default_value = "exp_results")]
    outf: String,

    /// Dataset directory
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Dataset family: nbody or nbody_small
    #[arg(long, default_value = "nbody_small")]
    dataset: String,

    /// Model name (only "egno" is implemented)
    #[arg(long, default_value = "egno")]
    model: String,

    #[arg(long, default_value = "100")]
    batch_size: usize,

    #[arg(long, default_value = "1000")]
    epochs: usize,

    /// Learning rate
    #[arg(long, default_value = "5e-4")]
    lr: f64,

    #[arg(long, default_value = "1e-12")]
    weight_decay: f64,

    /// Hidden width
    #[arg(long, default_value = "64")]
    nf: usize,

    #[arg(long, default_value = "4")]
    n_layers: usize,

    #[arg(long, default_value = "3000")]
    max_training_samples: usize,

    #[arg(long, default_value = "10")]
    num_timesteps: usize,

    #[arg(long, default_value = "1")]
    num_inputs: usize,

    #[arg(long, default_value = "2")]
    num_modes: usize,

    #[arg(long, default_value = "32")]
    time_emb_dim: usize,

    #[arg(long, default_value = "5")]
    test_interval: usize,

    #[arg(long, default_value = "1")]
    seed: u64,

    /// JSON file holding a full experiment configuration; overrides the
    /// individual flags above
    #[arg(long)]
    config: Option<PathBuf>,
}

fn experiment_from_args(args: &Args) -> Result<ExperimentConfig> {
    if let Some(path) = &args.config {
        return load_json(path);
    }
    if args.model != "egno" {
        bail!("unknown model: {}", args.model);
    }

    let mut model = ModelConfig::new(args.nf, args.n_layers)
        .with_num_timesteps(args.num_timesteps)
        .with_num_inputs(args.num_inputs)
        .with_seed(args.seed);
    model.num_modes = args.num_modes;
    model.time_emb_dim = args.time_emb_dim;

    let train = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        weight_decay: args.weight_decay,
        test_interval: args.test_interval,
        outf: args.outf.clone(),
        exp_name: args.exp_name.clone(),
        seed: args.seed,
        ..Default::default()
    };

    let data = DatasetConfig {
        dataset_name: args.dataset.clone(),
        data_dir: args.data_dir.clone(),
        max_samples: args.max_training_samples,
        num_timesteps: args.num_timesteps,
        num_inputs: args.num_inputs,
        ..Default::default()
    };

    Ok(ExperimentConfig { model, train, data })
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let cfg = experiment_from_args(&args)?;

    info!(exp_name = %cfg.train.exp_name, "loading datasets");
    let train_ds = NBodyDataset::new(&cfg.data, "train")?;
    let mut eval_data = cfg.data.clone();
    eval_data.max_samples = usize::MAX;
    let val_ds = NBodyDataset::new(&eval_data, "val")?;
    let test_ds = NBodyDataset::new(&eval_data, "test")?;
    info!(
        train = train_ds.len(),
        val = val_ds.len(),
        test = test_ds.len(),
        "partitions loaded"
    );

    let model = EgnoModel::new(cfg.model.clone());
    info!(parameters = model.num_parameters(), "model created");

    let mut trainer = Trainer::new(model, cfg.train.clone());
    let best = trainer.run(&train_ds, &val_ds, &test_ds)?;

    info!(
        best_train = best.train_loss,
        best_val = best.val_loss,
        best_test = best.test_loss,
        best_epoch = best.epoch,
        avg_horizon = best.avg_horizon,
        "training finished"
    );
    println!(
        "best_train = {:.6}, best_val = {:.6}, best_test = {:.6}, best_epoch = {}",
        best.train_loss, best.val_loss, best.test_loss, best.epoch
    );
    Ok(())
}
