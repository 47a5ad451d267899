//! Generate synthetic charged-particle trajectory partitions.
//!
//! Usage:
//! ```bash
//! cargo run --release --bin generate_dataset -- --data-dir datasets
//! ```

use anyhow::Result;
use clap::Parser;
use equivariant_nbody::data::generate::{generate_partition, write_partition, GeneratorConfig};
use equivariant_nbody::data::file_suffix;
use equivariant_nbody::DatasetConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate synthetic n-body trajectories")]
struct Args {
    /// Output directory for the .npy partitions
    #[arg(long, default_value = "datasets")]
    data_dir: String,

    /// Dataset family the files are named for
    #[arg(long, default_value = "nbody_small")]
    dataset: String,

    #[arg(long, default_value = "5")]
    n_balls: usize,

    #[arg(long, default_value = "3000")]
    num_train: usize,

    #[arg(long, default_value = "2000")]
    num_valid: usize,

    #[arg(long, default_value = "2000")]
    num_test: usize,

    /// Stored frames per trajectory
    #[arg(long, default_value = "140")]
    num_frames: usize,

    /// Integrator steps per stored frame
    #[arg(long, default_value = "100")]
    sample_every: usize,

    /// Integrator step size
    #[arg(long, default_value = "0.001")]
    dt: f64,

    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let gen_cfg = GeneratorConfig {
        n_balls: args.n_balls,
        num_frames: args.num_frames,
        dt: args.dt,
        sample_every: args.sample_every,
        ..Default::default()
    };
    let name_cfg = DatasetConfig {
        dataset_name: args.dataset.clone(),
        n_balls: args.n_balls,
        ..Default::default()
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    for (partition, count) in [
        ("train", args.num_train),
        ("val", args.num_valid),
        ("test", args.num_test),
    ] {
        let suffix = file_suffix(&name_cfg, partition)?;
        info!(partition, count, suffix = %suffix, "simulating trajectories");
        let generated = generate_partition(&gen_cfg, count, &mut rng);
        write_partition(&args.data_dir, &suffix, &generated)?;
    }
    info!(dir = %args.data_dir, "all partitions written");
    Ok(())
}
