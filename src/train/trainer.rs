//! Training and Evaluation Loop
//!
//! Epoch driver over the three partitions: gradient steps on train,
//! plain evaluation on val, and rollout evaluation with the Pearson
//! horizon metric on test. Validation loss drives early stopping and
//! best-model checkpointing; every epoch rewrites the experiment's JSON
//! result log.

use anyhow::Result;
use ndarray::{s, Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::data::NBodyDataset;
use crate::egno::{EgnoModel, ModelInput};
use crate::optim::{Adam, Optimizer};
use crate::utils::io::save_json;

use super::metrics::pearson_horizon;
use super::rollout::{Rollout, RolloutState};
use super::{edge_features, graph_mean, velocity_magnitudes};

/// Per-experiment result log, rewritten after every epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingResults {
    #[serde(rename = "eval epoch")]
    pub eval_epoch: Vec<usize>,
    #[serde(rename = "train loss")]
    pub train_loss: Vec<f64>,
    #[serde(rename = "val loss")]
    pub val_loss: Vec<f64>,
    #[serde(rename = "test loss")]
    pub test_loss: Vec<f64>,
}

/// Best epoch summary returned by a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestResult {
    pub train_loss: f64,
    pub val_loss: f64,
    pub test_loss: f64,
    pub avg_horizon: f64,
    pub epoch: usize,
}

/// Halts training after `patience` evaluations without validation
/// improvement; the best model is checkpointed on every improvement.
pub struct EarlyStopping {
    patience: usize,
    counter: usize,
    best: Option<f64>,
    path: PathBuf,
    pub early_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            patience,
            counter: 0,
            best: None,
            path: path.into(),
            early_stop: false,
        }
    }

    pub fn step(&mut self, val_loss: f64, model: &EgnoModel) -> Result<()> {
        let improved = self.best.map_or(true, |b| val_loss < b);
        if improved {
            self.best = Some(val_loss);
            self.counter = 0;
            save_json(model, &self.path)?;
        } else {
            self.counter += 1;
            if self.counter >= self.patience {
                self.early_stop = true;
            }
        }
        Ok(())
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

pub struct Trainer {
    model: EgnoModel,
    optimizer: Adam,
    cfg: TrainConfig,
    shuffle_rng: StdRng,
}

impl Trainer {
    pub fn new(model: EgnoModel, cfg: TrainConfig) -> Self {
        let optimizer = Adam::new(cfg.lr).with_weight_decay(cfg.weight_decay);
        let shuffle_rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            model,
            optimizer,
            cfg,
            shuffle_rng,
        }
    }

    pub fn model(&self) -> &EgnoModel {
        &self.model
    }

    pub fn into_model(self) -> EgnoModel {
        self.model
    }

    /// One gradient-descent epoch. The reported scalar is the last
    /// timestep's loss; the optimized objective is the timestep mean.
    pub fn train_epoch(&mut self, ds: &NBodyDataset) -> Result<f64> {
        self.run_plain_epoch(ds, true)
    }

    /// One evaluation epoch without parameter updates.
    pub fn eval_epoch(&mut self, ds: &NBodyDataset) -> Result<f64> {
        self.run_plain_epoch(ds, false)
    }

    fn run_plain_epoch(&mut self, ds: &NBodyDataset, backprop: bool) -> Result<f64> {
        let t_n = self.model.config().num_timesteps;
        let channels = self.model.config().in_node_nf;
        let batches = if backprop {
            ds.batch_indices(self.cfg.batch_size, Some(&mut self.shuffle_rng), true)
        } else {
            ds.batch_indices(self.cfg.batch_size, None, false)
        };

        let mut total = 0.0;
        let mut counter = 0usize;
        for indices in batches {
            let batch = ds.collate(&indices, 1)?;
            let (rows, cols) = ds.get_edges(batch.batch_size);
            let nodes = velocity_magnitudes(&batch.vel_inputs, channels);
            let edge_attr = edge_features(&batch.charge_attr, &batch.loc, &rows, &cols);
            let loc_mean = graph_mean(&batch.loc, ds.n_nodes());

            if backprop {
                self.model.zero_grad();
            }
            let (pred, _, _) = self.model.forward(&ModelInput {
                loc: &batch.loc,
                nodes: &nodes,
                rows: &rows,
                cols: &cols,
                edge_attr: &edge_attr,
                vel: &batch.vel,
                loc_mean: &loc_mean,
            })?;

            let losses = mse_per_timestep(&pred, &batch.targets_loc, t_n);
            if backprop {
                let scale = 2.0 / pred.len() as f64;
                let d_pred = scale * &(&pred - &batch.targets_loc);
                self.model.backward(&d_pred, None);
                self.optimizer.step(&mut self.model.param_grads());
            }

            total += losses[t_n - 1] * batch.batch_size as f64;
            counter += batch.batch_size;
        }
        Ok(total / counter.max(1) as f64)
    }

    /// Rollout evaluation: autoregressive prediction over `traj_len`
    /// windows, truncated-window MSE, and the averaged horizon metric.
    pub fn rollout_epoch(&mut self, ds: &NBodyDataset) -> Result<(f64, f64)> {
        let t_n = self.model.config().num_timesteps;
        let traj_len = self.cfg.traj_len;
        let total_steps = traj_len * t_n;
        let n = ds.n_nodes();

        let mut total_loss = 0.0;
        let mut total_horizon = 0.0;
        let mut counter = 0usize;
        for indices in ds.batch_indices(self.cfg.batch_size, None, false) {
            let batch = ds.collate(&indices, traj_len)?;
            let (rows, cols) = ds.get_edges(batch.batch_size);

            let state = RolloutState {
                loc: batch.loc.clone(),
                vel: batch.vel.clone(),
            };
            let mut rollout = Rollout::new(
                &mut self.model,
                state,
                &batch.charge_attr,
                &rows,
                &cols,
                n,
                traj_len,
            );
            let preds = rollout.run()?;

            let metrics = pearson_horizon(
                &preds,
                &batch.targets_loc,
                n,
                total_steps,
                self.cfg.corr_batch_limit,
                self.cfg.corr_threshold,
            );

            debug!(
                avg_horizon = metrics.avg_horizon,
                global_failure_index = metrics.global_failure_index,
                "rollout batch horizon"
            );

            let keep = self.cfg.rollout_loss_steps.min(total_steps);
            let keep_rows = keep * batch.batch_size * n;
            let losses = mse_per_timestep(
                &preds.slice(s![0..keep_rows, ..]).to_owned(),
                &batch.targets_loc.slice(s![0..keep_rows, ..]).to_owned(),
                keep,
            );
            let loss = losses.sum() / keep as f64;

            total_loss += loss * batch.batch_size as f64;
            total_horizon += metrics.avg_horizon * batch.batch_size as f64;
            counter += batch.batch_size;
        }
        let c = counter.max(1) as f64;
        Ok((total_loss / c, total_horizon / c))
    }

    /// Full training run with periodic evaluation, early stopping, and
    /// result logging. Returns the best-epoch summary.
    pub fn run(
        &mut self,
        train_ds: &NBodyDataset,
        val_ds: &NBodyDataset,
        test_ds: &NBodyDataset,
    ) -> Result<BestResult> {
        let exp_dir = Path::new(&self.cfg.outf).join(&self.cfg.exp_name);
        std::fs::create_dir_all(&exp_dir)?;
        let ckpt_path = exp_dir.join("saved_model.json");
        let results_path = exp_dir.join("loss.json");

        let mut early_stopping = EarlyStopping::new(self.cfg.patience, &ckpt_path);
        let mut results = TrainingResults::default();
        let mut best = BestResult {
            train_loss: f64::MAX,
            val_loss: f64::MAX,
            test_loss: f64::MAX,
            avg_horizon: 0.0,
            epoch: 0,
        };

        for epoch in 0..self.cfg.epochs {
            let train_loss = self.train_epoch(train_ds)?;
            results.train_loss.push(train_loss);
            info!(partition = "train", epoch, loss = train_loss);

            if epoch % self.cfg.test_interval == 0 {
                let val_loss = self.eval_epoch(val_ds)?;
                let (test_loss, avg_horizon) = self.rollout_epoch(test_ds)?;
                results.eval_epoch.push(epoch);
                results.val_loss.push(val_loss);
                results.test_loss.push(test_loss);
                info!(partition = "val", epoch, loss = val_loss);
                info!(partition = "test", epoch, loss = test_loss, avg_horizon);

                if val_loss < best.val_loss {
                    best = BestResult {
                        train_loss,
                        val_loss,
                        test_loss,
                        avg_horizon,
                        epoch,
                    };
                }
                info!(
                    best_val = best.val_loss,
                    best_test = best.test_loss,
                    best_epoch = best.epoch,
                    "best so far"
                );

                early_stopping.step(val_loss, &self.model)?;
                if early_stopping.early_stop {
                    info!(epoch, "early stopping");
                    break;
                }
            }

            save_json(&results, &results_path)?;
        }
        save_json(&results, &results_path)?;

        Ok(best)
    }
}

/// Per-timestep MSE: mean over batch rows and the three axes.
pub fn mse_per_timestep(pred: &Array2<f64>, target: &Array2<f64>, t_n: usize) -> Array1<f64> {
    let rows_per_step = pred.nrows() / t_n;
    let mut losses = Array1::zeros(t_n);
    for t in 0..t_n {
        let p = pred.slice(s![t * rows_per_step..(t + 1) * rows_per_step, ..]);
        let y = target.slice(s![t * rows_per_step..(t + 1) * rows_per_step, ..]);
        let mut acc = 0.0;
        for (a, b) in p.iter().zip(y.iter()) {
            let d = a - b;
            acc += d * d;
        }
        losses[t] = acc / (p.len() as f64);
    }
    losses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, LayerVariant, ModelConfig};
    use crate::data::generate::{generate_partition, GeneratorConfig};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_mse_per_timestep() {
        let pred = array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let target = Array2::zeros((4, 3));
        let losses = mse_per_timestep(&pred, &target, 2);
        assert!((losses[0] - 1.0 / 6.0).abs() < 1e-12);
        assert!((losses[1] - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_early_stopping_triggers_after_patience() {
        let dir = std::env::temp_dir().join("equivariant_nbody_es_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("saved_model.json");

        let model = EgnoModel::new(tiny_model_cfg(2));
        let mut es = EarlyStopping::new(2, &path);

        es.step(1.0, &model).unwrap();
        assert!(!es.early_stop);
        es.step(1.1, &model).unwrap();
        assert!(!es.early_stop);
        es.step(1.2, &model).unwrap();
        assert!(es.early_stop);
        assert_eq!(es.best(), Some(1.0));
        assert!(path.exists());
    }

    fn tiny_model_cfg(t: usize) -> ModelConfig {
        let mut cfg = ModelConfig::new(8, 2)
            .with_variant(LayerVariant::VelocityIntegrator)
            .with_num_timesteps(t)
            .with_seed(3);
        cfg.time_emb_dim = 4;
        cfg
    }

    fn tiny_dataset(samples: usize, seed: u64, t: usize) -> NBodyDataset {
        let gen_cfg = GeneratorConfig {
            n_balls: 3,
            num_frames: 30 + 3 * t + 2,
            sample_every: 2,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let part = generate_partition(&gen_cfg, samples, &mut rng);
        let ds_cfg = DatasetConfig {
            n_balls: 3,
            num_timesteps: t,
            max_samples: samples,
            ..Default::default()
        };
        NBodyDataset::from_arrays(&ds_cfg, "train", part.loc, part.vel, part.charges).unwrap()
    }

    #[test]
    fn test_training_reduces_or_tracks_loss() {
        let model = EgnoModel::new(tiny_model_cfg(4));
        let cfg = TrainConfig {
            batch_size: 2,
            lr: 1e-3,
            epochs: 2,
            traj_len: 2,
            rollout_loss_steps: 20,
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, cfg);
        let ds = tiny_dataset(4, 0, 4);

        let l1 = trainer.train_epoch(&ds).unwrap();
        let l2 = trainer.train_epoch(&ds).unwrap();
        assert!(l1.is_finite());
        assert!(l2.is_finite());
    }

    #[test]
    fn test_eval_epoch_leaves_parameters_untouched() {
        let model = EgnoModel::new(tiny_model_cfg(4));
        let before = serde_json::to_string(&model).unwrap();
        let cfg = TrainConfig {
            batch_size: 2,
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, cfg);
        let ds = tiny_dataset(3, 1, 4);

        trainer.eval_epoch(&ds).unwrap();
        let after = serde_json::to_string(trainer.model()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_full_run_writes_results_and_checkpoint() {
        let out = std::env::temp_dir().join("equivariant_nbody_run_test");
        let _ = std::fs::remove_dir_all(&out);

        let model = EgnoModel::new(tiny_model_cfg(3));
        let cfg = TrainConfig {
            epochs: 2,
            batch_size: 2,
            test_interval: 1,
            traj_len: 2,
            outf: out.to_string_lossy().to_string(),
            exp_name: "exp_test".to_string(),
            ..Default::default()
        };
        let mut trainer = Trainer::new(model, cfg);
        let train_ds = tiny_dataset(4, 0, 3);
        let val_ds = tiny_dataset(2, 1, 3);
        let test_ds = tiny_dataset(2, 2, 3);

        let best = trainer.run(&train_ds, &val_ds, &test_ds).unwrap();
        assert!(best.val_loss.is_finite());
        assert!(out.join("exp_test").join("loss.json").exists());
        assert!(out.join("exp_test").join("saved_model.json").exists());

        let text = std::fs::read_to_string(out.join("exp_test").join("loss.json")).unwrap();
        let parsed: TrainingResults = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.train_loss.len(), 2);
        assert_eq!(parsed.eval_epoch, vec![0, 1]);
    }
}
