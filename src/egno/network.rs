//! Stacked Equivariant Model
//!
//! Composes the equivariant layers into a neural operator over
//! trajectories: the input state is lifted to `num_timesteps` time copies
//! (row order is time-major, `t * batch * n_nodes + row`), a sinusoidal
//! time encoding is embedded together with the scalar node features, and
//! the layer stack — interleaved with residual temporal spectral
//! convolutions — emits every future frame in one forward pass.

use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::utils::math::ensure_finite;

use super::layer::EquivariantLayer;
use super::mlp::Linear;
use super::time_conv::{TimeConv, TimeConvScalar};

/// Stacked equivariant neural operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgnoModel {
    config: ModelConfig,
    embedding: Linear,
    layers: Vec<EquivariantLayer>,
    h_convs: Vec<TimeConv>,
    x_convs: Vec<TimeConvScalar>,
    /// Fixed sinusoidal encoding, one row per timestep.
    time_encoding: Array2<f64>,
}

/// Inputs to one forward pass, all at the batch level (`batch * n_nodes`
/// rows).
pub struct ModelInput<'a> {
    /// Current positions.
    pub loc: &'a Array2<f64>,
    /// Scalar node features (velocity magnitudes).
    pub nodes: &'a Array2<f64>,
    /// Directed edge endpoints, already offset per graph in the batch.
    pub rows: &'a [usize],
    pub cols: &'a [usize],
    /// External edge attributes, constant across internal layers.
    pub edge_attr: &'a Array2<f64>,
    /// Current velocities.
    pub vel: &'a Array2<f64>,
    /// Per-graph coordinate mean, replicated per node.
    pub loc_mean: &'a Array2<f64>,
}

impl EgnoModel {
    pub fn new(config: ModelConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let h = config.hidden_nf;
        let t = config.num_timesteps;

        let embedding = Linear::new(config.in_node_nf + config.time_emb_dim, h, &mut rng);
        let layers = (0..config.n_layers)
            .map(|_| EquivariantLayer::new(&config, &mut rng))
            .collect();

        let with_conv = config.use_time_conv && config.num_modes > 0;
        let h_convs = if with_conv {
            (0..config.n_layers)
                .map(|_| TimeConv::new(t, config.num_modes, h, &mut rng))
                .collect()
        } else {
            Vec::new()
        };
        let x_convs = if with_conv {
            (0..config.n_layers)
                .map(|_| TimeConvScalar::new(t, config.num_modes, &mut rng))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            time_encoding: sinusoidal_encoding(t, config.time_emb_dim),
            config,
            embedding,
            layers,
            h_convs,
            x_convs,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Predict `num_timesteps` future frames.
    ///
    /// Returns `(positions, velocities, edge-attribute passthrough)`,
    /// each prediction shaped `(num_timesteps * batch * n_nodes, 3)`.
    pub fn forward(
        &mut self,
        input: &ModelInput,
    ) -> anyhow::Result<(Array2<f64>, Array2<f64>, Array2<f64>)> {
        let t_n = self.config.num_timesteps;
        let base_rows = input.loc.nrows();
        let num_edges = input.rows.len();
        let coord_dim = input.loc.ncols();

        // Lift state, edges, and attributes to the time copies.
        let mut h_in = Array2::zeros((
            t_n * base_rows,
            self.config.in_node_nf + self.config.time_emb_dim,
        ));
        let mut x = Array2::zeros((t_n * base_rows, coord_dim));
        let mut v = Array2::zeros((t_n * base_rows, coord_dim));
        let mut loc_mean = Array2::zeros((t_n * base_rows, coord_dim));
        for t in 0..t_n {
            for i in 0..base_rows {
                let r = t * base_rows + i;
                h_in.slice_mut(s![r, 0..self.config.in_node_nf])
                    .assign(&input.nodes.row(i));
                h_in.slice_mut(s![r, self.config.in_node_nf..])
                    .assign(&self.time_encoding.row(t));
                x.row_mut(r).assign(&input.loc.row(i));
                v.row_mut(r).assign(&input.vel.row(i));
                loc_mean.row_mut(r).assign(&input.loc_mean.row(i));
            }
        }
        let mut rows_l = Vec::with_capacity(t_n * num_edges);
        let mut cols_l = Vec::with_capacity(t_n * num_edges);
        let mut edge_attr_l = Array2::zeros((t_n * num_edges, input.edge_attr.ncols()));
        for t in 0..t_n {
            for e in 0..num_edges {
                rows_l.push(input.rows[e] + t * base_rows);
                cols_l.push(input.cols[e] + t * base_rows);
                edge_attr_l
                    .row_mut(t * num_edges + e)
                    .assign(&input.edge_attr.row(e));
            }
        }

        let mut h = self.embedding.forward(&h_in);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let (h_new, x_new, v_new) =
                layer.forward(&h, &x, Some(&v), &rows_l, &cols_l, &edge_attr_l, None);
            h = h_new;
            x = x_new;
            v = v_new.expect("layer threads velocity");

            if let (Some(hc), Some(xc)) = (self.h_convs.get_mut(i), self.x_convs.get_mut(i)) {
                h = &h + &hc.forward(&h);
                let centered = &x - &loc_mean;
                x = &(&centered + &xc.forward(&centered)) + &loc_mean;
            }

            if self.config.check_finite {
                ensure_finite("node features", &h)?;
                ensure_finite("coordinates", &x)?;
                ensure_finite("velocities", &v)?;
            }
        }

        Ok((x, v, input.edge_attr.clone()))
    }

    /// Reverse-mode pass through the stack. Parameter gradients accumulate
    /// in place; gradients with respect to the data inputs are discarded.
    pub fn backward(&mut self, d_loc: &Array2<f64>, d_vel: Option<&Array2<f64>>) {
        let mut dh = Array2::zeros((d_loc.nrows(), self.config.hidden_nf));
        let mut dx = d_loc.clone();
        let mut dv = d_vel.cloned();

        for i in (0..self.layers.len()).rev() {
            if let (Some(hc), Some(xc)) = (self.h_convs.get_mut(i), self.x_convs.get_mut(i)) {
                // x = centered + conv(centered) + loc_mean
                dx = &dx + &xc.backward(&dx);
                dh = &dh + &hc.backward(&dh);
            }
            let grads = self.layers[i].backward(&dh, &dx, dv.as_ref());
            dh = grads.dh;
            dx = grads.dx;
            dv = grads.dv;
        }
        self.embedding.backward(&dh);
    }

    pub fn zero_grad(&mut self) {
        self.embedding.zero_grad();
        for layer in &mut self.layers {
            layer.zero_grad();
        }
        for conv in &mut self.h_convs {
            conv.zero_grad();
        }
        for conv in &mut self.x_convs {
            conv.zero_grad();
        }
    }

    /// Flat (parameter, gradient) slice pairs in a stable visit order.
    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let mut out = self.embedding.param_grads();
        for layer in &mut self.layers {
            out.extend(layer.param_grads());
        }
        for conv in &mut self.h_convs {
            out.extend(conv.param_grads());
        }
        for conv in &mut self.x_convs {
            out.extend(conv.param_grads());
        }
        out
    }

    pub fn num_parameters(&self) -> usize {
        self.embedding.num_parameters()
            + self.layers.iter().map(|l| l.num_parameters()).sum::<usize>()
            + self.h_convs.iter().map(|c| c.num_parameters()).sum::<usize>()
            + self.x_convs.iter().map(|c| c.num_parameters()).sum::<usize>()
    }
}

fn sinusoidal_encoding(num_steps: usize, dim: usize) -> Array2<f64> {
    let mut enc = Array2::zeros((num_steps, dim));
    for t in 0..num_steps {
        for i in 0..dim {
            let freq = 1.0 / 10000f64.powf((2 * (i / 2)) as f64 / dim.max(1) as f64);
            let angle = t as f64 * freq;
            enc[[t, i]] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    enc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerVariant;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn full_edges(batch: usize, n: usize) -> (Vec<usize>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for b in 0..batch {
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        rows.push(b * n + i);
                        cols.push(b * n + j);
                    }
                }
            }
        }
        (rows, cols)
    }

    fn loc_mean_of(loc: &Array2<f64>, batch: usize, n: usize) -> Array2<f64> {
        let mut out = Array2::zeros(loc.dim());
        for b in 0..batch {
            let mut mean = [0.0; 3];
            for i in 0..n {
                for k in 0..3 {
                    mean[k] += loc[[b * n + i, k]] / n as f64;
                }
            }
            for i in 0..n {
                for k in 0..3 {
                    out[[b * n + i, k]] = mean[k];
                }
            }
        }
        out
    }

    fn small_model(n_layers: usize, t: usize) -> EgnoModel {
        let mut cfg = crate::config::ModelConfig::new(8, n_layers)
            .with_variant(LayerVariant::VelocityIntegrator)
            .with_num_timesteps(t)
            .with_seed(7);
        cfg.time_emb_dim = 6;
        cfg.num_modes = 2;
        EgnoModel::new(cfg)
    }

    struct Batch {
        loc: Array2<f64>,
        nodes: Array2<f64>,
        rows: Vec<usize>,
        cols: Vec<usize>,
        edge_attr: Array2<f64>,
        vel: Array2<f64>,
        loc_mean: Array2<f64>,
    }

    fn random_batch(batch: usize, n: usize, rng: &mut StdRng) -> Batch {
        let (rows, cols) = full_edges(batch, n);
        let loc = Array2::random_using((batch * n, 3), Uniform::new(-5.0, 5.0), rng);
        let vel = Array2::random_using((batch * n, 3), Uniform::new(-1.0, 1.0), rng);
        let nodes = Array2::from_shape_fn((batch * n, 1), |(i, _)| {
            vel.row(i).iter().map(|v| v * v).sum::<f64>().sqrt()
        });
        let edge_attr = Array2::random_using((rows.len(), 2), Uniform::new(-1.0, 1.0), rng);
        let loc_mean = loc_mean_of(&loc, batch, n);
        Batch {
            loc,
            nodes,
            rows,
            cols,
            edge_attr,
            vel,
            loc_mean,
        }
    }

    fn run(model: &mut EgnoModel, b: &Batch) -> (Array2<f64>, Array2<f64>) {
        let (loc, vel, _) = model
            .forward(&ModelInput {
                loc: &b.loc,
                nodes: &b.nodes,
                rows: &b.rows,
                cols: &b.cols,
                edge_attr: &b.edge_attr,
                vel: &b.vel,
                loc_mean: &b.loc_mean,
            })
            .unwrap();
        (loc, vel)
    }

    #[test]
    fn test_five_particle_output_shape_and_finiteness() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = small_model(4, 10);
        let (batch, n) = (2, 5);
        let b = random_batch(batch, n, &mut rng);

        let (loc_pred, vel_pred) = run(&mut model, &b);
        assert_eq!(loc_pred.dim(), (10 * batch * n, 3));
        assert_eq!(vel_pred.dim(), (10 * batch * n, 3));
        assert!(loc_pred.iter().all(|v| v.is_finite()));
        assert!(vel_pred.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_model_equivariance_under_rigid_motion() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut model = small_model(2, 4);
        let (batch, n) = (1, 5);
        let b = random_batch(batch, n, &mut rng);

        let (loc_a, vel_a) = run(&mut model, &b);

        let angle = 1.1f64;
        let (s, c) = angle.sin_cos();
        let rot = |x: &Array2<f64>| {
            let mut out = x.clone();
            for mut row in out.rows_mut() {
                let (a, b) = (row[0], row[1]);
                row[0] = c * a - s * b;
                row[1] = s * a + c * b;
            }
            out
        };
        let shift = [3.0, -2.0, 0.5];
        let translate = |x: &Array2<f64>| {
            let mut out = x.clone();
            for mut row in out.rows_mut() {
                for k in 0..3 {
                    row[k] += shift[k];
                }
            }
            out
        };

        let b2 = Batch {
            loc: translate(&rot(&b.loc)),
            nodes: b.nodes.clone(),
            rows: b.rows.clone(),
            cols: b.cols.clone(),
            edge_attr: b.edge_attr.clone(),
            vel: rot(&b.vel),
            loc_mean: translate(&rot(&b.loc_mean)),
        };
        let (loc_b, vel_b) = run(&mut model, &b2);

        let loc_expected = translate(&rot(&loc_a));
        for (a, b) in loc_expected.iter().zip(loc_b.iter()) {
            assert!((a - b).abs() < 1e-8, "positions not equivariant");
        }
        let vel_expected = rot(&vel_a);
        for (a, b) in vel_expected.iter().zip(vel_b.iter()) {
            assert!((a - b).abs() < 1e-8, "velocities not equivariant");
        }
    }

    #[test]
    fn test_model_gradients_match_finite_difference() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut model = small_model(2, 3);
        let mut b = random_batch(1, 3, &mut rng);
        // Keep magnitudes small so finite differences stay well-conditioned.
        b.loc.mapv_inplace(|v| v * 0.3);
        b.loc_mean = loc_mean_of(&b.loc, 1, 3);

        let loss = |model: &mut EgnoModel| {
            let (loc, _) = run(model, &b);
            loc.iter().map(|v| v * v).sum::<f64>()
        };

        model.zero_grad();
        let (loc_pred, _) = run(&mut model, &b);
        model.backward(&(2.0 * &loc_pred), None);

        let eps = 1e-6;

        // Embedding weight.
        let analytic = model.embedding.gw[[0, 3]];
        let orig = model.embedding.w[[0, 3]];
        model.embedding.w[[0, 3]] = orig + eps;
        let lp = loss(&mut model);
        model.embedding.w[[0, 3]] = orig - eps;
        let lm = loss(&mut model);
        model.embedding.w[[0, 3]] = orig;
        let fd = (lp - lm) / (2.0 * eps);
        assert!(
            (analytic - fd).abs() < 1e-4 * (1.0 + fd.abs()),
            "embedding: {} vs {}",
            analytic,
            fd
        );

        // Temporal convolution weight.
        let analytic = model.h_convs[0].gw_re[1][[2, 2]];
        let orig = model.h_convs[0].w_re[1][[2, 2]];
        model.h_convs[0].w_re[1][[2, 2]] = orig + eps;
        let lp = loss(&mut model);
        model.h_convs[0].w_re[1][[2, 2]] = orig - eps;
        let lm = loss(&mut model);
        model.h_convs[0].w_re[1][[2, 2]] = orig;
        let fd = (lp - lm) / (2.0 * eps);
        assert!(
            (analytic - fd).abs() < 1e-4 * (1.0 + fd.abs()),
            "time conv: {} vs {}",
            analytic,
            fd
        );

        // Coordinate-mode weight.
        let analytic = model.x_convs[1].gw_re[0];
        let orig = model.x_convs[1].w_re[0];
        model.x_convs[1].w_re[0] = orig + eps;
        let lp = loss(&mut model);
        model.x_convs[1].w_re[0] = orig - eps;
        let lm = loss(&mut model);
        model.x_convs[1].w_re[0] = orig;
        let fd = (lp - lm) / (2.0 * eps);
        assert!(
            (analytic - fd).abs() < 1e-4 * (1.0 + fd.abs()),
            "coord conv: {} vs {}",
            analytic,
            fd
        );
    }

    #[test]
    fn test_checkpoint_round_trip_preserves_outputs() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = small_model(2, 4);
        let b = random_batch(1, 4, &mut rng);
        let (loc_a, _) = run(&mut model, &b);

        let json = serde_json::to_string(&model).unwrap();
        let mut restored: EgnoModel = serde_json::from_str(&json).unwrap();
        let (loc_b, _) = run(&mut restored, &b);

        for (a, b) in loc_a.iter().zip(loc_b.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_non_finite_input_detected() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut model = small_model(1, 2);
        let mut b = random_batch(1, 3, &mut rng);
        b.loc[[0, 0]] = f64::NAN;

        let result = model.forward(&ModelInput {
            loc: &b.loc,
            nodes: &b.nodes,
            rows: &b.rows,
            cols: &b.cols,
            edge_attr: &b.edge_attr,
            vel: &b.vel,
            loc_mean: &b.loc_mean,
        });
        assert!(result.is_err());
    }
}
