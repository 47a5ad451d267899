//! Equivariant Graph Convolution Layer
//!
//! The message-passing + coordinate-update primitive. Edge messages are
//! built from node-pair features and relative geometry, aggregated into
//! per-node updates, and applied so that positions transform covariantly
//! under rigid rotations/translations: only coordinate differences and
//! per-edge scalars ever feed the position update.
//!
//! One configurable layer covers the variant family: `Basic` adds the
//! mean-aggregated translation directly, `VelocityIntegrator` treats the
//! layer as one sub-step of an integrator (update scaled by `1/n_layers`).
//! Attention gating, residual node updates, and difference normalization
//! are independent flags.

use ndarray::{s, Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{LayerVariant, ModelConfig};

use super::mlp::{Linear, Mlp2};
use super::ops::{
    segment_mean, segment_mean_backward, segment_sum, segment_sum_backward, sigmoid,
    sigmoid_prime,
};
use super::rbf::RbfExpansion;

/// Norm floor guarding the normalized-difference divisions.
const NORM_EPS: f64 = 1e-8;

/// Per-component bound on the edge translation.
const TRANS_CLAMP: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivariantLayer {
    pub variant: LayerVariant,
    pub attention: bool,
    pub recurrent: bool,
    pub norm_diff: bool,
    pub norm_vel: bool,
    pub coords_weight: f64,
    pub n_layers: usize,
    hidden_nf: usize,

    edge_mlp: Mlp2,
    node_mlp: Mlp2,
    coord_mlp: Mlp2,
    att_mlp: Option<Linear>,

    /// Constructed with the layer, not wired into the edge model.
    pub rbf: RbfExpansion,

    #[serde(skip)]
    cache: Option<LayerCache>,
}

#[derive(Debug, Clone)]
struct LayerCache {
    rows: Vec<usize>,
    cols: Vec<usize>,
    num_nodes: usize,
    d_raw: Array2<f64>,
    sqrt_r2: Array1<f64>,
    d_used: Array2<f64>,
    vel_diff: Option<Array2<f64>>,
    vel_norm_raw: Option<Array1<f64>>,
    msg_pre: Array2<f64>,
    att_z: Option<Array2<f64>>,
    att_val: Option<Array2<f64>>,
    msg: Array2<f64>,
    coord_scalar: Array2<f64>,
    trans: Array2<f64>,
}

/// Gradients a layer's backward pass hands to its predecessor.
pub struct LayerGrads {
    pub dh: Array2<f64>,
    pub dx: Array2<f64>,
    pub dv: Option<Array2<f64>>,
}

impl EquivariantLayer {
    pub fn new<R: Rng>(cfg: &ModelConfig, rng: &mut R) -> Self {
        let h = cfg.hidden_nf;
        let radial_nf = match cfg.variant {
            LayerVariant::Basic => 1,
            LayerVariant::VelocityIntegrator => 2,
        };
        let edge_mlp = Mlp2::new(2 * h + radial_nf + cfg.in_edge_nf, h, h, true, rng);
        let node_mlp = Mlp2::new(h + h + cfg.nodes_att_dim, h, h, false, rng);
        // Small-gain bias-free scalar head keeps early coordinate updates
        // near zero.
        let coord_mlp = Mlp2::new(h, h, 1, false, rng)
            .with_output_layer(Linear::with_gain(h, 1, 0.001, false, rng));
        let att_mlp = cfg.attention.then(|| Linear::new(h, 1, rng));

        Self {
            variant: cfg.variant,
            attention: cfg.attention,
            recurrent: cfg.recurrent,
            norm_diff: cfg.norm_diff,
            norm_vel: cfg.norm_vel,
            coords_weight: cfg.coords_weight,
            n_layers: cfg.n_layers.max(1),
            hidden_nf: h,
            edge_mlp,
            node_mlp,
            coord_mlp,
            att_mlp,
            rbf: RbfExpansion::new(cfg.rbf.low, cfg.rbf.high, cfg.rbf.gap),
            cache: None,
        }
    }

    /// One message-passing pass.
    ///
    /// `vel` is required for the `VelocityIntegrator` variant and passed
    /// through untouched otherwise. Returns `(h', x', v')`.
    pub fn forward(
        &mut self,
        h: &Array2<f64>,
        x: &Array2<f64>,
        vel: Option<&Array2<f64>>,
        rows: &[usize],
        cols: &[usize],
        edge_attr: &Array2<f64>,
        node_attr: Option<&Array2<f64>>,
    ) -> (Array2<f64>, Array2<f64>, Option<Array2<f64>>) {
        let num_nodes = h.nrows();
        let num_edges = rows.len();
        let hidden = self.hidden_nf;
        let coord_dim = x.ncols();
        let with_vel = matches!(self.variant, LayerVariant::VelocityIntegrator);

        // Geometry stage.
        let mut d_raw = Array2::zeros((num_edges, coord_dim));
        let mut sqrt_r2 = Array1::zeros(num_edges);
        for e in 0..num_edges {
            let diff = &x.row(rows[e]) - &x.row(cols[e]);
            sqrt_r2[e] = diff.iter().map(|v| v * v).sum::<f64>().sqrt();
            d_raw.row_mut(e).assign(&diff);
        }

        let (vel_diff, vel_norm_raw, fxv) = if with_vel {
            let v = vel.expect("velocity variant requires a velocity field");
            let mut vd = Array2::zeros((num_edges, coord_dim));
            let mut vn = Array1::zeros(num_edges);
            let mut fxv = Array1::zeros(num_edges);
            for e in 0..num_edges {
                let diff = &v.row(rows[e]) - &v.row(cols[e]);
                vn[e] = diff.iter().map(|w| w * w).sum::<f64>().sqrt();
                let cn = sqrt_r2[e].max(NORM_EPS);
                let wn = if self.norm_vel { vn[e].max(NORM_EPS) } else { 1.0 };
                fxv[e] = d_raw
                    .row(e)
                    .iter()
                    .zip(diff.iter())
                    .map(|(a, b)| (a / cn) * (b / wn))
                    .sum();
                vd.row_mut(e).assign(&diff);
            }
            (Some(vd), Some(vn), Some(fxv))
        } else {
            (None, None, None)
        };

        let d_used = if self.norm_diff {
            let mut d = d_raw.clone();
            for e in 0..num_edges {
                let nrm = sqrt_r2[e] + 1.0;
                for k in 0..coord_dim {
                    d[[e, k]] /= nrm;
                }
            }
            d
        } else {
            d_raw.clone()
        };

        // Edge model.
        let radial_nf = if with_vel { 2 } else { 1 };
        let attr_nf = edge_attr.ncols();
        let mut edge_in = Array2::zeros((num_edges, 2 * hidden + radial_nf + attr_nf));
        for e in 0..num_edges {
            edge_in
                .slice_mut(s![e, 0..hidden])
                .assign(&h.row(rows[e]));
            edge_in
                .slice_mut(s![e, hidden..2 * hidden])
                .assign(&h.row(cols[e]));
            edge_in[[e, 2 * hidden]] = sqrt_r2[e] * sqrt_r2[e];
            if let Some(fxv) = &fxv {
                edge_in[[e, 2 * hidden + 1]] = fxv[e];
            }
            for a in 0..attr_nf {
                edge_in[[e, 2 * hidden + radial_nf + a]] = edge_attr[[e, a]];
            }
        }
        let msg_pre = self.edge_mlp.forward(&edge_in);

        let (att_z, att_val, msg) = if let Some(att) = &mut self.att_mlp {
            let z = att.forward(&msg_pre);
            let a = z.mapv(sigmoid);
            let mut m = msg_pre.clone();
            for e in 0..num_edges {
                for c in 0..hidden {
                    m[[e, c]] *= a[[e, 0]];
                }
            }
            (Some(z), Some(a), m)
        } else {
            (None, None, msg_pre.clone())
        };

        // Coordinate model.
        let coord_scalar = self.coord_mlp.forward(&msg);
        let mut trans = Array2::zeros((num_edges, coord_dim));
        for e in 0..num_edges {
            for k in 0..coord_dim {
                trans[[e, k]] = d_used[[e, k]] * coord_scalar[[e, 0]];
            }
        }
        let clamped = trans.mapv(|t| t.clamp(-TRANS_CLAMP, TRANS_CLAMP));
        let agg_x = segment_mean(&clamped, rows, num_nodes);

        let (x_out, v_out) = match self.variant {
            LayerVariant::Basic => (x + &(self.coords_weight * &agg_x), vel.cloned()),
            LayerVariant::VelocityIntegrator => {
                let inv_l = 1.0 / self.n_layers as f64;
                let v = vel.expect("velocity variant requires a velocity field");
                let v_new = v + &(self.coords_weight * inv_l * &agg_x);
                let x_new = x + &(inv_l * &v_new);
                (x_new, Some(v_new))
            }
        };

        // Node model.
        let agg_m = segment_sum(&msg, rows, num_nodes);
        let att_dim = node_attr.map_or(0, |n| n.ncols());
        let mut node_in = Array2::zeros((num_nodes, 2 * hidden + att_dim));
        node_in.slice_mut(s![.., 0..hidden]).assign(h);
        node_in.slice_mut(s![.., hidden..2 * hidden]).assign(&agg_m);
        if let Some(na) = node_attr {
            node_in.slice_mut(s![.., 2 * hidden..]).assign(na);
        }
        let update = self.node_mlp.forward(&node_in);
        let h_out = if self.recurrent { h + &update } else { update };

        self.cache = Some(LayerCache {
            rows: rows.to_vec(),
            cols: cols.to_vec(),
            num_nodes,
            d_raw,
            sqrt_r2,
            d_used,
            vel_diff,
            vel_norm_raw,
            msg_pre,
            att_z,
            att_val,
            msg,
            coord_scalar,
            trans,
        });

        (h_out, x_out, v_out)
    }

    /// Reverse-mode pass. Accumulates parameter gradients and returns
    /// gradients with respect to the layer inputs.
    pub fn backward(
        &mut self,
        dh_out: &Array2<f64>,
        dx_out: &Array2<f64>,
        dv_out: Option<&Array2<f64>>,
    ) -> LayerGrads {
        let cache = self
            .cache
            .take()
            .expect("forward must run before backward");
        let hidden = self.hidden_nf;
        let num_nodes = cache.num_nodes;
        let num_edges = cache.rows.len();
        let coord_dim = cache.d_raw.ncols();
        let with_vel = matches!(self.variant, LayerVariant::VelocityIntegrator);

        // Node model.
        let d_node_in = self.node_mlp.backward(dh_out);
        let mut dh = d_node_in.slice(s![.., 0..hidden]).to_owned();
        if self.recurrent {
            dh = dh + dh_out;
        }
        let d_agg_m = d_node_in.slice(s![.., hidden..2 * hidden]).to_owned();
        let mut d_msg = segment_sum_backward(&d_agg_m, &cache.rows);

        // Coordinate / velocity update.
        let mut dx = dx_out.clone();
        let (d_agg_x, dv) = match self.variant {
            LayerVariant::Basic => (self.coords_weight * dx_out, dv_out.cloned()),
            LayerVariant::VelocityIntegrator => {
                let inv_l = 1.0 / self.n_layers as f64;
                let mut dv_new = inv_l * dx_out;
                if let Some(dvo) = dv_out {
                    dv_new = dv_new + dvo;
                }
                let d_agg = self.coords_weight * inv_l * &dv_new;
                (d_agg, Some(dv_new))
            }
        };
        let mut dv = dv;

        let d_clamped = segment_mean_backward(&d_agg_x, &cache.rows, num_nodes);
        let mut d_trans = d_clamped;
        for e in 0..num_edges {
            for k in 0..coord_dim {
                if cache.trans[[e, k]].abs() >= TRANS_CLAMP {
                    d_trans[[e, k]] = 0.0;
                }
            }
        }

        let mut d_dused = Array2::zeros((num_edges, coord_dim));
        let mut d_scalar = Array2::zeros((num_edges, 1));
        for e in 0..num_edges {
            for k in 0..coord_dim {
                d_dused[[e, k]] = d_trans[[e, k]] * cache.coord_scalar[[e, 0]];
                d_scalar[[e, 0]] += d_trans[[e, k]] * cache.d_used[[e, k]];
            }
        }
        d_msg = d_msg + &self.coord_mlp.backward(&d_scalar);

        // Attention gate.
        let d_msg_pre = if let (Some(att), Some(a), Some(z)) =
            (&mut self.att_mlp, &cache.att_val, &cache.att_z)
        {
            let mut d_pre = Array2::zeros((num_edges, hidden));
            let mut d_att = Array2::zeros((num_edges, 1));
            for e in 0..num_edges {
                for c in 0..hidden {
                    d_pre[[e, c]] = d_msg[[e, c]] * a[[e, 0]];
                    d_att[[e, 0]] += d_msg[[e, c]] * cache.msg_pre[[e, c]];
                }
                d_att[[e, 0]] *= sigmoid_prime(z[[e, 0]]);
            }
            d_pre + &att.backward(&d_att)
        } else {
            d_msg
        };

        // Edge model.
        let radial_nf = if with_vel { 2 } else { 1 };
        let d_edge_in = self.edge_mlp.backward(&d_msg_pre);
        for e in 0..num_edges {
            let (r, c) = (cache.rows[e], cache.cols[e]);
            for k in 0..hidden {
                dh[[r, k]] += d_edge_in[[e, k]];
                dh[[c, k]] += d_edge_in[[e, hidden + k]];
            }
        }

        // Geometry.
        let mut dvd = with_vel.then(|| Array2::<f64>::zeros((num_edges, coord_dim)));
        let mut dd = Array2::<f64>::zeros((num_edges, coord_dim));
        for e in 0..num_edges {
            let mut d_r2 = d_edge_in[[e, 2 * hidden]];
            let sqrt_r2 = cache.sqrt_r2[e];

            // Normalized difference used by the translation.
            if self.norm_diff {
                let nrm = sqrt_r2 + 1.0;
                let mut dot = 0.0;
                for k in 0..coord_dim {
                    dd[[e, k]] += d_dused[[e, k]] / nrm;
                    dot += d_dused[[e, k]] * cache.d_raw[[e, k]];
                }
                if sqrt_r2 > NORM_EPS {
                    d_r2 += -dot / (nrm * nrm) / (2.0 * sqrt_r2);
                }
            } else {
                for k in 0..coord_dim {
                    dd[[e, k]] += d_dused[[e, k]];
                }
            }

            // Velocity-cosine radial feature.
            if with_vel {
                let d_fxv = d_edge_in[[e, 2 * hidden + 1]];
                let vd_arr = cache.vel_diff.as_ref().expect("velocity cache");
                let vn_raw = cache.vel_norm_raw.as_ref().expect("velocity cache")[e];
                let cn = sqrt_r2.max(NORM_EPS);
                let wn = if self.norm_vel { vn_raw.max(NORM_EPS) } else { 1.0 };

                let mut du_dot_d = 0.0;
                let mut dw_dot_vd = 0.0;
                for k in 0..coord_dim {
                    du_dot_d += (d_fxv * vd_arr[[e, k]] / wn) * cache.d_raw[[e, k]];
                    dw_dot_vd += (d_fxv * cache.d_raw[[e, k]] / cn) * vd_arr[[e, k]];
                }
                for k in 0..coord_dim {
                    // u = d/cn backward
                    let du_k = d_fxv * vd_arr[[e, k]] / wn;
                    dd[[e, k]] += du_k / cn;
                    if sqrt_r2 > NORM_EPS {
                        dd[[e, k]] -= cache.d_raw[[e, k]] * du_dot_d / (cn * cn * cn);
                    }
                    // w = vd/wn backward
                    let dvd_e = dvd.as_mut().expect("velocity grads");
                    let dw_k = d_fxv * cache.d_raw[[e, k]] / cn;
                    dvd_e[[e, k]] += dw_k / wn;
                    if self.norm_vel && vn_raw > NORM_EPS {
                        dvd_e[[e, k]] -= vd_arr[[e, k]] * dw_dot_vd / (wn * wn * wn);
                    }
                }
            }

            // radial = |d|^2 backward.
            for k in 0..coord_dim {
                dd[[e, k]] += 2.0 * cache.d_raw[[e, k]] * d_r2;
            }
        }

        // Scatter difference gradients back to the endpoint nodes.
        for e in 0..num_edges {
            let (r, c) = (cache.rows[e], cache.cols[e]);
            for k in 0..coord_dim {
                dx[[r, k]] += dd[[e, k]];
                dx[[c, k]] -= dd[[e, k]];
            }
        }
        if let (Some(dvd), Some(dv)) = (&dvd, &mut dv) {
            for e in 0..num_edges {
                let (r, c) = (cache.rows[e], cache.cols[e]);
                for k in 0..coord_dim {
                    dv[[r, k]] += dvd[[e, k]];
                    dv[[c, k]] -= dvd[[e, k]];
                }
            }
        }

        LayerGrads { dh, dx, dv }
    }

    pub fn zero_grad(&mut self) {
        self.edge_mlp.zero_grad();
        self.node_mlp.zero_grad();
        self.coord_mlp.zero_grad();
        if let Some(att) = &mut self.att_mlp {
            att.zero_grad();
        }
        self.cache = None;
    }

    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let mut out = self.edge_mlp.param_grads();
        out.extend(self.node_mlp.param_grads());
        out.extend(self.coord_mlp.param_grads());
        if let Some(att) = &mut self.att_mlp {
            out.extend(att.param_grads());
        }
        out
    }

    pub fn num_parameters(&self) -> usize {
        self.edge_mlp.num_parameters()
            + self.node_mlp.num_parameters()
            + self.coord_mlp.num_parameters()
            + self.att_mlp.as_ref().map_or(0, |a| a.num_parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn full_edges(n: usize) -> (Vec<usize>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    rows.push(i);
                    cols.push(j);
                }
            }
        }
        (rows, cols)
    }

    fn small_cfg(variant: LayerVariant, attention: bool) -> ModelConfig {
        let mut cfg = ModelConfig::new(4, 2).with_variant(variant);
        cfg.attention = attention;
        cfg.in_edge_nf = 1;
        cfg
    }

    fn rotate_z(x: &Array2<f64>, angle: f64) -> Array2<f64> {
        let (s, c) = angle.sin_cos();
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            let (a, b) = (row[0], row[1]);
            row[0] = c * a - s * b;
            row[1] = s * a + c * b;
        }
        out
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = small_cfg(LayerVariant::VelocityIntegrator, false);
        let mut layer = EquivariantLayer::new(&cfg, &mut rng);

        let n = 4;
        let (rows, cols) = full_edges(n);
        let h = Array2::random_using((n, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let x = Array2::random_using((n, 3), Uniform::new(-2.0, 2.0), &mut rng);
        let v = Array2::random_using((n, 3), Uniform::new(-1.0, 1.0), &mut rng);
        let attr = Array2::random_using((rows.len(), 1), Uniform::new(-1.0, 1.0), &mut rng);

        let (h2, x2, v2) = layer.forward(&h, &x, Some(&v), &rows, &cols, &attr, None);
        assert_eq!(h2.dim(), (n, 4));
        assert_eq!(x2.dim(), (n, 3));
        assert_eq!(v2.unwrap().dim(), (n, 3));
    }

    #[test]
    fn test_rotation_translation_equivariance() {
        for variant in [LayerVariant::Basic, LayerVariant::VelocityIntegrator] {
            for attention in [false, true] {
                let mut rng = StdRng::seed_from_u64(11);
                let cfg = small_cfg(variant, attention);
                let mut layer = EquivariantLayer::new(&cfg, &mut rng);

                let n = 5;
                let (rows, cols) = full_edges(n);
                let h = Array2::random_using((n, 4), Uniform::new(-1.0, 1.0), &mut rng);
                let x = Array2::random_using((n, 3), Uniform::new(-2.0, 2.0), &mut rng);
                let v = Array2::random_using((n, 3), Uniform::new(-1.0, 1.0), &mut rng);
                let attr =
                    Array2::random_using((rows.len(), 1), Uniform::new(-1.0, 1.0), &mut rng);

                let angle = 0.83;
                let shift = [0.7, -1.2, 2.5];

                let (h_a, x_a, v_a) =
                    layer.forward(&h, &x, Some(&v), &rows, &cols, &attr, None);

                let mut x_t = rotate_z(&x, angle);
                for mut row in x_t.rows_mut() {
                    for k in 0..3 {
                        row[k] += shift[k];
                    }
                }
                let v_t = rotate_z(&v, angle);
                let (h_b, x_b, v_b) =
                    layer.forward(&h, &x_t, Some(&v_t), &rows, &cols, &attr, None);

                // Scalars invariant.
                for (a, b) in h_a.iter().zip(h_b.iter()) {
                    assert!((a - b).abs() < 1e-9, "h not invariant");
                }
                // Coordinates covariant.
                let mut x_a_t = rotate_z(&x_a, angle);
                for mut row in x_a_t.rows_mut() {
                    for k in 0..3 {
                        row[k] += shift[k];
                    }
                }
                for (a, b) in x_a_t.iter().zip(x_b.iter()) {
                    assert!((a - b).abs() < 1e-9, "x not equivariant");
                }
                // Velocities rotate without the shift.
                if let (Some(v_a), Some(v_b)) = (v_a, v_b) {
                    let v_a_t = rotate_z(&v_a, angle);
                    for (a, b) in v_a_t.iter().zip(v_b.iter()) {
                        assert!((a - b).abs() < 1e-9, "v not equivariant");
                    }
                }
            }
        }
    }

    #[test]
    fn test_translation_clamped_per_axis() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cfg = small_cfg(LayerVariant::Basic, false);
        cfg.coords_weight = 1.0;
        let mut layer = EquivariantLayer::new(&cfg, &mut rng);

        // Rig the scalar head so the raw translation is enormous.
        layer.coord_mlp.lin2.w.fill(1e9);

        let n = 3;
        let (rows, cols) = full_edges(n);
        let h = Array2::ones((n, 4));
        let x = Array2::from_shape_fn((n, 3), |(i, j)| (i * 3 + j) as f64);
        let attr = Array2::ones((rows.len(), 1));

        let (_, x2, _) = layer.forward(&h, &x, None, &rows, &cols, &attr, None);
        for i in 0..n {
            for k in 0..3 {
                assert!(
                    (x2[[i, k]] - x[[i, k]]).abs() <= TRANS_CLAMP + 1e-9,
                    "update exceeded clamp"
                );
            }
        }
    }

    #[test]
    fn test_layer_gradients_match_finite_difference() {
        for variant in [LayerVariant::Basic, LayerVariant::VelocityIntegrator] {
            for attention in [false, true] {
                let mut rng = StdRng::seed_from_u64(21);
                let mut cfg = small_cfg(variant, attention);
                cfg.norm_diff = true;
                let mut layer = EquivariantLayer::new(&cfg, &mut rng);

                let n = 3;
                let (rows, cols) = full_edges(n);
                let h = Array2::random_using((n, 4), Uniform::new(-1.0, 1.0), &mut rng);
                let x = Array2::random_using((n, 3), Uniform::new(-2.0, 2.0), &mut rng);
                let v = Array2::random_using((n, 3), Uniform::new(-1.0, 1.0), &mut rng);
                let attr =
                    Array2::random_using((rows.len(), 1), Uniform::new(-1.0, 1.0), &mut rng);

                let loss = |layer: &mut EquivariantLayer, h: &Array2<f64>, x: &Array2<f64>, v: &Array2<f64>| {
                    let (h2, x2, v2) =
                        layer.forward(h, x, Some(v), &rows, &cols, &attr, None);
                    h2.iter().map(|a| a * a).sum::<f64>()
                        + x2.iter().map(|a| a * a).sum::<f64>()
                        + v2.map_or(0.0, |vv| vv.iter().map(|a| a * a).sum::<f64>())
                };

                layer.zero_grad();
                let (h2, x2, v2) = layer.forward(&h, &x, Some(&v), &rows, &cols, &attr, None);
                let dv_seed = v2.as_ref().map(|vv| 2.0 * vv);
                let grads = layer.backward(&(2.0 * &h2), &(2.0 * &x2), dv_seed.as_ref());

                let eps = 1e-6;
                // Input gradients.
                for &(i, k) in &[(0usize, 0usize), (1, 2), (2, 1)] {
                    let mut xp = x.clone();
                    xp[[i, k]] += eps;
                    let lp = loss(&mut layer, &h, &xp, &v);
                    xp[[i, k]] -= 2.0 * eps;
                    let lm = loss(&mut layer, &h, &xp, &v);
                    let fd = (lp - lm) / (2.0 * eps);
                    assert!(
                        (grads.dx[[i, k]] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                        "dx[{},{}] variant {:?} att {}: {} vs {}",
                        i, k, variant, attention, grads.dx[[i, k]], fd
                    );
                }
                for &(i, k) in &[(0usize, 1usize), (2, 0)] {
                    let mut hp = h.clone();
                    hp[[i, k]] += eps;
                    let lp = loss(&mut layer, &hp, &x, &v);
                    hp[[i, k]] -= 2.0 * eps;
                    let lm = loss(&mut layer, &hp, &x, &v);
                    let fd = (lp - lm) / (2.0 * eps);
                    assert!(
                        (grads.dh[[i, k]] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                        "dh[{},{}] variant {:?}: {} vs {}",
                        i, k, variant, grads.dh[[i, k]], fd
                    );
                }
                if matches!(variant, LayerVariant::VelocityIntegrator) {
                    let dv = grads.dv.as_ref().unwrap();
                    for &(i, k) in &[(1usize, 1usize), (2, 2)] {
                        let mut vp = v.clone();
                        vp[[i, k]] += eps;
                        let lp = loss(&mut layer, &h, &x, &vp);
                        vp[[i, k]] -= 2.0 * eps;
                        let lm = loss(&mut layer, &h, &x, &vp);
                        let fd = (lp - lm) / (2.0 * eps);
                        assert!(
                            (dv[[i, k]] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                            "dv[{},{}]: {} vs {}",
                            i, k, dv[[i, k]], fd
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_edge_mlp_parameter_gradient() {
        let mut rng = StdRng::seed_from_u64(31);
        let cfg = small_cfg(LayerVariant::VelocityIntegrator, true);
        let mut layer = EquivariantLayer::new(&cfg, &mut rng);

        let n = 3;
        let (rows, cols) = full_edges(n);
        let h = Array2::random_using((n, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let x = Array2::random_using((n, 3), Uniform::new(-2.0, 2.0), &mut rng);
        let v = Array2::random_using((n, 3), Uniform::new(-1.0, 1.0), &mut rng);
        let attr = Array2::random_using((rows.len(), 1), Uniform::new(-1.0, 1.0), &mut rng);

        let run = |layer: &mut EquivariantLayer| {
            let (h2, x2, v2) = layer.forward(&h, &x, Some(&v), &rows, &cols, &attr, None);
            h2.iter().map(|a| a * a).sum::<f64>()
                + x2.iter().map(|a| a * a).sum::<f64>()
                + v2.unwrap().iter().map(|a| a * a).sum::<f64>()
        };

        layer.zero_grad();
        let (h2, x2, v2) = layer.forward(&h, &x, Some(&v), &rows, &cols, &attr, None);
        let dv_seed = 2.0 * &v2.unwrap();
        layer.backward(&(2.0 * &h2), &(2.0 * &x2), Some(&dv_seed));
        let analytic = layer.edge_mlp.lin1.gw[[0, 1]];

        let eps = 1e-6;
        let orig = layer.edge_mlp.lin1.w[[0, 1]];
        layer.edge_mlp.lin1.w[[0, 1]] = orig + eps;
        let lp = run(&mut layer);
        layer.edge_mlp.lin1.w[[0, 1]] = orig - eps;
        let lm = run(&mut layer);
        layer.edge_mlp.lin1.w[[0, 1]] = orig;
        let fd = (lp - lm) / (2.0 * eps);
        assert!(
            (analytic - fd).abs() < 1e-4 * (1.0 + fd.abs()),
            "{} vs {}",
            analytic,
            fd
        );
    }
}
