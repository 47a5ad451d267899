//! Linear Layers and Two-Layer MLPs
//!
//! Minimal feed-forward building blocks with explicit reverse-mode
//! gradients. Each module caches what its backward pass needs during
//! forward; gradients accumulate into `gw`/`gb` until `zero_grad`.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ops::{silu, silu_prime};

/// Fully connected layer, `y = x W (+ b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub w: Array2<f64>,
    pub b: Option<Array1<f64>>,

    #[serde(skip)]
    pub gw: Array2<f64>,
    #[serde(skip)]
    pub gb: Option<Array1<f64>>,

    #[serde(skip)]
    last_input: Option<Array2<f64>>,
}

impl Linear {
    /// Xavier-uniform initialized layer with bias.
    pub fn new<R: Rng>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        Self::with_gain(input_dim, output_dim, 1.0, true, rng)
    }

    /// Xavier-uniform initialization scaled by `gain`; `bias` selects
    /// whether an additive bias is learned. The coordinate scalar head
    /// uses a small gain so early coordinate updates stay near zero.
    pub fn with_gain<R: Rng>(
        input_dim: usize,
        output_dim: usize,
        gain: f64,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let limit = gain * (6.0 / (input_dim + output_dim) as f64).sqrt();
        let w = Array2::random_using((input_dim, output_dim), Uniform::new(-limit, limit), rng);
        let b = if bias {
            Some(Array1::zeros(output_dim))
        } else {
            None
        };
        Self {
            gw: Array2::zeros((input_dim, output_dim)),
            gb: b.as_ref().map(|b| Array1::zeros(b.len())),
            w,
            b,
            last_input: None,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.w.ncols()
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        self.last_input = Some(x.clone());
        let mut z = x.dot(&self.w);
        if let Some(b) = &self.b {
            for mut row in z.rows_mut() {
                row += b;
            }
        }
        z
    }

    /// Accumulates parameter gradients and returns the input gradient.
    pub fn backward(&mut self, grad_out: &Array2<f64>) -> Array2<f64> {
        let x = self
            .last_input
            .as_ref()
            .expect("forward must run before backward");
        self.gw = &self.gw + &x.t().dot(grad_out);
        if let Some(gb) = &mut self.gb {
            *gb = &*gb + &grad_out.sum_axis(Axis(0));
        }
        grad_out.dot(&self.w.t())
    }

    pub fn zero_grad(&mut self) {
        self.gw = Array2::zeros(self.w.dim());
        if let Some(b) = &self.b {
            self.gb = Some(Array1::zeros(b.len()));
        }
        self.last_input = None;
    }

    /// Flat (parameter, gradient) slice pairs for the optimizer, weights
    /// first. Arrays are allocated in standard layout, so the slice views
    /// always exist.
    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let Self { w, b, gw, gb, .. } = self;
        let mut out: Vec<(&mut [f64], &[f64])> = vec![(
            w.as_slice_mut().expect("standard layout"),
            gw.as_slice().expect("standard layout"),
        )];
        if let (Some(b), Some(gb)) = (b, gb) {
            out.push((
                b.as_slice_mut().expect("standard layout"),
                gb.as_slice().expect("standard layout"),
            ));
        }
        out
    }

    pub fn num_parameters(&self) -> usize {
        self.w.len() + self.b.as_ref().map_or(0, |b| b.len())
    }
}

/// Two-layer MLP with SiLU after the first layer and, optionally, after
/// the second (the edge model activates both, the node model only one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp2 {
    pub lin1: Linear,
    pub lin2: Linear,
    pub act_after_second: bool,

    #[serde(skip)]
    z1: Option<Array2<f64>>,
    #[serde(skip)]
    z2: Option<Array2<f64>>,
}

impl Mlp2 {
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        act_after_second: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            lin1: Linear::new(input_dim, hidden_dim, rng),
            lin2: Linear::new(hidden_dim, output_dim, rng),
            act_after_second,
            z1: None,
            z2: None,
        }
    }

    /// Replace the output layer, used for the coordinate head where the
    /// final projection is bias-free with a small init gain.
    pub fn with_output_layer(mut self, lin2: Linear) -> Self {
        self.lin2 = lin2;
        self
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        let z1 = self.lin1.forward(x);
        let a1 = z1.mapv(silu);
        self.z1 = Some(z1);
        let z2 = self.lin2.forward(&a1);
        let out = if self.act_after_second {
            z2.mapv(silu)
        } else {
            z2.clone()
        };
        self.z2 = Some(z2);
        out
    }

    pub fn backward(&mut self, grad_out: &Array2<f64>) -> Array2<f64> {
        let z2 = self.z2.as_ref().expect("forward must run before backward");
        let dz2 = if self.act_after_second {
            grad_out * &z2.mapv(silu_prime)
        } else {
            grad_out.clone()
        };
        let da1 = self.lin2.backward(&dz2);
        let z1 = self.z1.as_ref().expect("forward must run before backward");
        let dz1 = &da1 * &z1.mapv(silu_prime);
        self.lin1.backward(&dz1)
    }

    pub fn zero_grad(&mut self) {
        self.lin1.zero_grad();
        self.lin2.zero_grad();
        self.z1 = None;
        self.z2 = None;
    }

    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let mut out = self.lin1.param_grads();
        out.extend(self.lin2.param_grads());
        out
    }

    pub fn num_parameters(&self) -> usize {
        self.lin1.num_parameters() + self.lin2.num_parameters()
    }
}
