//! Optimization Algorithms
//!
//! Gradient-descent updates over the model's flat (parameter, gradient)
//! slice pairs. Moment buffers are keyed by visit order, which the model
//! keeps stable across steps.

use serde::{Deserialize, Serialize};

/// Optimizer over flat parameter/gradient slice pairs.
pub trait Optimizer {
    /// Apply one update step in place.
    fn step(&mut self, params: &mut [(&mut [f64], &[f64])]);

    /// Reset optimizer state for a new training run.
    fn reset(&mut self);
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f64,
    pub momentum: f64,
    #[serde(skip)]
    velocity: Vec<Vec<f64>>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocity: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [(&mut [f64], &[f64])]) {
        if self.velocity.len() != params.len() {
            self.velocity = params.iter().map(|(p, _)| vec![0.0; p.len()]).collect();
        }
        for (slot, (p, g)) in params.iter_mut().enumerate() {
            if self.momentum > 0.0 {
                let v = &mut self.velocity[slot];
                for i in 0..p.len() {
                    v[i] = self.momentum * v[i] - self.lr * g[i];
                    p[i] += v[i];
                }
            } else {
                for i in 0..p.len() {
                    p[i] -= self.lr * g[i];
                }
            }
        }
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

/// Adam with bias correction and L2 weight decay folded into the
/// gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    #[serde(skip)]
    t: usize,
    #[serde(skip)]
    m: Vec<Vec<f64>>,
    #[serde(skip)]
    v: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [(&mut [f64], &[f64])]) {
        if self.m.len() != params.len() {
            self.m = params.iter().map(|(p, _)| vec![0.0; p.len()]).collect();
            self.v = params.iter().map(|(p, _)| vec![0.0; p.len()]).collect();
        }
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (slot, (p, g)) in params.iter_mut().enumerate() {
            let m = &mut self.m[slot];
            let v = &mut self.v[slot];
            for i in 0..p.len() {
                let grad = g[i] + self.weight_decay * p[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * grad;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * grad * grad;
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                p[i] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }
}
