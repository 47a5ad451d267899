//! Temporal Spectral Convolution
//!
//! Mixes the time-lifted copies of the state across timesteps through a
//! truncated Fourier basis: project onto the first `num_modes` DFT modes,
//! multiply by learned complex weights, transform back. Hidden features
//! use a full complex channel-mixing matrix per mode; coordinates use a
//! complex scalar per mode so that the update commutes with rigid
//! rotations of the coordinate frame.

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Channel-mixing spectral convolution over the time axis.
///
/// Input is `(num_steps * rows, channels)` with time-major row blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConv {
    pub num_steps: usize,
    pub num_modes: usize,
    pub channels: usize,
    pub w_re: Vec<Array2<f64>>,
    pub w_im: Vec<Array2<f64>>,

    #[serde(skip)]
    pub gw_re: Vec<Array2<f64>>,
    #[serde(skip)]
    pub gw_im: Vec<Array2<f64>>,

    #[serde(skip)]
    cache: Option<SpectralCache>,
}

#[derive(Debug, Clone)]
struct SpectralCache {
    f_re: Vec<Array2<f64>>,
    f_im: Vec<Array2<f64>>,
    rows: usize,
}

impl TimeConv {
    pub fn new<R: Rng>(num_steps: usize, num_modes: usize, channels: usize, rng: &mut R) -> Self {
        let num_modes = num_modes.min(num_steps);
        let limit = 1.0 / channels as f64;
        let dist = Uniform::new(-limit, limit);
        let w_re: Vec<_> = (0..num_modes)
            .map(|_| Array2::random_using((channels, channels), dist, rng))
            .collect();
        let w_im: Vec<_> = (0..num_modes)
            .map(|_| Array2::random_using((channels, channels), dist, rng))
            .collect();
        Self {
            num_steps,
            num_modes,
            channels,
            gw_re: vec![Array2::zeros((channels, channels)); num_modes],
            gw_im: vec![Array2::zeros((channels, channels)); num_modes],
            w_re,
            w_im,
            cache: None,
        }
    }

    fn angles(&self, mode: usize) -> Vec<(f64, f64)> {
        let w = 2.0 * PI * mode as f64 / self.num_steps as f64;
        (0..self.num_steps)
            .map(|t| ((w * t as f64).cos(), (w * t as f64).sin()))
            .collect()
    }

    /// Forward transform; the caller adds the result residually.
    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        let rows = x.nrows() / self.num_steps;
        let c = self.channels;
        let t_n = self.num_steps;

        let mut f_re = Vec::with_capacity(self.num_modes);
        let mut f_im = Vec::with_capacity(self.num_modes);
        for m in 0..self.num_modes {
            let ang = self.angles(m);
            let mut re = Array2::zeros((rows, c));
            let mut im = Array2::zeros((rows, c));
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let block = x.slice(ndarray::s![t * rows..(t + 1) * rows, ..]);
                re = re + &(cos_t * &block);
                im = im - &(sin_t * &block);
            }
            f_re.push(re);
            f_im.push(im);
        }

        let mut y = Array2::zeros((t_n * rows, c));
        for m in 0..self.num_modes {
            let g_re = f_re[m].dot(&self.w_re[m]) - f_im[m].dot(&self.w_im[m]);
            let g_im = f_re[m].dot(&self.w_im[m]) + f_im[m].dot(&self.w_re[m]);
            let scale = if m == 0 { 1.0 } else { 2.0 } / t_n as f64;
            let ang = self.angles(m);
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let mut block = y.slice_mut(ndarray::s![t * rows..(t + 1) * rows, ..]);
                block += &(scale * (cos_t * &g_re - sin_t * &g_im));
            }
        }

        self.cache = Some(SpectralCache { f_re, f_im, rows });
        y
    }

    pub fn backward(&mut self, grad_out: &Array2<f64>) -> Array2<f64> {
        let cache = self
            .cache
            .take()
            .expect("forward must run before backward");
        let rows = cache.rows;
        let c = self.channels;
        let t_n = self.num_steps;

        let mut dx = Array2::zeros((t_n * rows, c));
        for m in 0..self.num_modes {
            let ang = self.angles(m);
            let scale = if m == 0 { 1.0 } else { 2.0 } / t_n as f64;

            let mut dg_re = Array2::zeros((rows, c));
            let mut dg_im = Array2::zeros((rows, c));
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let block = grad_out.slice(ndarray::s![t * rows..(t + 1) * rows, ..]);
                dg_re = dg_re + &(scale * cos_t * &block);
                dg_im = dg_im - &(scale * sin_t * &block);
            }

            self.gw_re[m] =
                &self.gw_re[m] + &(cache.f_re[m].t().dot(&dg_re) + cache.f_im[m].t().dot(&dg_im));
            self.gw_im[m] =
                &self.gw_im[m] + &(cache.f_re[m].t().dot(&dg_im) - cache.f_im[m].t().dot(&dg_re));

            let df_re = dg_re.dot(&self.w_re[m].t()) + dg_im.dot(&self.w_im[m].t());
            let df_im = dg_im.dot(&self.w_re[m].t()) - dg_re.dot(&self.w_im[m].t());
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let mut block = dx.slice_mut(ndarray::s![t * rows..(t + 1) * rows, ..]);
                block += &(cos_t * &df_re - sin_t * &df_im);
            }
        }
        dx
    }

    pub fn zero_grad(&mut self) {
        // Rebuilt from scratch: the gradient buffers are not serialized,
        // so a freshly restored model starts with empty vectors.
        self.gw_re = vec![Array2::zeros((self.channels, self.channels)); self.num_modes];
        self.gw_im = vec![Array2::zeros((self.channels, self.channels)); self.num_modes];
        self.cache = None;
    }

    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let Self {
            w_re,
            w_im,
            gw_re,
            gw_im,
            ..
        } = self;
        w_re.iter_mut()
            .zip(gw_re.iter())
            .chain(w_im.iter_mut().zip(gw_im.iter()))
            .map(|(w, g)| {
                (
                    w.as_slice_mut().expect("standard layout"),
                    g.as_slice().expect("standard layout"),
                )
            })
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        2 * self.num_modes * self.channels * self.channels
    }
}

/// Per-mode complex scalar spectral convolution, applied to centered
/// coordinates. A scalar weight treats the three coordinate axes
/// identically, so the output rotates with the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConvScalar {
    pub num_steps: usize,
    pub num_modes: usize,
    pub w_re: Array1<f64>,
    pub w_im: Array1<f64>,

    #[serde(skip)]
    pub gw_re: Array1<f64>,
    #[serde(skip)]
    pub gw_im: Array1<f64>,

    #[serde(skip)]
    cache: Option<SpectralCache>,
}

impl TimeConvScalar {
    pub fn new<R: Rng>(num_steps: usize, num_modes: usize, rng: &mut R) -> Self {
        let num_modes = num_modes.min(num_steps);
        let dist = Uniform::new(-0.1, 0.1);
        Self {
            num_steps,
            num_modes,
            w_re: Array1::random_using(num_modes, dist, rng),
            w_im: Array1::random_using(num_modes, dist, rng),
            gw_re: Array1::zeros(num_modes),
            gw_im: Array1::zeros(num_modes),
            cache: None,
        }
    }

    fn angles(&self, mode: usize) -> Vec<(f64, f64)> {
        let w = 2.0 * PI * mode as f64 / self.num_steps as f64;
        (0..self.num_steps)
            .map(|t| ((w * t as f64).cos(), (w * t as f64).sin()))
            .collect()
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        let rows = x.nrows() / self.num_steps;
        let c = x.ncols();
        let t_n = self.num_steps;

        let mut f_re = Vec::with_capacity(self.num_modes);
        let mut f_im = Vec::with_capacity(self.num_modes);
        for m in 0..self.num_modes {
            let ang = self.angles(m);
            let mut re = Array2::zeros((rows, c));
            let mut im = Array2::zeros((rows, c));
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let block = x.slice(ndarray::s![t * rows..(t + 1) * rows, ..]);
                re = re + &(cos_t * &block);
                im = im - &(sin_t * &block);
            }
            f_re.push(re);
            f_im.push(im);
        }

        let mut y = Array2::zeros((t_n * rows, c));
        for m in 0..self.num_modes {
            let g_re = self.w_re[m] * &f_re[m] - self.w_im[m] * &f_im[m];
            let g_im = self.w_im[m] * &f_re[m] + self.w_re[m] * &f_im[m];
            let scale = if m == 0 { 1.0 } else { 2.0 } / t_n as f64;
            let ang = self.angles(m);
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let mut block = y.slice_mut(ndarray::s![t * rows..(t + 1) * rows, ..]);
                block += &(scale * (cos_t * &g_re - sin_t * &g_im));
            }
        }

        self.cache = Some(SpectralCache { f_re, f_im, rows });
        y
    }

    pub fn backward(&mut self, grad_out: &Array2<f64>) -> Array2<f64> {
        let cache = self
            .cache
            .take()
            .expect("forward must run before backward");
        let rows = cache.rows;
        let c = grad_out.ncols();
        let t_n = self.num_steps;

        let mut dx = Array2::zeros((t_n * rows, c));
        for m in 0..self.num_modes {
            let ang = self.angles(m);
            let scale = if m == 0 { 1.0 } else { 2.0 } / t_n as f64;

            let mut dg_re = Array2::zeros((rows, c));
            let mut dg_im = Array2::zeros((rows, c));
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let block = grad_out.slice(ndarray::s![t * rows..(t + 1) * rows, ..]);
                dg_re = dg_re + &(scale * cos_t * &block);
                dg_im = dg_im - &(scale * sin_t * &block);
            }

            self.gw_re[m] += (&cache.f_re[m] * &dg_re).sum() + (&cache.f_im[m] * &dg_im).sum();
            self.gw_im[m] += (&cache.f_re[m] * &dg_im).sum() - (&cache.f_im[m] * &dg_re).sum();

            let df_re = self.w_re[m] * &dg_re + self.w_im[m] * &dg_im;
            let df_im = self.w_re[m] * &dg_im - self.w_im[m] * &dg_re;
            for (t, &(cos_t, sin_t)) in ang.iter().enumerate() {
                let mut block = dx.slice_mut(ndarray::s![t * rows..(t + 1) * rows, ..]);
                block += &(cos_t * &df_re - sin_t * &df_im);
            }
        }
        dx
    }

    pub fn zero_grad(&mut self) {
        self.gw_re = Array1::zeros(self.num_modes);
        self.gw_im = Array1::zeros(self.num_modes);
        self.cache = None;
    }

    pub fn param_grads(&mut self) -> Vec<(&mut [f64], &[f64])> {
        let Self {
            w_re,
            w_im,
            gw_re,
            gw_im,
            ..
        } = self;
        vec![
            (
                w_re.as_slice_mut().expect("standard layout"),
                gw_re.as_slice().expect("standard layout"),
            ),
            (
                w_im.as_slice_mut().expect("standard layout"),
                gw_im.as_slice().expect("standard layout"),
            ),
        ]
    }

    pub fn num_parameters(&self) -> usize {
        2 * self.num_modes
    }
}
