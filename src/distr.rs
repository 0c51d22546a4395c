//! Distribution primitives behind the cube policies.
//!
//! The policy network emits unconstrained reals. This module owns their interpretation:
//! - a **mixture of Beta distributions** per dimension (component weight logits, and
//!   alpha/beta logits squashed into `[beta_params_min, beta_params_min + beta_params_max]`),
//! - **Bernoulli gates** parameterized by a single logit (EOS forward, back-to-source backward),
//! - **categorical** choices from masked logits.
//!
//! Everything here is `f64` internally; there is no hidden normalization of inputs.

use crate::numeric::{log_sigmoid, log_softmax_masked, logit, logsumexp, sigmoid};
use crate::{Error, Result};
use ndarray::{Array3, ArrayView2};
use rand_distr::{Beta, Distribution};
use statrs::function::gamma::ln_gamma;

/// Relative increments are clamped to `[REL_CLAMP, 1 - REL_CLAMP]` before evaluating the
/// Beta log-density, which is `-inf` (or `NaN`) at the closed ends.
pub const REL_CLAMP: f64 = 1e-6;

/// Log-density of `Beta(a, b)` at `x ∈ (0, 1)`.
pub fn beta_ln_pdf(x: f64, a: f64, b: f64) -> f64 {
    ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + (a - 1.0) * x.ln() + (b - 1.0) * (-x).ln_1p()
}

/// Map a Beta concentration to the logit stored in a policy output.
///
/// Inverse of the decoding `value = max * sigmoid(logit) + min`; `value` must lie strictly
/// inside `(min, min + max)`.
pub fn beta_param_to_logit(value: f64, min: f64, max: f64) -> Result<f64> {
    let p = (value - min) / max;
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::Domain(
            "beta parameter must lie strictly inside (beta_params_min, beta_params_min + beta_params_max)",
        ));
    }
    Ok(logit(p))
}

#[inline]
fn beta_param_from_logit(l: f32, min: f32, max: f32) -> f32 {
    max * sigmoid(l as f64) as f32 + min
}

/// Sample a categorical index from logits, skipping entries flagged `invalid`.
///
/// Note: float roundoff can leave the cumulative sum slightly below 1.0, so we fall back
/// to the last valid index instead of biasing to the first.
pub fn sample_categorical_from_logits(
    logits: &[f64],
    invalid: &[bool],
    rng: &mut impl rand::Rng,
) -> Result<usize> {
    let logprobs = log_softmax_masked(logits, invalid)?;
    let u: f64 = rng.random();
    let mut acc = 0.0f64;
    let mut last_valid = 0usize;
    for (idx, &lp) in logprobs.iter().enumerate() {
        if invalid[idx] {
            continue;
        }
        last_valid = idx;
        acc += lp.exp();
        if u <= acc {
            return Ok(idx);
        }
    }
    Ok(last_valid)
}

/// Draw a Bernoulli outcome with success probability `sigmoid(logit)`.
#[inline]
pub fn bernoulli_sample(logit: f64, rng: &mut impl rand::Rng) -> bool {
    let u: f64 = rng.random();
    u < sigmoid(logit)
}

/// Log-probability of `outcome` under a Bernoulli with logit `logit`.
#[inline]
pub fn bernoulli_log_prob(logit: f64, outcome: bool) -> f64 {
    if outcome {
        log_sigmoid(logit)
    } else {
        log_sigmoid(-logit)
    }
}

/// Decoded mixture-of-Beta parameters for a batch of policy outputs.
///
/// All three arrays have shape `[n_rows, n_dim, n_comp]`. `weights` are unnormalized
/// logits; `alphas`/`betas` are the Beta concentrations after squashing.
#[derive(Debug, Clone)]
pub struct MixtureParams {
    pub weights: Array3<f32>,
    pub alphas: Array3<f32>,
    pub betas: Array3<f32>,
}

impl MixtureParams {
    /// Decode an interleaved block of `3 * n_dim * n_comp` columns.
    ///
    /// Column `3 * (d * n_comp + c)` is the weight logit of component `c` of dimension `d`,
    /// followed by its alpha logit and its beta logit.
    pub fn from_interleaved(
        block: &ArrayView2<f32>,
        n_dim: usize,
        n_comp: usize,
        beta_params_min: f32,
        beta_params_max: f32,
    ) -> Result<Self> {
        if block.ncols() != 3 * n_dim * n_comp {
            return Err(Error::Shape("mixture block must have 3 * n_dim * n_comp columns"));
        }
        let n = block.nrows();
        let mut weights = Array3::<f32>::zeros((n, n_dim, n_comp));
        let mut alphas = Array3::<f32>::zeros((n, n_dim, n_comp));
        let mut betas = Array3::<f32>::zeros((n, n_dim, n_comp));
        for i in 0..n {
            for d in 0..n_dim {
                for c in 0..n_comp {
                    let base = 3 * (d * n_comp + c);
                    weights[[i, d, c]] = block[[i, base]];
                    alphas[[i, d, c]] =
                        beta_param_from_logit(block[[i, base + 1]], beta_params_min, beta_params_max);
                    betas[[i, d, c]] =
                        beta_param_from_logit(block[[i, base + 2]], beta_params_min, beta_params_max);
                }
            }
        }
        Ok(Self {
            weights,
            alphas,
            betas,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.weights.dim().0
    }

    pub fn n_dim(&self) -> usize {
        self.weights.dim().1
    }

    pub fn n_comp(&self) -> usize {
        self.weights.dim().2
    }

    fn component_log_weights(&self, row: usize, dim: usize) -> Vec<f64> {
        let logits: Vec<f64> = (0..self.n_comp())
            .map(|c| self.weights[[row, dim, c]] as f64)
            .collect();
        let lse = logsumexp(&logits);
        logits.iter().map(|&l| l - lse).collect()
    }

    /// Sample a relative increment in `[0, 1]` for `(row, dim)`.
    pub fn sample(&self, row: usize, dim: usize, rng: &mut impl rand::Rng) -> Result<f64> {
        let n_comp = self.n_comp();
        let logits: Vec<f64> = (0..n_comp)
            .map(|c| self.weights[[row, dim, c]] as f64)
            .collect();
        let c = sample_categorical_from_logits(&logits, &vec![false; n_comp], rng)?;
        let beta = Beta::new(
            self.alphas[[row, dim, c]] as f64,
            self.betas[[row, dim, c]] as f64,
        )
        .map_err(|_| Error::Domain("invalid Beta params"))?;
        Ok(beta.sample(rng))
    }

    /// Mixture log-density of the relative increment `r` at `(row, dim)`.
    ///
    /// `r` is clamped to `[REL_CLAMP, 1 - REL_CLAMP]` first; non-finite `r` is treated as 0.
    pub fn log_prob(&self, row: usize, dim: usize, r: f64) -> f64 {
        let r = if r.is_finite() { r } else { 0.0 };
        let r = r.clamp(REL_CLAMP, 1.0 - REL_CLAMP);
        let log_w = self.component_log_weights(row, dim);
        let terms: Vec<f64> = log_w
            .iter()
            .enumerate()
            .map(|(c, &lw)| {
                lw + beta_ln_pdf(
                    r,
                    self.alphas[[row, dim, c]] as f64,
                    self.betas[[row, dim, c]] as f64,
                )
            })
            .collect();
        logsumexp(&terms)
    }
}
