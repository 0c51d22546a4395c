//! Constructor parameters for the environments.
//!
//! Configs are plain data: `serde`-deserializable (every field optional, falling back to
//! `Default`), validated once by the environment constructor, and immutable afterwards.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Named parameters of a deterministic policy output.
///
/// `beta_alpha`/`beta_beta` are Beta concentrations (not logits); the Bernoulli entries are
/// logits. `beta_weights` is the (shared) mixture weight logit of every component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistrParams {
    pub beta_weights: f32,
    pub beta_alpha: f32,
    pub beta_beta: f32,
    pub bernoulli_source_logit: f32,
    pub bernoulli_eos_logit: f32,
}

impl DistrParams {
    /// Profile used to seed an untrained policy.
    pub fn fixed_default() -> Self {
        Self {
            beta_weights: 1.0,
            beta_alpha: 2.0,
            beta_beta: 5.0,
            bernoulli_source_logit: 1.0,
            bernoulli_eos_logit: 1.0,
        }
    }

    /// Near-deterministic profile (Beta(1000, 1000) concentrates on 0.5).
    pub fn random_default() -> Self {
        Self {
            beta_weights: 1.0,
            beta_alpha: 1000.0,
            beta_beta: 1000.0,
            bernoulli_source_logit: 1.0,
            bernoulli_eos_logit: 1.0,
        }
    }
}

impl Default for DistrParams {
    fn default() -> Self {
        Self::fixed_default()
    }
}

/// Shared configuration of both continuous cube variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeConfig {
    /// Dimensionality of the hyper-cube.
    pub n_dim: usize,
    /// Upper bound of every coordinate.
    pub max_val: f32,
    /// Minimum increment, as a fraction of `max_val`.
    pub min_incr: f32,
    /// Number of Beta components per dimension.
    pub n_comp: usize,
    /// Lower bound of decoded Beta concentrations.
    pub beta_params_min: f32,
    /// Range of decoded Beta concentrations above `beta_params_min`.
    pub beta_params_max: f32,
    pub fixed_distr_params: DistrParams,
    pub random_distr_params: DistrParams,
}

impl Default for CubeConfig {
    fn default() -> Self {
        Self {
            n_dim: 2,
            max_val: 1.0,
            min_incr: 0.1,
            n_comp: 1,
            beta_params_min: 0.1,
            beta_params_max: 1000.0,
            fixed_distr_params: DistrParams::fixed_default(),
            random_distr_params: DistrParams::random_default(),
        }
    }
}

impl CubeConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(s).map_err(|e| Error::Parse(format!("cube config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_dim == 0 {
            return Err(Error::Domain("n_dim must be >= 1"));
        }
        if !(self.max_val > 0.0) || !self.max_val.is_finite() {
            return Err(Error::Domain("max_val must be positive and finite"));
        }
        if !(self.min_incr >= 0.0 && self.min_incr < 1.0) {
            return Err(Error::Domain("min_incr must be in [0, 1)"));
        }
        if self.n_comp == 0 {
            return Err(Error::Domain("n_comp must be >= 1"));
        }
        if !(self.beta_params_min > 0.0) || !self.beta_params_min.is_finite() {
            return Err(Error::Domain("beta_params_min must be positive and finite"));
        }
        if !(self.beta_params_max > 0.0) || !self.beta_params_max.is_finite() {
            return Err(Error::Domain("beta_params_max must be positive and finite"));
        }
        Ok(())
    }

    /// Minimum increment in absolute units.
    pub fn min_incr_abs(&self) -> f32 {
        self.min_incr * self.max_val
    }
}

/// Configuration of the discrete hyper-grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub n_dim: usize,
    /// Number of cells per dimension.
    pub length: usize,
    /// Largest number of cells a single action may advance.
    pub max_step_len: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            n_dim: 2,
            length: 3,
            max_step_len: 1,
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_dim == 0 {
            return Err(Error::Domain("n_dim must be >= 1"));
        }
        if self.length < 2 {
            return Err(Error::Domain("length must be >= 2"));
        }
        if self.max_step_len == 0 || self.max_step_len >= self.length {
            return Err(Error::Domain("max_step_len must be in [1, length)"));
        }
        Ok(())
    }
}
