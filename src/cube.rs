//! Continuous hyper-cube where every action increments all dimensions at once.
//!
//! States are points of `[0, max_val]^n_dim`; the all-zero point is the source. A forward
//! action is a vector of absolute increments, one per dimension, or EOS (all `+inf`).
//! Backward actions are absolute decrements, with back-to-source (BTS) being the decrement
//! that equals the originating state.
//!
//! ## Masks
//!
//! Masks have three entries and mix invalidity with "special case" flags. A special case is
//! flagged by `false` (the case is "not invalid").
//!
//! Forward:
//! - `0`: continuous actions invalid (done, or some coordinate above `max_val - min_incr`;
//!   only EOS remains),
//! - `1`: `false` iff the state is the source (the minimum increment is then 0),
//! - `2`: EOS invalid (source state, or done).
//!
//! Backward:
//! - `0`: continuous actions invalid (done, or BTS forced),
//! - `1`: `false` iff BTS is forced (some coordinate below `min_incr`),
//! - `2`: `false` iff done (undoing EOS is then the only action).
//!
//! ## Policy output
//!
//! `3 * n_dim * n_comp` interleaved mixture entries (see [`MixtureParams::from_interleaved`]),
//! then the BTS logit, then the EOS logit.

use crate::config::{CubeConfig, DistrParams};
use crate::distr::{bernoulli_log_prob, bernoulli_sample, beta_param_to_logit, MixtureParams};
use crate::env::{format_bracketed, parse_bracketed, EnvId, Environment, StepOutcome};
use crate::numeric::{isclose, SOURCE_ATOL};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Zip};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

/// Tolerance on the `[0, max_val]` bounds after a continuous step.
pub const BOUNDS_EPSILON: f32 = 1e-6;
/// Added to Jacobian denominators so that edge states do not divide by zero.
pub const JACOBIAN_EPSILON: f64 = 1e-9;

pub const MASK_IDX_CONT: usize = 0;
pub const MASK_IDX_SOURCE: usize = 1;
pub const MASK_IDX_EOS: usize = 2;
pub const MASK_DIM: usize = 3;

/// Absolute increment from a relative one.
///
/// Forward: `a = m + r (max_val - x - m)`; backward: `a = m + r (x - m)`.
#[inline]
pub fn relative_to_absolute(x: f32, r: f32, m: f32, max_val: f32, is_backward: bool) -> f32 {
    if is_backward {
        m + r * (x - m)
    } else {
        m + r * (max_val - x - m)
    }
}

/// Exact algebraic inverse of [`relative_to_absolute`].
#[inline]
pub fn absolute_to_relative(x: f32, a: f32, m: f32, max_val: f32, is_backward: bool) -> f32 {
    if is_backward {
        (a - m) / (x - m)
    } else {
        (a - m) / (max_val - x - m)
    }
}

/// `ln |dr/da|` for one dimension.
///
/// Forward `1 / (max_val - x - m)`, backward `1 / (x - m)`; cross terms are zero, so the
/// log-determinant is the sum of these over dimensions.
#[inline]
pub fn log_jacobian_diag(x: f32, m: f32, max_val: f32, is_backward: bool) -> f64 {
    let denom = if is_backward {
        x as f64 - m as f64
    } else {
        max_val as f64 - x as f64 - m as f64
    };
    -(denom.max(0.0) + JACOBIAN_EPSILON).ln()
}

fn check_same_shape(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(Error::Shape("increment batches must share the state batch shape"));
    }
    Ok(())
}

/// Batched [`relative_to_absolute`].
pub fn relative_to_absolute_increments(
    states: &ArrayView2<f32>,
    increments_rel: &ArrayView2<f32>,
    min_increments: &ArrayView2<f32>,
    max_val: f32,
    is_backward: bool,
) -> Result<Array2<f32>> {
    check_same_shape(states, increments_rel)?;
    check_same_shape(states, min_increments)?;
    let mut out = Array2::<f32>::zeros(states.raw_dim());
    Zip::from(&mut out)
        .and(states)
        .and(increments_rel)
        .and(min_increments)
        .for_each(|o, &x, &r, &m| *o = relative_to_absolute(x, r, m, max_val, is_backward));
    Ok(out)
}

/// Batched [`absolute_to_relative`].
pub fn absolute_to_relative_increments(
    states: &ArrayView2<f32>,
    increments_abs: &ArrayView2<f32>,
    min_increments: &ArrayView2<f32>,
    max_val: f32,
    is_backward: bool,
) -> Result<Array2<f32>> {
    check_same_shape(states, increments_abs)?;
    check_same_shape(states, min_increments)?;
    let mut out = Array2::<f32>::zeros(states.raw_dim());
    Zip::from(&mut out)
        .and(states)
        .and(increments_abs)
        .and(min_increments)
        .for_each(|o, &x, &a, &m| *o = absolute_to_relative(x, a, m, max_val, is_backward));
    Ok(out)
}

/// Diagonal of the Jacobian `|dr/da|` for a batch of states.
pub fn jacobian_diag(
    states: &ArrayView2<f32>,
    min_increments: &ArrayView2<f32>,
    max_val: f32,
    is_backward: bool,
) -> Result<Array2<f64>> {
    check_same_shape(states, min_increments)?;
    let mut out = Array2::<f64>::zeros(states.raw_dim());
    Zip::from(&mut out)
        .and(states)
        .and(min_increments)
        .for_each(|o, &x, &m| *o = log_jacobian_diag(x, m, max_val, is_backward).exp());
    Ok(out)
}

/// True if every component is `+inf`.
pub fn is_eos_action(action: &[f32]) -> bool {
    !action.is_empty() && action.iter().all(|&a| a == f32::INFINITY)
}

/// A policy-output batch decoded into typed parameters.
#[derive(Debug, Clone)]
pub struct CubePolicyOutputs {
    pub mixture: MixtureParams,
    pub bts_logits: Array1<f32>,
    pub eos_logits: Array1<f32>,
}

/// Multi-dimension-increment continuous cube.
#[derive(Debug)]
pub struct ContinuousCube {
    n_dim: usize,
    max_val: f32,
    min_incr: f32,
    n_comp: usize,
    beta_params_min: f32,
    beta_params_max: f32,
    fixed_distr_params: DistrParams,
    random_distr_params: DistrParams,
    fixed_policy_output: Array1<f32>,
    random_policy_output: Array1<f32>,
    source: Vec<f32>,
    state: Vec<f32>,
    done: bool,
    n_actions: usize,
    id: EnvId,
}

impl ContinuousCube {
    pub fn new(cfg: &CubeConfig) -> Result<Self> {
        cfg.validate()?;
        let source = vec![0.0f32; cfg.n_dim];
        let mut env = Self {
            n_dim: cfg.n_dim,
            max_val: cfg.max_val,
            min_incr: cfg.min_incr_abs(),
            n_comp: cfg.n_comp,
            beta_params_min: cfg.beta_params_min,
            beta_params_max: cfg.beta_params_max,
            fixed_distr_params: cfg.fixed_distr_params,
            random_distr_params: cfg.random_distr_params,
            fixed_policy_output: Array1::zeros(0),
            random_policy_output: Array1::zeros(0),
            state: source.clone(),
            source,
            done: false,
            n_actions: 0,
            id: EnvId::next(),
        };
        env.fixed_policy_output = env.policy_output(&cfg.fixed_distr_params)?;
        env.random_policy_output = env.policy_output(&cfg.random_distr_params)?;
        Ok(env)
    }

    pub fn n_dim(&self) -> usize {
        self.n_dim
    }

    pub fn max_val(&self) -> f32 {
        self.max_val
    }

    /// Minimum increment in absolute units.
    pub fn min_incr(&self) -> f32 {
        self.min_incr
    }

    pub fn n_comp(&self) -> usize {
        self.n_comp
    }

    pub fn fixed_distr_params(&self) -> &DistrParams {
        &self.fixed_distr_params
    }

    pub fn random_distr_params(&self) -> &DistrParams {
        &self.random_distr_params
    }

    fn len_policy_output_cont(&self) -> usize {
        3 * self.n_dim * self.n_comp
    }

    pub fn is_source(&self, state: &[f32]) -> bool {
        state.iter().all(|&x| x == 0.0)
    }

    /// Deterministic policy output built from named distribution parameters.
    pub fn policy_output(&self, params: &DistrParams) -> Result<Array1<f32>> {
        let len_cont = self.len_policy_output_cont();
        let (min, max) = (self.beta_params_min as f64, self.beta_params_max as f64);
        let alpha = beta_param_to_logit(params.beta_alpha as f64, min, max)? as f32;
        let beta = beta_param_to_logit(params.beta_beta as f64, min, max)? as f32;
        let mut out = Array1::<f32>::zeros(len_cont + 2);
        for j in 0..self.n_dim * self.n_comp {
            out[3 * j] = params.beta_weights;
            out[3 * j + 1] = alpha;
            out[3 * j + 2] = beta;
        }
        out[len_cont] = params.bernoulli_source_logit;
        out[len_cont + 1] = params.bernoulli_eos_logit;
        Ok(out)
    }

    /// Split a policy-output batch into mixture parameters and the two Bernoulli logits.
    pub fn decode_policy_outputs(
        &self,
        policy_outputs: &ArrayView2<f32>,
    ) -> Result<CubePolicyOutputs> {
        if policy_outputs.ncols() != self.policy_output_dim() {
            return Err(Error::Shape("policy output width must be 3 * n_dim * n_comp + 2"));
        }
        let len_cont = self.len_policy_output_cont();
        let mixture = MixtureParams::from_interleaved(
            &policy_outputs.slice(s![.., ..len_cont]),
            self.n_dim,
            self.n_comp,
            self.beta_params_min,
            self.beta_params_max,
        )?;
        Ok(CubePolicyOutputs {
            mixture,
            bts_logits: policy_outputs.column(len_cont).to_owned(),
            eos_logits: policy_outputs.column(len_cont + 1).to_owned(),
        })
    }

    fn check_batch(
        &self,
        n_rows: usize,
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
    ) -> Result<()> {
        if masks.ncols() != MASK_DIM {
            return Err(Error::Shape("cube masks must have 3 columns"));
        }
        if masks.nrows() != n_rows || states_from.len() != n_rows {
            return Err(Error::Shape("masks and states_from must match the policy batch"));
        }
        if states_from.iter().any(|x| x.len() != self.n_dim) {
            return Err(Error::Shape("states must have n_dim coordinates"));
        }
        Ok(())
    }

    /// `ceil(n^(1/n_dim))` evenly spaced values per dimension, cartesian product.
    pub fn grid_terminating_states(&self, n_states: usize) -> Vec<Vec<f32>> {
        let per_dim = ((n_states.max(1) as f64).powf(1.0 / self.n_dim as f64) - 1e-9).ceil();
        let per_dim = (per_dim as usize).max(1);
        let values: Vec<f32> = if per_dim == 1 {
            vec![0.0]
        } else {
            (0..per_dim)
                .map(|i| self.max_val * i as f32 / (per_dim - 1) as f32)
                .collect()
        };
        let total = per_dim.pow(self.n_dim as u32);
        (0..total)
            .map(|mut flat| {
                let mut state = vec![0.0f32; self.n_dim];
                for d in (0..self.n_dim).rev() {
                    state[d] = values[flat % per_dim];
                    flat /= per_dim;
                }
                state
            })
            .collect()
    }

    /// `n_states` points drawn uniformly from the cube.
    pub fn uniform_terminating_states(&self, n_states: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n_states)
            .map(|_| {
                (0..self.n_dim)
                    .map(|_| rng.random_range(0.0..=self.max_val))
                    .collect()
            })
            .collect()
    }

    fn outcome(&self, action: &[f32], valid: bool) -> StepOutcome<Vec<f32>, Vec<f32>> {
        StepOutcome {
            state: self.state.clone(),
            action: action.to_vec(),
            valid,
        }
    }

    fn is_increment_action(&self, action: &[f32]) -> bool {
        action.len() == self.n_dim && action.iter().all(|&a| a.is_finite() && a >= 0.0)
    }

    /// Apply a continuous (non-EOS) action and check the cube bounds.
    fn apply_increments(&mut self, action: &[f32], is_backward: bool) {
        let mut next = self.state.clone();
        for (x, &a) in next.iter_mut().zip(action) {
            if is_backward {
                *x -= a;
            } else {
                *x += a;
            }
        }
        if isclose(&next, &self.source, SOURCE_ATOL) {
            next = self.source.clone();
        }
        assert!(
            next.iter()
                .all(|&x| x >= -BOUNDS_EPSILON && x <= self.max_val + BOUNDS_EPSILON),
            "state left the cube [0, {}]: state={:?} action={:?} from={:?}",
            self.max_val,
            next,
            action,
            self.state
        );
        self.state = next;
    }

    fn sample_forward(
        &self,
        decoded: &CubePolicyOutputs,
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<Vec<f32>>> {
        let n = states_from.len();
        let is_source: Vec<bool> = (0..n).map(|i| !masks[[i, MASK_IDX_SOURCE]]).collect();
        let is_eos_forced: Vec<bool> = (0..n).map(|i| masks[[i, MASK_IDX_CONT]]).collect();
        for i in 0..n {
            if is_source[i] && is_eos_forced[i] {
                return Err(Error::Domain("EOS cannot be forced from the source state"));
            }
            if is_eos_forced[i] && masks[[i, MASK_IDX_EOS]] {
                return Err(Error::Domain("mask leaves no valid forward action"));
            }
        }

        let mut is_eos = is_eos_forced.clone();
        for i in 0..n {
            if !is_source[i] && !is_eos_forced[i] {
                is_eos[i] = bernoulli_sample(decoded.eos_logits[i] as f64, rng);
            }
        }

        let mut actions = Vec::with_capacity(n);
        for i in 0..n {
            if is_eos[i] {
                actions.push(self.eos());
                continue;
            }
            let x = &states_from[i];
            let m = if is_source[i] { 0.0 } else { self.min_incr };
            let mut increments = vec![0.0f32; self.n_dim];
            for d in 0..self.n_dim {
                let r = decoded.mixture.sample(i, d, rng)? as f32;
                increments[d] = relative_to_absolute(x[d], r, m, self.max_val, false);
            }
            actions.push(increments);
        }
        trace!(
            env = %self.id,
            n,
            n_eos = is_eos.iter().filter(|&&e| e).count(),
            "sampled forward cube actions"
        );
        Ok(actions)
    }

    fn sample_backward(
        &self,
        decoded: &CubePolicyOutputs,
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<Vec<f32>>> {
        let n = states_from.len();
        let is_eos: Vec<bool> = (0..n).map(|i| !masks[[i, MASK_IDX_EOS]]).collect();
        let is_bts_forced: Vec<bool> = (0..n).map(|i| !masks[[i, MASK_IDX_SOURCE]]).collect();
        for i in 0..n {
            if !is_eos[i] && !is_bts_forced[i] && masks[[i, MASK_IDX_CONT]] {
                return Err(Error::Domain("mask leaves no valid backward action"));
            }
        }

        let mut is_bts = is_bts_forced.clone();
        for i in 0..n {
            if !is_bts_forced[i] && !is_eos[i] {
                is_bts[i] = bernoulli_sample(decoded.bts_logits[i] as f64, rng);
            }
        }

        let mut actions = Vec::with_capacity(n);
        for i in 0..n {
            let x = &states_from[i];
            if is_eos[i] {
                actions.push(self.eos());
            } else if is_bts[i] {
                actions.push(x.clone());
            } else {
                let mut decrements = vec![0.0f32; self.n_dim];
                for d in 0..self.n_dim {
                    let r = decoded.mixture.sample(i, d, rng)? as f32;
                    decrements[d] = relative_to_absolute(x[d], r, self.min_incr, self.max_val, true);
                }
                actions.push(decrements);
            }
        }
        trace!(
            env = %self.id,
            n,
            n_bts = is_bts.iter().filter(|&&b| b).count(),
            "sampled backward cube actions"
        );
        Ok(actions)
    }

    /// Mixture log-density of a continuous action plus the log-determinant of the Jacobian.
    fn continuous_logprob(
        &self,
        mixture: &MixtureParams,
        row: usize,
        x: &[f32],
        action: &[f32],
        m: f32,
        is_backward: bool,
    ) -> f64 {
        let mut lp = 0.0f64;
        for d in 0..self.n_dim {
            let r = absolute_to_relative(x[d], action[d], m, self.max_val, is_backward);
            lp += mixture.log_prob(row, d, r as f64);
            lp += log_jacobian_diag(x[d], m, self.max_val, is_backward);
        }
        lp
    }

    fn logprobs_forward(
        &self,
        decoded: &CubePolicyOutputs,
        actions: &[Vec<f32>],
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
    ) -> Result<Array1<f32>> {
        let n = states_from.len();
        let mut logprobs = Array1::<f32>::zeros(n);
        for i in 0..n {
            let is_source = !masks[[i, MASK_IDX_SOURCE]];
            let is_eos_forced = masks[[i, MASK_IDX_CONT]];
            if is_source && is_eos_forced {
                return Err(Error::Domain("EOS cannot be forced from the source state"));
            }
            let action_is_eos = is_eos_action(&actions[i]);
            if is_eos_forced {
                if !action_is_eos {
                    return Err(Error::Domain("only EOS is valid from a near-edge state"));
                }
                continue;
            }
            let mut lp = 0.0f64;
            if !is_source {
                lp += bernoulli_log_prob(decoded.eos_logits[i] as f64, action_is_eos);
            } else if action_is_eos {
                return Err(Error::Domain("EOS is invalid from the source state"));
            }
            if !action_is_eos {
                let m = if is_source { 0.0 } else { self.min_incr };
                lp += self.continuous_logprob(
                    &decoded.mixture,
                    i,
                    &states_from[i],
                    &actions[i],
                    m,
                    false,
                );
            }
            logprobs[i] = lp as f32;
        }
        Ok(logprobs)
    }

    fn logprobs_backward(
        &self,
        decoded: &CubePolicyOutputs,
        actions: &[Vec<f32>],
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
    ) -> Result<Array1<f32>> {
        let n = states_from.len();
        let mut logprobs = Array1::<f32>::zeros(n);
        for i in 0..n {
            let is_eos = !masks[[i, MASK_IDX_EOS]];
            let is_bts_forced = !masks[[i, MASK_IDX_SOURCE]];
            let x = &states_from[i];
            if is_eos {
                if !is_eos_action(&actions[i]) {
                    return Err(Error::Domain("only EOS is valid backward from a done state"));
                }
                continue;
            }
            if is_bts_forced {
                continue;
            }
            if masks[[i, MASK_IDX_CONT]] {
                return Err(Error::Domain("mask leaves no valid backward action"));
            }
            let is_bts = actions[i] == *x;
            let mut lp = bernoulli_log_prob(decoded.bts_logits[i] as f64, is_bts);
            if !is_bts {
                lp += self.continuous_logprob(
                    &decoded.mixture,
                    i,
                    x,
                    &actions[i],
                    self.min_incr,
                    true,
                );
            }
            logprobs[i] = lp as f32;
        }
        Ok(logprobs)
    }
}

impl Environment for ContinuousCube {
    type State = Vec<f32>;
    type Action = Vec<f32>;

    fn id(&self) -> EnvId {
        self.id
    }

    fn source(&self) -> &Vec<f32> {
        &self.source
    }

    fn state(&self) -> &Vec<f32> {
        &self.state
    }

    fn done(&self) -> bool {
        self.done
    }

    fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn set_state(&mut self, state: Vec<f32>, done: bool) {
        self.state = state;
        self.done = done;
    }

    fn reset(&mut self) {
        self.state = self.source.clone();
        self.done = false;
        self.n_actions = 0;
        self.id = EnvId::next();
    }

    /// The zero-increment representative of the continuous actions, and EOS.
    fn action_space(&self) -> Vec<Vec<f32>> {
        vec![vec![0.0; self.n_dim], self.eos()]
    }

    fn eos(&self) -> Vec<f32> {
        vec![f32::INFINITY; self.n_dim]
    }

    fn policy_output_dim(&self) -> usize {
        self.len_policy_output_cont() + 2
    }

    fn mask_dim(&self) -> usize {
        MASK_DIM
    }

    fn fixed_policy_output(&self) -> Array1<f32> {
        self.fixed_policy_output.clone()
    }

    fn random_policy_output(&self) -> Array1<f32> {
        self.random_policy_output.clone()
    }

    fn mask_invalid_actions_forward(&self, state: &Vec<f32>, done: bool) -> Vec<bool> {
        if done {
            return vec![true; MASK_DIM];
        }
        let mut mask = vec![false; MASK_DIM];
        if self.is_source(state) {
            mask[MASK_IDX_EOS] = true;
        } else {
            mask[MASK_IDX_SOURCE] = true;
        }
        if state.iter().any(|&x| x > self.max_val - self.min_incr) {
            mask[MASK_IDX_CONT] = true;
        }
        mask
    }

    fn mask_invalid_actions_backward(&self, state: &Vec<f32>, done: bool) -> Vec<bool> {
        let mut mask = vec![true; MASK_DIM];
        if done {
            mask[MASK_IDX_EOS] = false;
            return mask;
        }
        if state.iter().any(|&x| x < self.min_incr) {
            mask[MASK_IDX_SOURCE] = false;
            return mask;
        }
        mask[MASK_IDX_CONT] = false;
        mask
    }

    fn step(&mut self, action: &Vec<f32>) -> StepOutcome<Vec<f32>, Vec<f32>> {
        if self.done {
            debug!(env = %self.id, "forward step rejected: trajectory is done");
            return self.outcome(action, false);
        }
        if is_eos_action(action) && action.len() == self.n_dim {
            if self.is_source(&self.state) {
                debug!(env = %self.id, "forward step rejected: EOS from the source state");
                return self.outcome(action, false);
            }
            self.done = true;
            self.n_actions += 1;
            return self.outcome(action, true);
        }
        if !self.is_increment_action(action) {
            debug!(env = %self.id, ?action, "forward step rejected: malformed increments");
            return self.outcome(action, false);
        }
        self.apply_increments(action, false);
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn step_backwards(&mut self, action: &Vec<f32>) -> StepOutcome<Vec<f32>, Vec<f32>> {
        let action_is_eos = is_eos_action(action) && action.len() == self.n_dim;
        if self.done {
            if !action_is_eos {
                debug!(env = %self.id, "backward step rejected: only EOS undoes a done state");
                return self.outcome(action, false);
            }
            self.done = false;
            self.n_actions += 1;
            return self.outcome(action, true);
        }
        if action_is_eos {
            debug!(env = %self.id, "backward step rejected: EOS while not done");
            return self.outcome(action, false);
        }
        if !self.is_increment_action(action) {
            debug!(env = %self.id, ?action, "backward step rejected: malformed decrements");
            return self.outcome(action, false);
        }
        self.apply_increments(action, true);
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn sample_actions_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
        is_backward: bool,
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<Vec<f32>>> {
        self.check_batch(policy_outputs.nrows(), masks, states_from)?;
        let decoded = self.decode_policy_outputs(policy_outputs)?;
        if is_backward {
            self.sample_backward(&decoded, masks, states_from, rng)
        } else {
            self.sample_forward(&decoded, masks, states_from, rng)
        }
    }

    fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[Vec<f32>],
        masks: &ArrayView2<bool>,
        states_from: &[Vec<f32>],
        is_backward: bool,
    ) -> Result<Array1<f32>> {
        self.check_batch(policy_outputs.nrows(), masks, states_from)?;
        if actions.len() != states_from.len() || actions.iter().any(|a| a.len() != self.n_dim) {
            return Err(Error::Shape("actions must have one n_dim row per state"));
        }
        let decoded = self.decode_policy_outputs(policy_outputs)?;
        if is_backward {
            self.logprobs_backward(&decoded, actions, masks, states_from)
        } else {
            self.logprobs_forward(&decoded, actions, masks, states_from)
        }
    }

    /// Clip into `[0, max_val]` and map affinely onto `[-1, 1]`.
    fn state_to_policy(&self, state: &Vec<f32>) -> Vec<f32> {
        state
            .iter()
            .map(|&x| 2.0 * x.clamp(0.0, self.max_val) / self.max_val - 1.0)
            .collect()
    }

    fn state_to_readable(&self, state: &Vec<f32>) -> String {
        format_bracketed(state)
    }

    fn readable_to_state(&self, readable: &str) -> Result<Vec<f32>> {
        let state: Vec<f32> = parse_bracketed(readable)?;
        if state.len() != self.n_dim {
            return Err(Error::Parse(format!(
                "expected {} coordinates in {readable:?}",
                self.n_dim
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::masks_to_array;
    use ndarray::{array, Array2};
    use proptest::prelude::*;

    fn cube2d() -> ContinuousCube {
        ContinuousCube::new(&CubeConfig {
            n_dim: 2,
            n_comp: 3,
            ..CubeConfig::default()
        })
        .unwrap()
    }

    fn tile(row: &Array1<f32>, n: usize) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((n, row.len()));
        for mut r in out.rows_mut() {
            r.assign(row);
        }
        out
    }

    #[test]
    fn action_space_is_representative_plus_eos() {
        let env = cube2d();
        let space = env.action_space();
        assert_eq!(space.len(), 2);
        assert_eq!(space[0], vec![0.0, 0.0]);
        assert!(is_eos_action(&space[1]));
        assert!(!is_eos_action(&[f32::INFINITY, 0.3]));
    }

    #[test]
    fn policy_output_layout_decodes_back_to_params() {
        let env = cube2d();
        assert_eq!(env.policy_output_dim(), 2 * 3 * 3 + 2);
        let fixed = env.fixed_policy_output();
        assert_eq!(fixed.len(), env.policy_output_dim());
        for j in 0..6 {
            assert_eq!(fixed[3 * j], 1.0);
        }
        let batch = tile(&fixed, 2);
        let decoded = env.decode_policy_outputs(&batch.view()).unwrap();
        for &a in decoded.mixture.alphas.iter() {
            assert!((a - 2.0).abs() < 1e-2);
        }
        for &b in decoded.mixture.betas.iter() {
            assert!((b - 5.0).abs() < 1e-2);
        }
        assert_eq!(decoded.bts_logits[1], 1.0);
        assert_eq!(decoded.eos_logits[0], 1.0);

        let random = tile(&env.random_policy_output(), 1);
        let decoded = env.decode_policy_outputs(&random.view()).unwrap();
        assert!((decoded.mixture.alphas[[0, 1, 2]] - 1000.0).abs() < 1.0);

        let narrow = Array2::<f32>::zeros((1, 5));
        assert!(env.decode_policy_outputs(&narrow.view()).is_err());
    }

    #[test]
    fn state_to_policy_clips_and_rescales() {
        let env = cube2d();
        let cases: [([f32; 2], [f32; 2]); 4] = [
            ([0.0, 0.0], [-1.0, -1.0]),
            ([1.0, 1.0], [1.0, 1.0]),
            ([1.1, 1.00001], [1.0, 1.0]),
            ([-0.1, 0.25], [-1.0, -0.5]),
        ];
        for (state, expected) in cases {
            let got = env.state_to_policy(&state.to_vec());
            assert!(isclose(&got, &expected, 1e-6), "{state:?} -> {got:?}");
        }
    }

    #[test]
    fn forward_mask_truth_table() {
        let env = cube2d();
        let cases: [([f32; 2], [bool; 3]); 5] = [
            ([0.0, 0.0], [false, false, true]),
            ([0.1, 0.1], [false, true, false]),
            ([0.85, 0.0], [false, true, false]),
            ([1.0, 0.0], [true, true, false]),
            ([0.95, 0.95], [true, true, false]),
        ];
        for (state, expected) in cases {
            assert_eq!(
                env.mask_invalid_actions_forward(&state.to_vec(), false),
                expected.to_vec(),
                "state {state:?}"
            );
        }
        assert_eq!(
            env.mask_invalid_actions_forward(&vec![0.3, 0.5], true),
            vec![true; 3]
        );
    }

    #[test]
    fn backward_mask_truth_table() {
        let env = cube2d();
        assert_eq!(
            env.mask_invalid_actions_backward(&vec![0.3, 0.5], true),
            vec![true, true, false]
        );
        assert_eq!(
            env.mask_invalid_actions_backward(&vec![0.05, 0.5], false),
            vec![true, false, true]
        );
        assert_eq!(
            env.mask_invalid_actions_backward(&vec![0.3, 0.5], false),
            vec![false, true, true]
        );
        assert_eq!(
            env.mask_invalid_actions_backward(&vec![0.0, 0.0], false),
            vec![true, false, true]
        );
    }

    #[test]
    fn relative_to_absolute_known_values() {
        let m = 0.1f32;
        // (x, r, x_next) forward, non-source.
        for (x, r, next) in [
            (0.3f32, 0.0f32, 0.4f32),
            (0.5, 0.0, 0.6),
            (0.0, 0.1794, 0.26146),
            (0.3, 1.0, 1.0),
            (0.3, 0.5, 0.7),
            (0.27, 0.12, 0.4456),
            (0.85, 0.76, 0.988),
        ] {
            let a = relative_to_absolute(x, r, m, 1.0, false);
            assert!((x + a - next).abs() < 1e-5, "forward x={x} r={r}: {}", x + a);
        }
        // (x, r, x_prev) backward.
        for (x, r, prev) in [
            (1.0f32, 0.0f32, 0.9f32),
            (1.0, 1.0, 0.0),
            (1.0, 0.1794, 0.73854),
            (1.0, 0.9589, 0.03699),
            (0.3, 0.0, 0.2),
            (0.5, 1.0, 0.0),
        ] {
            let a = relative_to_absolute(x, r, m, 1.0, true);
            assert!((x - a - prev).abs() < 1e-5, "backward x={x} r={r}: {}", x - a);
        }
    }

    #[test]
    fn batched_conversions_match_scalar_and_reject_shape_mismatch() {
        let states = array![[0.3f32, 0.0], [0.5, 0.2]];
        let rel = array![[0.5f32, 0.25], [0.0, 1.0]];
        let min = array![[0.1f32, 0.0], [0.1, 0.1]];
        let abs =
            relative_to_absolute_increments(&states.view(), &rel.view(), &min.view(), 1.0, false)
                .unwrap();
        assert!((abs[[0, 0]] - 0.4).abs() < 1e-6);
        assert!((abs[[0, 1]] - 0.25).abs() < 1e-6);
        let back =
            absolute_to_relative_increments(&states.view(), &abs.view(), &min.view(), 1.0, false)
                .unwrap();
        for (a, b) in back.iter().zip(rel.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        let jac = jacobian_diag(&states.view(), &min.view(), 1.0, false).unwrap();
        assert!((jac[[0, 0]] - 1.0 / 0.6).abs() < 1e-6);
        let short = array![[0.1f32, 0.1]];
        assert!(
            relative_to_absolute_increments(&states.view(), &short.view(), &min.view(), 1.0, false)
                .is_err()
        );
    }

    #[test]
    fn trajectory_round_trip_snaps_to_source() {
        let mut env = cube2d();
        let out = env.step(&vec![0.3, 0.5]);
        assert!(out.valid);
        assert_eq!(out.state, vec![0.3, 0.5]);
        assert!(!env.done());

        let eos = env.eos();
        let out = env.step(&eos);
        assert!(out.valid && env.done());
        assert_eq!(env.state(), &vec![0.3, 0.5]);
        assert!(!env.step(&vec![0.1, 0.1]).valid);

        assert!(env.step_backwards(&eos).valid);
        assert!(!env.done());
        assert!(env.step_backwards(&vec![0.3, 0.5]).valid);
        assert_eq!(env.state(), &vec![0.0, 0.0]);
        assert_eq!(env.n_actions(), 4);
    }

    #[test]
    fn invalid_steps_leave_state_untouched() {
        let mut env = cube2d();
        let eos = env.eos();
        assert!(!env.step(&eos).valid, "EOS from source");
        assert!(!env.step(&vec![0.1]).valid, "wrong arity");
        assert!(!env.step(&vec![-0.1, 0.2]).valid, "negative increment");
        assert!(env.step(&vec![0.2, 0.2]).valid);
        assert!(!env.step_backwards(&eos).valid, "EOS backward while not done");
        assert_eq!(env.state(), &vec![0.2, 0.2]);
        assert_eq!(env.n_actions(), 1);
    }

    #[test]
    fn single_increment_from_non_source() {
        let mut env = ContinuousCube::new(&CubeConfig {
            n_dim: 1,
            ..CubeConfig::default()
        })
        .unwrap();
        env.set_state(vec![0.3], false);
        let a = relative_to_absolute(0.3, 0.0, env.min_incr(), env.max_val(), false);
        assert!((a - 0.1).abs() < 1e-7);
        env.step(&vec![a]);
        assert!((env.state()[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "state left the cube")]
    fn stepping_out_of_bounds_is_a_defect() {
        let mut env = cube2d();
        env.set_state(vec![0.9, 0.5], false);
        env.step(&vec![0.3, 0.0]);
    }

    #[test]
    fn reset_starts_a_new_trajectory() {
        let mut env = cube2d();
        let id = env.id();
        env.step(&vec![0.2, 0.4]);
        env.reset();
        assert_eq!(env.state(), env.source());
        assert_eq!(env.n_actions(), 0);
        assert_ne!(env.id(), id);
    }

    #[test]
    fn readable_round_trip() {
        let env = cube2d();
        let s = env.state_to_readable(&vec![0.25, 0.5]);
        assert_eq!(s, "[0.25 0.5]");
        assert_eq!(env.readable_to_state(&s).unwrap(), vec![0.25, 0.5]);
        assert!(env.readable_to_state("[0.1]").is_err());
    }

    #[test]
    fn terminating_state_helpers_cover_the_cube() {
        let env = cube2d();
        let grid = env.grid_terminating_states(9);
        assert_eq!(grid.len(), 9);
        assert!(grid.contains(&vec![0.0, 0.0]));
        assert!(grid.contains(&vec![1.0, 0.5]));
        let uniform = env.uniform_terminating_states(50, 3);
        assert_eq!(uniform.len(), 50);
        assert!(uniform
            .iter()
            .all(|s| s.iter().all(|&x| (0.0..=1.0).contains(&x))));
        assert_eq!(uniform, env.uniform_terminating_states(50, 3));
    }

    #[test]
    fn forced_actions_have_zero_logprob() {
        let env = cube2d();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut po = tile(&env.fixed_policy_output(), 3);
        // Noise must not matter for forced actions.
        for (k, v) in po.iter_mut().enumerate() {
            *v += ((k * 37 % 11) as f32 - 5.0) * 0.3;
        }

        // Forward: near-edge states force EOS.
        let states = vec![vec![0.95, 0.2], vec![0.3, 0.99], vec![1.0, 1.0]];
        let masks: Vec<Vec<bool>> = states
            .iter()
            .map(|s| env.mask_invalid_actions_forward(s, false))
            .collect();
        let masks = masks_to_array(&masks).unwrap();
        let actions = env
            .sample_actions_batch(&po.view(), &masks.view(), &states, false, &mut rng)
            .unwrap();
        assert!(actions.iter().all(|a| is_eos_action(a)));
        let lp = env
            .get_logprobs(&po.view(), &actions, &masks.view(), &states, false)
            .unwrap();
        assert!(lp.iter().all(|&v| v == 0.0));

        // Backward: coordinates below min_incr force BTS; done forces EOS.
        let states = vec![vec![0.05, 0.7], vec![0.5, 0.0], vec![0.4, 0.4]];
        let dones = [false, false, true];
        let masks: Vec<Vec<bool>> = states
            .iter()
            .zip(dones)
            .map(|(s, d)| env.mask_invalid_actions_backward(s, d))
            .collect();
        let masks = masks_to_array(&masks).unwrap();
        let actions = env
            .sample_actions_batch(&po.view(), &masks.view(), &states, true, &mut rng)
            .unwrap();
        assert_eq!(actions[0], states[0]);
        assert_eq!(actions[1], states[1]);
        assert!(is_eos_action(&actions[2]));
        let lp = env
            .get_logprobs(&po.view(), &actions, &masks.view(), &states, true)
            .unwrap();
        assert!(lp.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn eos_logprob_is_the_bernoulli_term() {
        let env = cube2d();
        let po = tile(&env.fixed_policy_output(), 1);
        let states = vec![vec![0.3, 0.5]];
        let masks = masks_to_array(&[env.mask_invalid_actions_forward(&states[0], false)]).unwrap();
        let lp = env
            .get_logprobs(&po.view(), &[env.eos()], &masks.view(), &states, false)
            .unwrap();
        let expected = crate::numeric::log_sigmoid(1.0) as f32;
        assert!((lp[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let env = cube2d();
        let po = tile(&env.fixed_policy_output(), 2);
        let states = vec![vec![0.3, 0.5]];
        let masks = masks_to_array(&[env.mask_invalid_actions_forward(&states[0], false)]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(env
            .sample_actions_batch(&po.view(), &masks.view(), &states, false, &mut rng)
            .is_err());
        // Source flagged while EOS is forced is contradictory.
        let po = tile(&env.fixed_policy_output(), 1);
        let bad = masks_to_array(&[vec![true, false, true]]).unwrap();
        assert!(env
            .sample_actions_batch(&po.view(), &bad.view(), &states, false, &mut rng)
            .is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]
        #[test]
        fn prop_relative_absolute_round_trip(
            r in 0.0f32..1.0,
            x_fwd in 0.0f32..0.85,
            x_bwd in 0.15f32..1.0,
        ) {
            let m = 0.1f32;
            let a = relative_to_absolute(x_fwd, r, m, 1.0, false);
            prop_assert!((absolute_to_relative(x_fwd, a, m, 1.0, false) - r).abs() < 1e-5);
            let a = relative_to_absolute(x_bwd, r, m, 1.0, true);
            prop_assert!((absolute_to_relative(x_bwd, a, m, 1.0, true) - r).abs() < 1e-5);
        }

        #[test]
        fn prop_forward_increments_stay_in_range(
            seed in any::<u64>(),
            xs in prop::collection::vec(0.0f32..0.9, 8),
        ) {
            let env = cube2d();
            // Never sample EOS so every row exercises the continuous branch.
            let mut params = DistrParams::fixed_default();
            params.bernoulli_eos_logit = -1e4;
            let row = env.policy_output(&params).unwrap();
            let mut states: Vec<Vec<f32>> = xs.chunks(2).map(|c| c.to_vec()).collect();
            states[0] = vec![0.0, 0.0];
            let po = tile(&row, states.len());
            let masks: Vec<Vec<bool>> = states
                .iter()
                .map(|s| env.mask_invalid_actions_forward(s, false))
                .collect();
            let masks = masks_to_array(&masks).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let actions = env
                .sample_actions_batch(&po.view(), &masks.view(), &states, false, &mut rng)
                .unwrap();
            for (s, a) in states.iter().zip(&actions) {
                let m = if env.is_source(s) { 0.0 } else { env.min_incr() };
                for d in 0..2 {
                    prop_assert!(a[d] >= m - 1e-6, "increment {} below {m}", a[d]);
                    prop_assert!(a[d] <= 1.0 - s[d] + 1e-6, "increment {} overshoots", a[d]);
                }
            }
        }
    }
}
