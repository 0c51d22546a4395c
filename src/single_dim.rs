//! Continuous hyper-cube where each action moves exactly one dimension.
//!
//! A forward "move" is a three-step cycle:
//! `Idle --Select(d)--> Selected(d) --Increment--> Incremented(d) --Deselect(d)--> Idle`,
//! and a trajectory ends with `Eos` from `Idle` once every dimension has left its source
//! value. Backward actions undo these transitions one at a time.
//!
//! Coordinates still at their source value are *unset* and stored as [`UNSET`]. Leaving the
//! unset value uses a zero minimum increment (the analogue of leaving the source in
//! [`crate::cube`]); going back to it backward is the back-to-source (BTS) decrement.
//!
//! ## Masks
//!
//! Length `n_dim + 5`: `[select, increment, deselect, special, eos, dim_0 .. dim_{n-1}]`,
//! `true` = invalid. `special` is `false` when the selected dimension is unset (forward) or
//! when BTS is forced on it (backward). Per-dimension flags are `false` for the dimensions
//! the next select or deselect may name: not near the edge in a forward `Idle` state, set in
//! a backward `Idle` state, and the selected one when a deselect (forward `Incremented`) or
//! an unselect (backward `Selected`) comes next. While an increment is pending they are all
//! `true`.
//!
//! ## Policy output
//!
//! `[mixture 3·D·C | forward selection D | EOS | backward selection D | BTS]`.

use crate::config::{CubeConfig, DistrParams};
use crate::cube::{absolute_to_relative, log_jacobian_diag, relative_to_absolute, BOUNDS_EPSILON};
use crate::distr::{
    bernoulli_log_prob, bernoulli_sample, beta_param_to_logit, sample_categorical_from_logits,
    MixtureParams,
};
use crate::env::{format_bracketed, parse_bracketed, EnvId, Environment, StepOutcome};
use crate::numeric::{log_softmax_masked, SOURCE_ATOL};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2};
use tracing::{debug, trace};

/// Stored value of a dimension that has not left the source.
pub const UNSET: f32 = -1.0;

pub const MASK_IDX_SELECT: usize = 0;
pub const MASK_IDX_INCREMENT: usize = 1;
pub const MASK_IDX_DESELECT: usize = 2;
pub const MASK_IDX_SPECIAL: usize = 3;
pub const MASK_IDX_EOS: usize = 4;
/// Offset of the per-dimension flags.
pub const MASK_IDX_DIMS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Selected,
    Incremented,
}

impl Stage {
    fn code(self) -> usize {
        match self {
            Stage::Idle => 0,
            Stage::Selected => 1,
            Stage::Incremented => 2,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Stage::Idle),
            1 => Some(Stage::Selected),
            2 => Some(Stage::Incremented),
            _ => None,
        }
    }
}

/// `dim` is `Some` exactly when `stage != Idle`.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleDimState {
    pub coords: Vec<f32>,
    pub stage: Stage,
    pub dim: Option<usize>,
}

impl SingleDimState {
    pub fn is_set(&self, d: usize) -> bool {
        self.coords[d] >= 0.0
    }

    /// Numeric value of dimension `d`, with unset dimensions at 0.
    pub fn value(&self, d: usize) -> f32 {
        self.coords[d].max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SingleDimAction {
    Select(usize),
    /// Absolute increment (forward) or decrement (backward) of the selected dimension.
    /// `source` marks leaving the unset value forward, or BTS backward.
    Increment { incr: f32, source: bool },
    Deselect(usize),
    Eos,
}

impl SingleDimAction {
    /// `(kind, value, flag)`; EOS is all `+inf`.
    pub fn to_tuple(self) -> [f32; 3] {
        match self {
            SingleDimAction::Select(d) => [0.0, d as f32, 0.0],
            SingleDimAction::Increment { incr, source } => {
                [1.0, incr, if source { 1.0 } else { 0.0 }]
            }
            SingleDimAction::Deselect(d) => [2.0, d as f32, 0.0],
            SingleDimAction::Eos => [f32::INFINITY; 3],
        }
    }

    pub fn from_tuple(t: [f32; 3]) -> Result<Self> {
        if t.iter().all(|&v| v == f32::INFINITY) {
            return Ok(SingleDimAction::Eos);
        }
        let as_index = |v: f32| -> Result<usize> {
            if v >= 0.0 && v.fract() == 0.0 {
                Ok(v as usize)
            } else {
                Err(Error::Domain("dimension index must be a non-negative integer"))
            }
        };
        match t[0] {
            k if k == 0.0 => Ok(SingleDimAction::Select(as_index(t[1])?)),
            k if k == 1.0 => Ok(SingleDimAction::Increment {
                incr: t[1],
                source: t[2] != 0.0,
            }),
            k if k == 2.0 => Ok(SingleDimAction::Deselect(as_index(t[1])?)),
            _ => Err(Error::Domain("unknown action kind")),
        }
    }
}

/// Single-dimension-increment continuous cube.
#[derive(Debug)]
pub struct SingleDimCube {
    n_dim: usize,
    max_val: f32,
    min_incr: f32,
    n_comp: usize,
    beta_params_min: f32,
    beta_params_max: f32,
    fixed_policy_output: Array1<f32>,
    random_policy_output: Array1<f32>,
    source: SingleDimState,
    state: SingleDimState,
    done: bool,
    n_actions: usize,
    id: EnvId,
}

impl SingleDimCube {
    pub fn new(cfg: &CubeConfig) -> Result<Self> {
        cfg.validate()?;
        let source = SingleDimState {
            coords: vec![UNSET; cfg.n_dim],
            stage: Stage::Idle,
            dim: None,
        };
        let mut env = Self {
            n_dim: cfg.n_dim,
            max_val: cfg.max_val,
            min_incr: cfg.min_incr_abs(),
            n_comp: cfg.n_comp,
            beta_params_min: cfg.beta_params_min,
            beta_params_max: cfg.beta_params_max,
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

    pub fn min_incr(&self) -> f32 {
        self.min_incr
    }

    fn len_mixture(&self) -> usize {
        3 * self.n_dim * self.n_comp
    }

    fn idx_fwd_select(&self) -> usize {
        self.len_mixture()
    }

    fn idx_eos(&self) -> usize {
        self.len_mixture() + self.n_dim
    }

    fn idx_bwd_select(&self) -> usize {
        self.idx_eos() + 1
    }

    fn idx_bts(&self) -> usize {
        self.idx_bwd_select() + self.n_dim
    }

    /// Deterministic policy output; selection logits are all zero.
    pub fn policy_output(&self, params: &DistrParams) -> Result<Array1<f32>> {
        let (min, max) = (self.beta_params_min as f64, self.beta_params_max as f64);
        let alpha = beta_param_to_logit(params.beta_alpha as f64, min, max)? as f32;
        let beta = beta_param_to_logit(params.beta_beta as f64, min, max)? as f32;
        let mut out = Array1::<f32>::zeros(self.idx_bts() + 1);
        for j in 0..self.n_dim * self.n_comp {
            out[3 * j] = params.beta_weights;
            out[3 * j + 1] = alpha;
            out[3 * j + 2] = beta;
        }
        out[self.idx_eos()] = params.bernoulli_eos_logit;
        out[self.idx_bts()] = params.bernoulli_source_logit;
        Ok(out)
    }

    fn is_near_edge(&self, state: &SingleDimState, d: usize) -> bool {
        state.is_set(d) && state.coords[d] > self.max_val - self.min_incr
    }

    fn dim_only_mask(&self, d: usize) -> Vec<bool> {
        let mut mask = vec![true; self.mask_dim()];
        mask[MASK_IDX_DIMS + d] = false;
        mask
    }

    fn check_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        states_from: &[SingleDimState],
    ) -> Result<()> {
        if policy_outputs.ncols() != self.policy_output_dim() {
            return Err(Error::Shape("policy output width must be 3 * n_dim * n_comp + 2 * n_dim + 2"));
        }
        if masks.ncols() != self.mask_dim() {
            return Err(Error::Shape("single-dim masks must have n_dim + 5 columns"));
        }
        let n = policy_outputs.nrows();
        if masks.nrows() != n || states_from.len() != n {
            return Err(Error::Shape("masks and states_from must match the policy batch"));
        }
        for state in states_from {
            if state.coords.len() != self.n_dim {
                return Err(Error::Shape("states must have n_dim coordinates"));
            }
            match (state.stage, state.dim) {
                (Stage::Idle, None) => {}
                (Stage::Selected | Stage::Incremented, Some(d)) if d < self.n_dim => {}
                _ => return Err(Error::Domain("stage and selected dimension disagree")),
            }
        }
        Ok(())
    }

    fn decode_mixture(&self, policy_outputs: &ArrayView2<f32>) -> Result<MixtureParams> {
        MixtureParams::from_interleaved(
            &policy_outputs.slice(s![.., ..self.len_mixture()]),
            self.n_dim,
            self.n_comp,
            self.beta_params_min,
            self.beta_params_max,
        )
    }

    /// Selection logits and invalid flags of a forward `Idle` choice: dimensions, then EOS.
    fn forward_choice(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        row: usize,
    ) -> (Vec<f64>, Vec<bool>) {
        let mut logits: Vec<f64> = (0..self.n_dim)
            .map(|d| policy_outputs[[row, self.idx_fwd_select() + d]] as f64)
            .collect();
        logits.push(policy_outputs[[row, self.idx_eos()]] as f64);
        let mut invalid: Vec<bool> = (0..self.n_dim)
            .map(|d| masks[[row, MASK_IDX_DIMS + d]])
            .collect();
        invalid.push(masks[[row, MASK_IDX_EOS]]);
        (logits, invalid)
    }

    fn backward_choice(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        row: usize,
    ) -> (Vec<f64>, Vec<bool>) {
        let logits = (0..self.n_dim)
            .map(|d| policy_outputs[[row, self.idx_bwd_select() + d]] as f64)
            .collect();
        let invalid = (0..self.n_dim)
            .map(|d| masks[[row, MASK_IDX_DIMS + d]])
            .collect();
        (logits, invalid)
    }

    /// `(x, m)` of a forward increment on dimension `d`.
    fn forward_origin(&self, state: &SingleDimState, d: usize) -> (f32, f32) {
        if state.is_set(d) {
            (state.coords[d], self.min_incr)
        } else {
            (0.0, 0.0)
        }
    }

    fn outcome(
        &self,
        action: &SingleDimAction,
        valid: bool,
    ) -> StepOutcome<SingleDimState, SingleDimAction> {
        StepOutcome {
            state: self.state.clone(),
            action: *action,
            valid,
        }
    }

    fn reject(
        &self,
        action: &SingleDimAction,
        reason: &str,
    ) -> StepOutcome<SingleDimState, SingleDimAction> {
        debug!(env = %self.id, ?action, stage = ?self.state.stage, reason, "single-dim step rejected");
        self.outcome(action, false)
    }

    fn commit_coordinate(&mut self, d: usize, value: f32, action: &SingleDimAction) {
        let value = if value.abs() <= SOURCE_ATOL { 0.0 } else { value };
        assert!(
            value >= -BOUNDS_EPSILON && value <= self.max_val + BOUNDS_EPSILON,
            "coordinate {d} left [0, {}]: value={value} action={action:?} from={:?}",
            self.max_val,
            self.state
        );
        self.state.coords[d] = value;
    }
}

impl Environment for SingleDimCube {
    type State = SingleDimState;
    type Action = SingleDimAction;

    fn id(&self) -> EnvId {
        self.id
    }

    fn source(&self) -> &SingleDimState {
        &self.source
    }

    fn state(&self) -> &SingleDimState {
        &self.state
    }

    fn done(&self) -> bool {
        self.done
    }

    fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn set_state(&mut self, state: SingleDimState, done: bool) {
        self.state = state;
        self.done = done;
    }

    fn reset(&mut self) {
        self.state = self.source.clone();
        self.done = false;
        self.n_actions = 0;
        self.id = EnvId::next();
    }

    /// Selections, one representative increment, deselections and EOS.
    fn action_space(&self) -> Vec<SingleDimAction> {
        let mut space: Vec<SingleDimAction> = (0..self.n_dim).map(SingleDimAction::Select).collect();
        space.push(SingleDimAction::Increment {
            incr: 0.0,
            source: false,
        });
        space.extend((0..self.n_dim).map(SingleDimAction::Deselect));
        space.push(SingleDimAction::Eos);
        space
    }

    fn eos(&self) -> SingleDimAction {
        SingleDimAction::Eos
    }

    fn policy_output_dim(&self) -> usize {
        self.idx_bts() + 1
    }

    fn mask_dim(&self) -> usize {
        MASK_IDX_DIMS + self.n_dim
    }

    fn fixed_policy_output(&self) -> Array1<f32> {
        self.fixed_policy_output.clone()
    }

    fn random_policy_output(&self) -> Array1<f32> {
        self.random_policy_output.clone()
    }

    fn mask_invalid_actions_forward(&self, state: &SingleDimState, done: bool) -> Vec<bool> {
        if done {
            return vec![true; self.mask_dim()];
        }
        match (state.stage, state.dim) {
            (Stage::Selected, Some(d)) => {
                let mut mask = vec![true; self.mask_dim()];
                mask[MASK_IDX_INCREMENT] = false;
                mask[MASK_IDX_SPECIAL] = state.is_set(d);
                mask
            }
            (Stage::Incremented, Some(d)) => {
                let mut mask = self.dim_only_mask(d);
                mask[MASK_IDX_DESELECT] = false;
                mask
            }
            _ => {
                let mut mask = vec![true; self.mask_dim()];
                let mut any_selectable = false;
                for d in 0..self.n_dim {
                    let near_edge = self.is_near_edge(state, d);
                    mask[MASK_IDX_DIMS + d] = near_edge;
                    any_selectable |= !near_edge;
                }
                mask[MASK_IDX_SELECT] = !any_selectable;
                mask[MASK_IDX_EOS] = (0..self.n_dim).any(|d| !state.is_set(d));
                mask
            }
        }
    }

    fn mask_invalid_actions_backward(&self, state: &SingleDimState, done: bool) -> Vec<bool> {
        let mut mask = vec![true; self.mask_dim()];
        if done {
            mask[MASK_IDX_EOS] = false;
            return mask;
        }
        match (state.stage, state.dim) {
            (Stage::Selected, Some(d)) => {
                let mut mask = self.dim_only_mask(d);
                mask[MASK_IDX_SELECT] = false;
                mask
            }
            (Stage::Incremented, Some(d)) => {
                mask[MASK_IDX_INCREMENT] = false;
                mask[MASK_IDX_SPECIAL] = !(state.value(d) < self.min_incr);
                mask
            }
            _ => {
                let mut any_set = false;
                for d in 0..self.n_dim {
                    mask[MASK_IDX_DIMS + d] = !state.is_set(d);
                    any_set |= state.is_set(d);
                }
                mask[MASK_IDX_DESELECT] = !any_set;
                mask
            }
        }
    }

    fn step(&mut self, action: &SingleDimAction) -> StepOutcome<SingleDimState, SingleDimAction> {
        if self.done {
            return self.reject(action, "trajectory is done");
        }
        match (*action, self.state.stage, self.state.dim) {
            (SingleDimAction::Select(d), Stage::Idle, _) => {
                if d >= self.n_dim || self.is_near_edge(&self.state, d) {
                    return self.reject(action, "dimension cannot be selected");
                }
                self.state.stage = Stage::Selected;
                self.state.dim = Some(d);
            }
            (SingleDimAction::Increment { incr, source }, Stage::Selected, Some(d)) => {
                if source == self.state.is_set(d) {
                    return self.reject(action, "source flag disagrees with the coordinate");
                }
                if !(incr.is_finite() && incr >= 0.0) {
                    return self.reject(action, "increment must be finite and non-negative");
                }
                let (x, _) = self.forward_origin(&self.state, d);
                self.commit_coordinate(d, x + incr, action);
                self.state.stage = Stage::Incremented;
            }
            (SingleDimAction::Deselect(d), Stage::Incremented, Some(sel)) if d == sel => {
                self.state.stage = Stage::Idle;
                self.state.dim = None;
            }
            (SingleDimAction::Eos, Stage::Idle, _) => {
                if (0..self.n_dim).any(|d| !self.state.is_set(d)) {
                    return self.reject(action, "EOS before every dimension left the source");
                }
                self.done = true;
            }
            _ => return self.reject(action, "action does not fit the current stage"),
        }
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn step_backwards(
        &mut self,
        action: &SingleDimAction,
    ) -> StepOutcome<SingleDimState, SingleDimAction> {
        if self.done {
            if *action != SingleDimAction::Eos {
                return self.reject(action, "only EOS undoes a done state");
            }
            self.done = false;
            self.n_actions += 1;
            return self.outcome(action, true);
        }
        match (*action, self.state.stage, self.state.dim) {
            (SingleDimAction::Deselect(d), Stage::Idle, _) => {
                if d >= self.n_dim || !self.state.is_set(d) {
                    return self.reject(action, "only set dimensions can be re-entered");
                }
                self.state.stage = Stage::Incremented;
                self.state.dim = Some(d);
            }
            (SingleDimAction::Increment { incr, source }, Stage::Incremented, Some(d)) => {
                let x = self.state.value(d);
                if source {
                    if (incr - x).abs() > SOURCE_ATOL {
                        return self.reject(action, "back-to-source must remove the whole value");
                    }
                    self.state.coords[d] = UNSET;
                } else {
                    if !(incr.is_finite() && incr >= 0.0) {
                        return self.reject(action, "decrement must be finite and non-negative");
                    }
                    self.commit_coordinate(d, x - incr, action);
                }
                self.state.stage = Stage::Selected;
            }
            (SingleDimAction::Select(d), Stage::Selected, Some(sel)) if d == sel => {
                self.state.stage = Stage::Idle;
                self.state.dim = None;
            }
            _ => return self.reject(action, "action does not undo the current stage"),
        }
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn sample_actions_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        states_from: &[SingleDimState],
        is_backward: bool,
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<SingleDimAction>> {
        self.check_batch(policy_outputs, masks, states_from)?;
        let mixture = self.decode_mixture(policy_outputs)?;
        let mut actions = Vec::with_capacity(states_from.len());
        for (i, state) in states_from.iter().enumerate() {
            let action = if is_backward {
                if !masks[[i, MASK_IDX_EOS]] {
                    SingleDimAction::Eos
                } else {
                    match (state.stage, state.dim) {
                        (Stage::Selected, Some(d)) => SingleDimAction::Select(d),
                        (Stage::Incremented, Some(d)) => {
                            let x = state.value(d);
                            let bts_forced = !masks[[i, MASK_IDX_SPECIAL]];
                            let is_bts = bts_forced
                                || bernoulli_sample(policy_outputs[[i, self.idx_bts()]] as f64, rng);
                            if is_bts {
                                SingleDimAction::Increment {
                                    incr: x,
                                    source: true,
                                }
                            } else {
                                let r = mixture.sample(i, d, rng)? as f32;
                                SingleDimAction::Increment {
                                    incr: relative_to_absolute(x, r, self.min_incr, self.max_val, true),
                                    source: false,
                                }
                            }
                        }
                        _ => {
                            let (logits, invalid) = self.backward_choice(policy_outputs, masks, i);
                            let d = sample_categorical_from_logits(&logits, &invalid, rng)?;
                            SingleDimAction::Deselect(d)
                        }
                    }
                }
            } else {
                match (state.stage, state.dim) {
                    (Stage::Selected, Some(d)) => {
                        let source = !masks[[i, MASK_IDX_SPECIAL]];
                        let (x, m) = if source {
                            (0.0, 0.0)
                        } else {
                            (state.coords[d], self.min_incr)
                        };
                        let r = mixture.sample(i, d, rng)? as f32;
                        SingleDimAction::Increment {
                            incr: relative_to_absolute(x, r, m, self.max_val, false),
                            source,
                        }
                    }
                    (Stage::Incremented, Some(d)) => SingleDimAction::Deselect(d),
                    _ => {
                        let (logits, invalid) = self.forward_choice(policy_outputs, masks, i);
                        let k = sample_categorical_from_logits(&logits, &invalid, rng)?;
                        if k == self.n_dim {
                            SingleDimAction::Eos
                        } else {
                            SingleDimAction::Select(k)
                        }
                    }
                }
            };
            actions.push(action);
        }
        trace!(env = %self.id, n = actions.len(), is_backward, "sampled single-dim actions");
        Ok(actions)
    }

    fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[SingleDimAction],
        masks: &ArrayView2<bool>,
        states_from: &[SingleDimState],
        is_backward: bool,
    ) -> Result<Array1<f32>> {
        self.check_batch(policy_outputs, masks, states_from)?;
        if actions.len() != states_from.len() {
            return Err(Error::Shape("one action per state is required"));
        }
        let mixture = self.decode_mixture(policy_outputs)?;
        let mismatch = || Error::Domain("action does not fit the state it was taken from");
        let mut logprobs = Array1::<f32>::zeros(actions.len());
        for (i, (state, action)) in states_from.iter().zip(actions).enumerate() {
            let lp: f64 = if is_backward {
                if !masks[[i, MASK_IDX_EOS]] {
                    if *action != SingleDimAction::Eos {
                        return Err(mismatch());
                    }
                    0.0
                } else {
                    match (state.stage, state.dim, *action) {
                        (Stage::Selected, Some(d), SingleDimAction::Select(a)) if a == d => 0.0,
                        (Stage::Incremented, Some(d), SingleDimAction::Increment { incr, source }) => {
                            let bts_forced = !masks[[i, MASK_IDX_SPECIAL]];
                            if bts_forced {
                                if !source {
                                    return Err(mismatch());
                                }
                                0.0
                            } else {
                                let bts_logit = policy_outputs[[i, self.idx_bts()]] as f64;
                                let mut lp = bernoulli_log_prob(bts_logit, source);
                                if !source {
                                    let x = state.value(d);
                                    let r = absolute_to_relative(x, incr, self.min_incr, self.max_val, true);
                                    lp += mixture.log_prob(i, d, r as f64);
                                    lp += log_jacobian_diag(x, self.min_incr, self.max_val, true);
                                }
                                lp
                            }
                        }
                        (Stage::Idle, None, SingleDimAction::Deselect(d)) if d < self.n_dim => {
                            let (logits, invalid) = self.backward_choice(policy_outputs, masks, i);
                            log_softmax_masked(&logits, &invalid)?[d]
                        }
                        _ => return Err(mismatch()),
                    }
                }
            } else {
                match (state.stage, state.dim, *action) {
                    (Stage::Selected, Some(d), SingleDimAction::Increment { incr, source }) => {
                        if source == state.is_set(d) {
                            return Err(mismatch());
                        }
                        let (x, m) = self.forward_origin(state, d);
                        let r = absolute_to_relative(x, incr, m, self.max_val, false);
                        mixture.log_prob(i, d, r as f64) + log_jacobian_diag(x, m, self.max_val, false)
                    }
                    (Stage::Incremented, Some(d), SingleDimAction::Deselect(a)) if a == d => 0.0,
                    (Stage::Idle, None, SingleDimAction::Select(_) | SingleDimAction::Eos) => {
                        let k = match *action {
                            SingleDimAction::Select(d) if d < self.n_dim => d,
                            SingleDimAction::Eos => self.n_dim,
                            _ => return Err(mismatch()),
                        };
                        let (logits, invalid) = self.forward_choice(policy_outputs, masks, i);
                        log_softmax_masked(&logits, &invalid)?[k]
                    }
                    _ => return Err(mismatch()),
                }
            };
            if lp == f64::NEG_INFINITY {
                return Err(Error::Domain("action is masked out"));
            }
            logprobs[i] = lp as f32;
        }
        Ok(logprobs)
    }

    /// Rescaled coordinates, set flags, stage one-hot, selected-dimension one-hot.
    fn state_to_policy(&self, state: &SingleDimState) -> Vec<f32> {
        let mut out = Vec::with_capacity(3 * self.n_dim + 3);
        out.extend(
            (0..self.n_dim).map(|d| 2.0 * state.value(d).min(self.max_val) / self.max_val - 1.0),
        );
        out.extend((0..self.n_dim).map(|d| if state.is_set(d) { 1.0 } else { 0.0 }));
        out.extend((0..3).map(|k| if state.stage.code() == k { 1.0 } else { 0.0 }));
        out.extend((0..self.n_dim).map(|d| if state.dim == Some(d) { 1.0 } else { 0.0 }));
        out
    }

    /// `"[x_0 .. x_{n-1} stage dim]"`, with `dim = -1` when idle.
    fn state_to_readable(&self, state: &SingleDimState) -> String {
        let mut values = state.coords.clone();
        values.push(state.stage.code() as f32);
        values.push(state.dim.map_or(-1.0, |d| d as f32));
        format_bracketed(&values)
    }

    fn readable_to_state(&self, readable: &str) -> Result<SingleDimState> {
        let values: Vec<f32> = parse_bracketed(readable)?;
        if values.len() != self.n_dim + 2 {
            return Err(Error::Parse(format!(
                "expected {} values in {readable:?}",
                self.n_dim + 2
            )));
        }
        let stage = Stage::from_code(values[self.n_dim] as i64)
            .ok_or_else(|| Error::Parse(format!("bad stage in {readable:?}")))?;
        let dim_code = values[self.n_dim + 1] as i64;
        let dim = match (stage, dim_code) {
            (Stage::Idle, -1) => None,
            (Stage::Selected | Stage::Incremented, d) if d >= 0 && (d as usize) < self.n_dim => {
                Some(d as usize)
            }
            _ => return Err(Error::Parse(format!("bad dimension in {readable:?}"))),
        };
        Ok(SingleDimState {
            coords: values[..self.n_dim].to_vec(),
            stage,
            dim,
        })
    }
}

/// Stack single-dim actions as `(kind, value, flag)` rows.
pub fn actions_to_array(actions: &[SingleDimAction]) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((actions.len(), 3));
    for (i, a) in actions.iter().enumerate() {
        let t = a.to_tuple();
        for k in 0..3 {
            out[[i, k]] = t[k];
        }
    }
    out
}
