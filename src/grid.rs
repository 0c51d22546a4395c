//! Discrete hyper-grid.
//!
//! States are `n_dim` cell indices in `[0, length)`, starting from all zeros. An action moves
//! one dimension forward by `1..=max_step_len` cells; EOS ends the trajectory from any state.
//! The action space is finite, so masks cover every action and `parents` is exact. Stepping
//! with an action outside the action space is a defect and panics.

use crate::config::GridConfig;
use crate::distr::sample_categorical_from_logits;
use crate::env::{format_bracketed, parse_bracketed, EnvId, Environment, StepOutcome};
use crate::numeric::log_softmax_masked;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView2};
use tracing::debug;

/// Move `dim` forward by `steps` cells. EOS is `dim == n_dim, steps == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridAction {
    pub dim: usize,
    pub steps: usize,
}

#[derive(Debug)]
pub struct Grid {
    n_dim: usize,
    length: usize,
    max_step_len: usize,
    action_space: Vec<GridAction>,
    source: Vec<usize>,
    state: Vec<usize>,
    done: bool,
    n_actions: usize,
    id: EnvId,
}

impl Grid {
    pub fn new(cfg: &GridConfig) -> Result<Self> {
        cfg.validate()?;
        let mut action_space: Vec<GridAction> = (0..cfg.n_dim)
            .flat_map(|dim| (1..=cfg.max_step_len).map(move |steps| GridAction { dim, steps }))
            .collect();
        action_space.push(GridAction {
            dim: cfg.n_dim,
            steps: 0,
        });
        Ok(Self {
            n_dim: cfg.n_dim,
            length: cfg.length,
            max_step_len: cfg.max_step_len,
            action_space,
            source: vec![0; cfg.n_dim],
            state: vec![0; cfg.n_dim],
            done: false,
            n_actions: 0,
            id: EnvId::next(),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Position of `action` in the action space.
    pub fn action_index(&self, action: &GridAction) -> Option<usize> {
        if *action == self.eos() {
            Some(self.action_space.len() - 1)
        } else if action.dim < self.n_dim && (1..=self.max_step_len).contains(&action.steps) {
            Some(action.dim * self.max_step_len + action.steps - 1)
        } else {
            None
        }
    }

    /// Every state of the grid, in row-major order.
    pub fn all_states(&self) -> Vec<Vec<usize>> {
        let total = self.length.pow(self.n_dim as u32);
        (0..total)
            .map(|mut flat| {
                let mut state = vec![0; self.n_dim];
                for d in (0..self.n_dim).rev() {
                    state[d] = flat % self.length;
                    flat /= self.length;
                }
                state
            })
            .collect()
    }

    fn check_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        n_states: usize,
    ) -> Result<()> {
        if policy_outputs.ncols() != self.action_space.len() || masks.ncols() != self.action_space.len()
        {
            return Err(Error::Shape("grid batches need one column per action"));
        }
        if policy_outputs.nrows() != n_states || masks.nrows() != n_states {
            return Err(Error::Shape("masks and states_from must match the policy batch"));
        }
        Ok(())
    }

    fn outcome(&self, action: &GridAction, valid: bool) -> StepOutcome<Vec<usize>, GridAction> {
        StepOutcome {
            state: self.state.clone(),
            action: *action,
            valid,
        }
    }
}

impl Environment for Grid {
    type State = Vec<usize>;
    type Action = GridAction;

    fn id(&self) -> EnvId {
        self.id
    }

    fn source(&self) -> &Vec<usize> {
        &self.source
    }

    fn state(&self) -> &Vec<usize> {
        &self.state
    }

    fn done(&self) -> bool {
        self.done
    }

    fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn set_state(&mut self, state: Vec<usize>, done: bool) {
        self.state = state;
        self.done = done;
    }

    fn reset(&mut self) {
        self.state = self.source.clone();
        self.done = false;
        self.n_actions = 0;
        self.id = EnvId::next();
    }

    fn action_space(&self) -> Vec<GridAction> {
        self.action_space.clone()
    }

    fn eos(&self) -> GridAction {
        GridAction {
            dim: self.n_dim,
            steps: 0,
        }
    }

    fn policy_output_dim(&self) -> usize {
        self.action_space.len()
    }

    fn mask_dim(&self) -> usize {
        self.action_space.len()
    }

    /// Uniform logits.
    fn fixed_policy_output(&self) -> Array1<f32> {
        Array1::zeros(self.action_space.len())
    }

    fn random_policy_output(&self) -> Array1<f32> {
        Array1::zeros(self.action_space.len())
    }

    fn mask_invalid_actions_forward(&self, state: &Vec<usize>, done: bool) -> Vec<bool> {
        if done {
            return vec![true; self.action_space.len()];
        }
        self.action_space
            .iter()
            .map(|a| a.dim < self.n_dim && state[a.dim] + a.steps >= self.length)
            .collect()
    }

    fn mask_invalid_actions_backward(&self, state: &Vec<usize>, done: bool) -> Vec<bool> {
        if done {
            return self.action_space.iter().map(|a| *a != self.eos()).collect();
        }
        self.action_space
            .iter()
            .map(|a| a.dim >= self.n_dim || state[a.dim] < a.steps)
            .collect()
    }

    fn parents(&self, state: &Vec<usize>, done: bool) -> Result<(Vec<Vec<usize>>, Vec<GridAction>)> {
        if done {
            return Ok((vec![state.clone()], vec![self.eos()]));
        }
        let mask = self.mask_invalid_actions_backward(state, false);
        let mut parents = Vec::new();
        let mut actions = Vec::new();
        for (a, invalid) in self.action_space.iter().zip(mask) {
            if invalid {
                continue;
            }
            let mut parent = state.clone();
            parent[a.dim] -= a.steps;
            parents.push(parent);
            actions.push(*a);
        }
        Ok((parents, actions))
    }

    fn step(&mut self, action: &GridAction) -> StepOutcome<Vec<usize>, GridAction> {
        let idx = self
            .action_index(action)
            .unwrap_or_else(|| panic!("{action:?} is not in the grid action space"));
        if self.mask_forward()[idx] {
            debug!(env = %self.id, ?action, "grid step rejected: masked");
            return self.outcome(action, false);
        }
        if *action == self.eos() {
            self.done = true;
        } else {
            self.state[action.dim] += action.steps;
        }
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn step_backwards(&mut self, action: &GridAction) -> StepOutcome<Vec<usize>, GridAction> {
        let idx = self
            .action_index(action)
            .unwrap_or_else(|| panic!("{action:?} is not in the grid action space"));
        if self.mask_backward()[idx] {
            debug!(env = %self.id, ?action, "grid backward step rejected: masked");
            return self.outcome(action, false);
        }
        if *action == self.eos() {
            self.done = false;
        } else {
            self.state[action.dim] -= action.steps;
        }
        self.n_actions += 1;
        self.outcome(action, true)
    }

    fn sample_actions_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        states_from: &[Vec<usize>],
        _is_backward: bool,
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<GridAction>> {
        self.check_batch(policy_outputs, masks, states_from.len())?;
        let mut actions = Vec::with_capacity(states_from.len());
        for (logits, mask) in policy_outputs.rows().into_iter().zip(masks.rows()) {
            let logits: Vec<f64> = logits.iter().map(|&l| l as f64).collect();
            let idx = sample_categorical_from_logits(&logits, &mask.to_vec(), rng)?;
            actions.push(self.action_space[idx]);
        }
        Ok(actions)
    }

    fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[GridAction],
        masks: &ArrayView2<bool>,
        states_from: &[Vec<usize>],
        _is_backward: bool,
    ) -> Result<Array1<f32>> {
        self.check_batch(policy_outputs, masks, states_from.len())?;
        if actions.len() != states_from.len() {
            return Err(Error::Shape("one action per state is required"));
        }
        let mut out = Array1::<f32>::zeros(actions.len());
        for (i, action) in actions.iter().enumerate() {
            let idx = self
                .action_index(action)
                .ok_or(Error::Domain("action is not in the action space"))?;
            let logits: Vec<f64> = policy_outputs.row(i).iter().map(|&l| l as f64).collect();
            let invalid = masks.row(i).to_vec();
            let lp = log_softmax_masked(&logits, &invalid)?[idx];
            if lp == f64::NEG_INFINITY {
                return Err(Error::Domain("action is masked out"));
            }
            out[i] = lp as f32;
        }
        Ok(out)
    }

    /// One-hot cell per dimension.
    fn state_to_policy(&self, state: &Vec<usize>) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_dim * self.length];
        for (d, &cell) in state.iter().enumerate() {
            out[d * self.length + cell] = 1.0;
        }
        out
    }

    fn state_to_readable(&self, state: &Vec<usize>) -> String {
        format_bracketed(state)
    }

    fn readable_to_state(&self, readable: &str) -> Result<Vec<usize>> {
        let state: Vec<usize> = parse_bracketed(readable)?;
        if state.len() != self.n_dim || state.iter().any(|&c| c >= self.length) {
            return Err(Error::Parse(format!(
                "expected {} cells below {} in {readable:?}",
                self.n_dim, self.length
            )));
        }
        Ok(state)
    }
}
