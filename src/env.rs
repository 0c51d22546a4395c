//! The environment contract shared by every variant.
//!
//! An environment instance owns exactly one trajectory: a current state, a `done` flag, an
//! action counter and a process-unique [`EnvId`]. Batched operations (`sample_actions_batch`,
//! `get_logprobs`) are pure functions of their inputs and never touch the instance state,
//! so one instance can serve as the "interpreter" for a whole batch of trajectories.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(0);

/// Trajectory identifier, unique within the process. Renewed by [`Environment::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(u64);

impl EnvId {
    pub fn next() -> Self {
        Self(NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0)
    }
}

/// Result of `step`/`step_backwards`.
///
/// `valid == false` means the action was rejected and the state is unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<S, A> {
    pub state: S,
    pub action: A,
    pub valid: bool,
}

/// The state/action lifecycle every environment implements.
///
/// Masks are `Vec<bool>` where `true` flags an invalid action. In continuous environments
/// some entries are "special case" flags instead; each implementation documents its layout.
pub trait Environment {
    type State: Clone + PartialEq + fmt::Debug;
    type Action: Clone + PartialEq + fmt::Debug;

    fn id(&self) -> EnvId;
    fn source(&self) -> &Self::State;
    fn state(&self) -> &Self::State;
    fn done(&self) -> bool;
    fn n_actions(&self) -> usize;

    /// Overwrite the current state. Does not start a new trajectory.
    fn set_state(&mut self, state: Self::State, done: bool);

    /// Return to the source state and start a new trajectory (fresh id, zero actions).
    fn reset(&mut self);

    /// The (representative) action space.
    fn action_space(&self) -> Vec<Self::Action>;
    fn eos(&self) -> Self::Action;

    /// Width of the policy output this environment decodes.
    fn policy_output_dim(&self) -> usize;
    /// Length of the forward and backward masks.
    fn mask_dim(&self) -> usize;
    fn fixed_policy_output(&self) -> Array1<f32>;
    fn random_policy_output(&self) -> Array1<f32>;

    fn mask_invalid_actions_forward(&self, state: &Self::State, done: bool) -> Vec<bool>;
    fn mask_invalid_actions_backward(&self, state: &Self::State, done: bool) -> Vec<bool>;

    /// Forward mask of the current state.
    fn mask_forward(&self) -> Vec<bool> {
        self.mask_invalid_actions_forward(self.state(), self.done())
    }

    /// Backward mask of the current state.
    fn mask_backward(&self) -> Vec<bool> {
        self.mask_invalid_actions_backward(self.state(), self.done())
    }

    /// All parents of `state` and the actions leading from each parent to it.
    fn parents(
        &self,
        _state: &Self::State,
        _done: bool,
    ) -> Result<(Vec<Self::State>, Vec<Self::Action>)> {
        Err(Error::Unsupported("parent enumeration"))
    }

    fn step(&mut self, action: &Self::Action) -> StepOutcome<Self::State, Self::Action>;
    fn step_backwards(&mut self, action: &Self::Action)
        -> StepOutcome<Self::State, Self::Action>;

    /// Sample one action per row of `policy_outputs`, conditioned on `masks` and `states_from`.
    fn sample_actions_batch(
        &self,
        policy_outputs: &ArrayView2<f32>,
        masks: &ArrayView2<bool>,
        states_from: &[Self::State],
        is_backward: bool,
        rng: &mut impl rand::Rng,
    ) -> Result<Vec<Self::Action>>;

    /// Log-probability of each realized action under the policy outputs.
    fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[Self::Action],
        masks: &ArrayView2<bool>,
        states_from: &[Self::State],
        is_backward: bool,
    ) -> Result<Array1<f32>>;

    fn state_to_policy(&self, state: &Self::State) -> Vec<f32>;

    fn states_to_policy(&self, states: &[Self::State]) -> Result<Array2<f32>> {
        let rows: Vec<Vec<f32>> = states.iter().map(|s| self.state_to_policy(s)).collect();
        crate::numeric::states_to_array(&rows)
    }

    /// Encoding handed to the proxy. Same as the policy encoding unless overridden.
    fn state_to_proxy(&self, state: &Self::State) -> Vec<f32> {
        self.state_to_policy(state)
    }

    fn state_to_readable(&self, state: &Self::State) -> String;
    fn readable_to_state(&self, readable: &str) -> Result<Self::State>;
}

/// Scores terminal states. Must be deterministic for a fixed input.
pub trait Proxy<S> {
    fn score(&self, states: &[S]) -> Result<Array1<f32>>;
}

impl<S, F> Proxy<S> for F
where
    F: Fn(&[S]) -> Result<Array1<f32>>,
{
    fn score(&self, states: &[S]) -> Result<Array1<f32>> {
        self(states)
    }
}

/// Score the current states of a batch of finished environments.
///
/// Refuses to score anything that is not `done`.
pub fn score_terminating<E, P>(proxy: &P, envs: &[E]) -> Result<Array1<f32>>
where
    E: Environment,
    P: Proxy<E::State>,
{
    if envs.iter().any(|e| !e.done()) {
        return Err(Error::Domain("proxy may only score terminal states"));
    }
    let states: Vec<E::State> = envs.iter().map(|e| e.state().clone()).collect();
    let scores = proxy.score(&states)?;
    if scores.len() != states.len() {
        return Err(Error::Shape("proxy must return one score per state"));
    }
    Ok(scores)
}

/// Parse a bracketed, space-separated list of numbers such as `"[0.3 0.5]"`.
pub(crate) fn parse_bracketed<T: std::str::FromStr>(readable: &str) -> Result<Vec<T>> {
    let inner = readable
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| Error::Parse(format!("expected [..], got {readable:?}")))?;
    inner
        .split_whitespace()
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| Error::Parse(format!("bad element {tok:?} in {readable:?}")))
        })
        .collect()
}

/// Format values as `"[a b c]"`.
pub(crate) fn format_bracketed<T: fmt::Display>(values: &[T]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(" "))
}
