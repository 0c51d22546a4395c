//! # gfn_cube
//!
//! Environments for GFlowNet samplers, centred on the continuous hyper-cube.
//!
//! An agent builds an object action-by-action, starting from a distinguished *source*
//! state and finishing with an end-of-sequence (EOS) action. This crate owns the
//! environment side of that loop:
//!
//! - the state/action lifecycle (`step`, `step_backwards`, masks, readable forms),
//! - the *interpretation* of a policy network's flat output vector,
//! - batched sampling of actions and the log-probabilities of realized actions.
//!
//! It does not provide losses, replay buffers, a policy network or reward models; those
//! plug in through [`env::Environment`] and [`env::Proxy`].
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every sampling entry point takes the RNG.
//! - **Sampling and scoring agree**: `sample_actions_batch` and `get_logprobs` branch on
//!   the same mask entries, so forced actions always have log-probability exactly `0.0`.
//! - **No hidden clipping**: a continuous step that leaves `[0, max_val]` (beyond a
//!   `1e-6` tolerance) is a defect and panics; invalid actions are reported through
//!   [`env::StepOutcome::valid`], never silently repaired.
//!
//! ## The increment reparameterization
//!
//! Continuous actions are absolute increments, but the policy samples *relative*
//! increments `r ∈ [0, 1]` from a mixture of Beta distributions. With coordinate `x`,
//! minimum increment `m` and upper bound `M`:
//!
//! - forward: \(a = m + r(M - x - m)\)
//! - backward: \(a = m + r(x - m)\)
//!
//! Densities are evaluated in `r`-space, so the log-probability of an observed action adds
//! \(\sum_d \log|\partial r_d / \partial a_d|\) (the map is diagonal).
//!
//! ## Module map
//!
//! - `numeric`: casting and closeness helpers, stable log-space scalars
//! - `distr`: mixture-of-Beta, Bernoulli and categorical primitives
//! - `config`: serde-backed constructor parameters
//! - `env`: the `Environment` contract, step outcomes, trajectory ids, proxies
//! - `cube`: the multi-dimension-increment continuous cube (main implementation)
//! - `single_dim`: the cube variant that moves one dimension per action
//! - `grid`: a discrete hyper-grid implementing the same contract

pub mod config;
pub mod cube;
pub mod distr;
pub mod env;
pub mod grid;
pub mod numeric;
pub mod single_dim;

pub use config::{CubeConfig, DistrParams, GridConfig};
pub use cube::ContinuousCube;
pub use env::{score_terminating, EnvId, Environment, Proxy, StepOutcome};
pub use grid::Grid;
pub use single_dim::SingleDimCube;

/// gfn_cube error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("cannot parse readable state: {0}")]
    Parse(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
