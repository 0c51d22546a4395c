//! Numeric helpers shared by every environment.
//!
//! Two families live here:
//! - casting helpers that turn per-environment `Vec`s into the `ndarray` batches the
//!   sampling/log-prob routines consume (`states_to_array`, `masks_to_array`),
//! - small log-space scalars (`log_sigmoid`, `logsumexp`, `log_softmax_masked`) written so
//!   that they never produce `NaN` for finite inputs.
//!
//! Scalars are computed in `f64`; callers downcast at the boundary.

use crate::{Error, Result};
use ndarray::Array2;

/// Absolute tolerance used to snap states back to the source.
pub const SOURCE_ATOL: f32 = 1e-6;

/// Element-wise `|a_i - b_i| <= atol` over two equal-length slices.
///
/// Slices of different lengths are never close.
pub fn isclose(a: &[f32], b: &[f32], atol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| (x - y).abs() <= atol)
}

/// Stack equal-length float rows into an `n × d` array.
pub fn states_to_array(rows: &[Vec<f32>]) -> Result<Array2<f32>> {
    stack_rows(rows, 0.0)
}

/// Stack equal-length boolean rows (masks) into an `n × d` array.
pub fn masks_to_array(rows: &[Vec<bool>]) -> Result<Array2<bool>> {
    stack_rows(rows, false)
}

fn stack_rows<T: Copy>(rows: &[Vec<T>], fill: T) -> Result<Array2<T>> {
    let d = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != d) {
        return Err(Error::Shape("rows must all have the same length"));
    }
    let mut out = Array2::from_elem((rows.len(), d), fill);
    for (i, row) in rows.iter().enumerate() {
        for (k, &v) in row.iter().enumerate() {
            out[[i, k]] = v;
        }
    }
    Ok(out)
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Inverse of [`sigmoid`]. Returns `±inf` at the closed ends of `[0, 1]`.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// `ln(sigmoid(x))`, stable for large `|x|`.
#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// `ln Σ exp(x_i)`. Empty input (or all `-inf`) yields `-inf`.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let s: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + s.ln()
}

/// Log-softmax over the entries whose `invalid` flag is false.
///
/// Invalid entries get `-inf`. With exactly one valid entry its log-probability is `0.0`
/// exactly, which is what makes forced discrete actions score zero.
pub fn log_softmax_masked(logits: &[f64], invalid: &[bool]) -> Result<Vec<f64>> {
    if logits.len() != invalid.len() {
        return Err(Error::Shape("logits and mask must have the same length"));
    }
    let valid: Vec<f64> = logits
        .iter()
        .zip(invalid)
        .filter(|&(_, &inv)| !inv)
        .map(|(&l, _)| l)
        .collect();
    if valid.is_empty() {
        return Err(Error::Domain("mask leaves no valid entry"));
    }
    let lse = logsumexp(&valid);
    Ok(logits
        .iter()
        .zip(invalid)
        .map(|(&l, &inv)| if inv { f64::NEG_INFINITY } else { l - lse })
        .collect())
}
