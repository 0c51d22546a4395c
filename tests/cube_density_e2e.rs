use gfn_cube::numeric::masks_to_array;
use gfn_cube::{ContinuousCube, CubeConfig, Environment, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn tile(row: &Array1<f32>, n: usize) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((n, row.len()));
    for mut r in out.rows_mut() {
        r.assign(row);
    }
    out
}

fn cube_1d(n_comp: usize) -> Result<ContinuousCube> {
    ContinuousCube::new(&CubeConfig {
        n_dim: 1,
        n_comp,
        ..CubeConfig::default()
    })
}

/// A three-component policy row with concentrations well above 1, so the density is smooth
/// enough for a midpoint rule.
fn smooth_mixture_row(env: &ContinuousCube) -> Array1<f32> {
    let mut row = env.fixed_policy_output();
    let comps = [(0.4f32, -5.0f32, -4.2f32), (-0.3, -4.0, -5.5), (0.0, -4.6, -4.6)];
    for (c, &(w, a, b)) in comps.iter().enumerate() {
        row[3 * c] = w;
        row[3 * c + 1] = a;
        row[3 * c + 2] = b;
    }
    row
}

/// Midpoint-rule mass of `exp(logprob(a))` over `a ∈ [lo, hi]`, all from `state`.
fn continuous_mass(
    env: &ContinuousCube,
    row: &Array1<f32>,
    state: f32,
    done: bool,
    lo: f32,
    hi: f32,
    is_backward: bool,
) -> Result<f64> {
    let n = 20_000usize;
    let h = (hi - lo) as f64 / n as f64;
    let actions: Vec<Vec<f32>> = (0..n)
        .map(|k| vec![(lo as f64 + (k as f64 + 0.5) * h) as f32])
        .collect();
    let states = vec![vec![state]; n];
    let mask = if is_backward {
        env.mask_invalid_actions_backward(&states[0], done)
    } else {
        env.mask_invalid_actions_forward(&states[0], done)
    };
    let masks = masks_to_array(&vec![mask; n])?;
    let po = tile(row, n);
    let lp = env.get_logprobs(&po.view(), &actions, &masks.view(), &states, is_backward)?;
    Ok(lp.iter().map(|&v| (v as f64).exp() * h).sum())
}

fn single_logprob(
    env: &ContinuousCube,
    row: &Array1<f32>,
    state: Vec<f32>,
    action: Vec<f32>,
    is_backward: bool,
) -> Result<f64> {
    let mask = if is_backward {
        env.mask_invalid_actions_backward(&state, false)
    } else {
        env.mask_invalid_actions_forward(&state, false)
    };
    let masks = masks_to_array(&[mask])?;
    let po = tile(row, 1);
    let lp = env.get_logprobs(&po.view(), &[action], &masks.view(), &[state], is_backward)?;
    Ok(lp[0] as f64)
}

#[test]
fn forward_density_plus_eos_is_normalized() -> Result<()> {
    let env = cube_1d(3)?;
    let row = smooth_mixture_row(&env);
    let x = 0.3f32;
    let m = env.min_incr();
    let mass = continuous_mass(&env, &row, x, false, m, 1.0 - x, false)?;
    let eos = single_logprob(&env, &row, vec![x], env.eos(), false)?.exp();
    let total = mass + eos;
    assert!((total - 1.0).abs() < 2e-3, "mass={mass} eos={eos}");
    Ok(())
}

#[test]
fn density_from_source_is_normalized_without_eos() -> Result<()> {
    let env = cube_1d(1)?;
    let row = env.fixed_policy_output();
    let mass = continuous_mass(&env, &row, 0.0, false, 0.0, 1.0, false)?;
    assert!((mass - 1.0).abs() < 2e-3, "mass={mass}");
    Ok(())
}

#[test]
fn backward_density_plus_bts_is_normalized() -> Result<()> {
    let env = cube_1d(3)?;
    let row = smooth_mixture_row(&env);
    let x = 0.8f32;
    let m = env.min_incr();
    let mass = continuous_mass(&env, &row, x, false, m, x, true)?;
    let bts = single_logprob(&env, &row, vec![x], vec![x], true)?.exp();
    let total = mass + bts;
    assert!((total - 1.0).abs() < 2e-3, "mass={mass} bts={bts}");
    Ok(())
}

/// Randomized policy outputs and states: whatever is sampled must score a finite
/// log-probability, in both directions.
#[test]
fn sampled_actions_always_score_finite_logprobs() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let mut trials = 0usize;
    for n_dim in 1..=4usize {
        let env = ContinuousCube::new(&CubeConfig {
            n_dim,
            n_comp: 2,
            ..CubeConfig::default()
        })?;
        let width = env.policy_output_dim();
        for _ in 0..300 {
            let n = 8usize;
            let po = Array2::from_shape_fn((n, width), |_| rng.random_range(-6.0f32..6.0));
            let states: Vec<Vec<f32>> = (0..n)
                .map(|i| {
                    if i == 0 {
                        vec![0.0; n_dim]
                    } else {
                        (0..n_dim).map(|_| rng.random_range(0.0f32..=1.0)).collect()
                    }
                })
                .collect();
            let dones: Vec<bool> = (0..n).map(|i| i > 0 && rng.random_bool(0.2)).collect();

            let fwd: Vec<Vec<bool>> = states
                .iter()
                .map(|s| env.mask_invalid_actions_forward(s, false))
                .collect();
            let fwd = masks_to_array(&fwd)?;
            let actions = env.sample_actions_batch(&po.view(), &fwd.view(), &states, false, &mut rng)?;
            let lp = env.get_logprobs(&po.view(), &actions, &fwd.view(), &states, false)?;
            assert!(lp.iter().all(|v| v.is_finite()), "forward {lp:?} for {states:?}");

            let bwd: Vec<Vec<bool>> = states
                .iter()
                .zip(&dones)
                .map(|(s, &d)| env.mask_invalid_actions_backward(s, d))
                .collect();
            let bwd = masks_to_array(&bwd)?;
            let actions = env.sample_actions_batch(&po.view(), &bwd.view(), &states, true, &mut rng)?;
            let lp = env.get_logprobs(&po.view(), &actions, &bwd.view(), &states, true)?;
            assert!(lp.iter().all(|v| v.is_finite()), "backward {lp:?} for {states:?}");
            trials += 2 * n;
        }
    }
    assert!(trials >= 1000);
    Ok(())
}
