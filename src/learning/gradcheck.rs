//! Numerical gradient checks.
//!
//! The scalar loss is always `L(x) = Σ f(x) ⊙ probe`, so `dL/dy = probe` and
//! the analytic input gradient is whatever backward returns for `probe`.
//!
//! Two checks:
//! - [`finite_difference_input_grad`]: full central-difference gradient, one
//!   pair of evaluations per input element. Small tensors only.
//! - [`vjp_consistency`]: compares `<dL/dx, v>` with the central difference of
//!   `L` along a single direction `v`. Two evaluations regardless of size.
//!
//! Central differences in f32 carry an error of roughly `eps²·|f'''|` plus
//! `ulp(L)/eps`; `eps` around `1e-2` is a reasonable default for unit-scale
//! activations.

use rand::rngs::StdRng;

use crate::error::Result;
use crate::tensor::{ensure_same_shape, randn, Tensor};

/// `Σ f(x) ⊙ probe`, accumulated in f64.
fn probed_loss<F>(f: &mut F, x: &Tensor, probe: &Tensor) -> Result<f64>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let y = f(x)?;
    ensure_same_shape("probe", &y, probe)?;
    Ok(y.iter()
        .zip(probe.iter())
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum())
}

/// Central-difference estimate of `dL/dx` for every element of `x`.
///
/// `f` must be deterministic: reseed any randomness inside the closure.
pub fn finite_difference_input_grad<F>(mut f: F, x: &Tensor, probe: &Tensor, eps: f32) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let base: Vec<f32> = x.iter().copied().collect();
    let mut grad = Vec::with_capacity(base.len());
    let mut flat = base.clone();
    for i in 0..base.len() {
        flat[i] = base[i] + eps;
        let plus = probed_loss(&mut f, &Tensor::from_shape_vec(x.raw_dim(), flat.clone())?, probe)?;
        flat[i] = base[i] - eps;
        let minus = probed_loss(&mut f, &Tensor::from_shape_vec(x.raw_dim(), flat.clone())?, probe)?;
        flat[i] = base[i];
        grad.push(((plus - minus) / (2.0 * eps as f64)) as f32);
    }
    Ok(Tensor::from_shape_vec(x.raw_dim(), grad)?)
}

/// Random unit-norm direction with the given shape.
pub fn random_direction(shape: &[usize], rng: &mut StdRng) -> Tensor {
    let v = randn(shape, 1.0, rng);
    let n = crate::tensor::norm(&v);
    if n > 0.0 {
        v / n
    } else {
        v
    }
}

/// Central difference of `L` along `direction`.
pub fn directional_derivative<F>(
    mut f: F,
    x: &Tensor,
    probe: &Tensor,
    direction: &Tensor,
    eps: f32,
) -> Result<f32>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    ensure_same_shape("direction", x, direction)?;
    let plus = probed_loss(&mut f, &(x + &(direction * eps)), probe)?;
    let minus = probed_loss(&mut f, &(x - &(direction * eps)), probe)?;
    Ok(((plus - minus) / (2.0 * eps as f64)) as f32)
}

/// Analytic and numerical directional derivatives side by side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VjpCheck {
    pub analytic: f32,
    pub numeric: f32,
}

impl VjpCheck {
    pub fn abs_error(&self) -> f32 {
        (self.analytic - self.numeric).abs()
    }

    /// Relative error with a floor of 1 on the denominator.
    pub fn rel_error(&self) -> f32 {
        self.abs_error() / self.analytic.abs().max(self.numeric.abs()).max(1.0)
    }
}

/// Check a backward-computed `grad_input` against `f` along `direction`.
pub fn vjp_consistency<F>(
    f: F,
    x: &Tensor,
    probe: &Tensor,
    grad_input: &Tensor,
    direction: &Tensor,
    eps: f32,
) -> Result<VjpCheck>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    ensure_same_shape("grad_input", x, grad_input)?;
    let analytic = grad_input
        .iter()
        .zip(direction.iter())
        .map(|(&g, &v)| g * v)
        .sum();
    let numeric = directional_derivative(f, x, probe, direction, eps)?;
    Ok(VjpCheck { analytic, numeric })
}
