//! Activation tensors and the feature-axis helpers used by coupling.
//!
//! All split/concat operations act on the LAST axis. Activations are usually
//! `[batch, positions, features]` but only rank >= 1 is assumed.

use ndarray::{concatenate, Array2, ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Dense activation tensor.
pub type Tensor = ArrayD<f32>;

/// How the two coupling halves are merged into the external output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recombine {
    /// `(h1 + h2) / 2`; a stack of zero transforms is the identity.
    #[default]
    Mean,
    /// `h1 + h2`, the classic RevNet merge; a zero stack outputs `2x`.
    Sum,
}

/// Index of the feature axis.
pub fn feature_axis(x: &Tensor) -> Result<Axis> {
    match x.ndim() {
        0 => Err(EngineError::shape("feature axis of scalar", x.shape(), &[])),
        n => Ok(Axis(n - 1)),
    }
}

/// Width of the feature axis.
pub fn feature_dim(x: &Tensor) -> Result<usize> {
    Ok(x.len_of(feature_axis(x)?))
}

/// Split into two equal halves along the feature axis.
pub fn chunk2(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let axis = feature_axis(x)?;
    let width = x.len_of(axis);
    if width % 2 != 0 {
        return Err(EngineError::shape("odd feature width", x.shape(), &[width / 2, width - width / 2]));
    }
    let half = width / 2;
    let a = x.slice_axis(axis, Slice::from(..half)).to_owned();
    let b = x.slice_axis(axis, Slice::from(half..)).to_owned();
    Ok((a, b))
}

/// Concatenate two halves of identical shape along the feature axis.
pub fn concat2(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.shape() != b.shape() {
        return Err(EngineError::shape("coupling halves", a.shape(), b.shape()));
    }
    let axis = feature_axis(a)?;
    Ok(concatenate(axis, &[a.view(), b.view()])?)
}

/// `concat(x, x)`: seeds both coupling branches with the same input.
pub fn duplicate(x: &Tensor) -> Result<Tensor> {
    concat2(x, x)
}

/// Merge the final activation halves into the external output.
pub fn recombine(h: &Tensor, how: Recombine) -> Result<Tensor> {
    let (a, b) = chunk2(h)?;
    let sum = a + &b;
    Ok(match how {
        Recombine::Sum => sum,
        Recombine::Mean => sum * 0.5,
    })
}

/// Gradient of [`recombine`] w.r.t. the full activation.
pub fn recombine_grad(dy: &Tensor, how: Recombine) -> Result<Tensor> {
    let half = match how {
        Recombine::Sum => dy.clone(),
        Recombine::Mean => dy * 0.5,
    };
    concat2(&half, &half)
}

/// Gradient of [`duplicate`]: the two branch gradients are summed.
pub fn fold_duplicate_grad(dx: &Tensor) -> Result<Tensor> {
    let (a, b) = chunk2(dx)?;
    Ok(a + &b)
}

/// Fail with `ShapeMismatch` unless `a` and `b` have the same shape.
pub fn ensure_same_shape(context: &str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(EngineError::shape(context, a.shape(), b.shape()))
    }
}

/// View all leading axes as rows: `[..., d] -> [rows, d]`.
pub fn to_rows(x: &Tensor) -> Result<Array2<f32>> {
    let d = feature_dim(x)?;
    let rows = if d == 0 { 0 } else { x.len() / d };
    Ok(x.as_standard_layout().into_owned().into_shape_with_order((rows, d))?)
}

/// Inverse of [`to_rows`]: restore the leading axes and a (possibly new) width.
pub fn from_rows(rows: Array2<f32>, like: &Tensor) -> Result<Tensor> {
    let mut shape = like.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = rows.ncols();
    }
    Ok(rows.into_shape_with_order(IxDyn(&shape))?)
}

/// Largest absolute element-wise difference; `inf` when shapes differ.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    if a.shape() != b.shape() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Frobenius norm.
pub fn norm(x: &Tensor) -> f32 {
    x.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Deterministic Gaussian tensor, handy for tests and demos.
pub fn randn(shape: &[usize], std: f32, rng: &mut rand::rngs::StdRng) -> Tensor {
    use rand_distr::{Distribution, Normal};
    let std = if std.is_finite() && std > 0.0 { std } else { 1.0 };
    match Normal::new(0.0f32, std) {
        Ok(dist) => Tensor::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng)),
        Err(_) => Tensor::zeros(IxDyn(shape)),
    }
}
