//! Layer transformations: the opaque F and G of each coupling block.
//!
//! The engine never looks inside a transformation. It needs two things:
//! a forward evaluation that may emit auxiliary state and debug tensors,
//! and a vector-Jacobian product that re-runs the same computation (same
//! randomness) and returns the input gradient. Parameter gradients are
//! pushed into the supplied [`GradScope`].
//!
//! Reference transformations:
//! - [`Zero`]: outputs zeros; a stack of zero blocks is the identity.
//! - [`Linear`]: dense map on the feature axis, optional dropout.
//! - [`FeedForward`]: linear → tanh → dropout → linear.
//! - [`CumulativeMemory`]: causal running mean that carries `S`/`Z`
//!   statistics across chunks.

pub mod feed_forward;
pub mod linear;
pub mod memory;
pub mod zero;

pub use feed_forward::FeedForward;
pub use linear::Linear;
pub use memory::{CumulativeMemory, STATES_ARG};
pub use zero::Zero;

use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::Result;
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::state::StateMap;
use crate::tensor::Tensor;

/// Call-scoped context: the randomness handle and train/eval mode.
pub struct CallCtx<'a> {
    pub rng: &'a mut StdRng,
    pub training: bool,
}

/// Output of one transformation call.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformOutput {
    pub output: Tensor,
    pub state: StateMap,
    pub debug: StateMap,
}

impl TransformOutput {
    pub fn plain(output: Tensor) -> Self {
        Self {
            output,
            state: StateMap::new(),
            debug: StateMap::new(),
        }
    }
}

/// Re-executed output plus the gradient w.r.t. the input.
#[derive(Clone, Debug)]
pub struct Vjp {
    pub output: TransformOutput,
    pub grad_input: Tensor,
}

/// Capability implemented by every F and G.
pub trait Transform: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn forward(&self, x: &Tensor, ctx: &mut CallCtx<'_>, args: &ArgBundle) -> Result<TransformOutput>;

    /// Re-run the forward computation and back-propagate `grad_output`.
    ///
    /// Must consume randomness from `ctx` in exactly the order `forward` does.
    fn vjp(
        &self,
        x: &Tensor,
        grad_output: &Tensor,
        ctx: &mut CallCtx<'_>,
        args: &ArgBundle,
        grads: &mut GradScope<'_>,
    ) -> Result<Vjp>;

    fn param_count(&self) -> usize {
        0
    }
}

/// Inverted-dropout mask, or `None` when dropout is inactive.
pub(crate) fn dropout_mask(shape: &[usize], p: f32, ctx: &mut CallCtx<'_>) -> Option<Tensor> {
    if !ctx.training || p <= 0.0 {
        return None;
    }
    if p >= 1.0 {
        return Some(Tensor::zeros(IxDyn(shape)));
    }
    let keep = 1.0 / (1.0 - p);
    let rng = &mut *ctx.rng;
    Some(Tensor::from_shape_simple_fn(IxDyn(shape), || {
        if rng.gen::<f32>() < p {
            0.0
        } else {
            keep
        }
    }))
}
