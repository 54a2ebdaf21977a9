//! Custom differentiation hook shared by the execution strategies.
//!
//! A traversal splits into a forward half that returns whatever it must keep
//! for the backward half, and a backward half that consumes it. The reversible
//! orchestrator keeps one activation; the stored baseline keeps all of them.

use rand::rngs::StdRng;

use crate::error::Result;
use crate::learning::grads::ParamGrads;
use crate::routing::ArgBundle;
use crate::state::StackedState;
use crate::tensor::Tensor;

/// Result of a forward traversal.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardOutput {
    /// Recombined output, same shape as the input.
    pub output: Tensor,

    /// Auxiliary state of every layer, stacked on a trailing layer axis.
    pub state: StackedState,

    /// Debug telemetry, stacked like `state`. Never differentiated.
    pub debug: StackedState,
}

/// Result of a backward traversal.
#[derive(Clone, Debug)]
pub struct BackwardOutput {
    /// Gradient w.r.t. the traversal input.
    pub grad_input: Tensor,

    /// Gradients of every transformation parameter, keyed `blocks.{i}.{f|g}.{name}`.
    pub param_grads: ParamGrads,

    /// Input as recovered while walking backwards.
    pub reconstructed_input: Tensor,
}

pub trait Traversal: Send + Sync {
    /// Whatever the forward half keeps alive for the backward half.
    type Saved: Send;

    fn forward_traversal(
        &self,
        x: &Tensor,
        kwargs: &ArgBundle,
        rng: &mut StdRng,
    ) -> Result<(ForwardOutput, Self::Saved)>;

    fn backward_traversal(&self, saved: Self::Saved, grad_output: &Tensor) -> Result<BackwardOutput>;

    /// Number of activation-sized tensors held by `saved`.
    fn retained_activations(saved: &Self::Saved) -> usize;
}
