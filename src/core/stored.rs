//! Stored-activation executor.
//!
//! Runs the same coupling blocks as [`ReversibleSequence`] but keeps every
//! block input alive and differentiates by the ordinary chain rule. It costs
//! `N + 1` activations instead of one; useful as a reference when checking
//! reconstructed gradients.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::core::coupling::BlockReplay;
use crate::core::deterministic::RngMode;
use crate::core::function::{BackwardOutput, ForwardOutput, Traversal};
use crate::core::sequence::ReversibleSequence;
use crate::error::{EngineError, Result};
use crate::learning::grads::ParamGrads;
use crate::routing::{route, ArgBundle, LayerArgs};
use crate::state::StackedState;
use crate::tensor::{duplicate, fold_duplicate_grad, recombine, recombine_grad, Recombine, Tensor};

/// Execution strategy for a training step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecuteType {
    /// Keep only the output; rebuild inputs on the way back.
    #[default]
    Reversible,
    /// Keep every block input.
    Stored,
}

#[derive(Debug)]
pub struct StoredTrace {
    /// Input of every block, in layer order.
    inputs: Vec<Tensor>,
    output: Tensor,
    layer_args: Vec<LayerArgs>,
    replays: Vec<BlockReplay>,
    input_shape: Vec<usize>,
}

impl StoredTrace {
    pub fn retained_activations(&self) -> usize {
        self.inputs.len() + 1
    }

    /// Activation elements held for the backward pass.
    pub fn retained_elements(&self) -> usize {
        self.inputs.iter().map(|t| t.len()).sum::<usize>() + self.output.len()
    }

    pub fn block_input(&self, layer: usize) -> Option<&Tensor> {
        self.inputs.get(layer)
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }
}

/// Borrowing view of a sequence that executes it with stored activations.
#[derive(Clone, Copy, Debug)]
pub struct StoredExecutor<'a> {
    seq: &'a ReversibleSequence,
}

impl<'a> StoredExecutor<'a> {
    pub fn new(seq: &'a ReversibleSequence) -> Self {
        Self { seq }
    }

    pub fn run_forward(
        &self,
        x: &Tensor,
        kwargs: &ArgBundle,
        rng: &mut StdRng,
    ) -> Result<(ForwardOutput, StoredTrace)> {
        let blocks = self.seq.blocks();
        let layer_args = route(kwargs, self.seq.route_spec(), blocks.len())?;
        let mut h = duplicate(x)?;

        let mut inputs = Vec::with_capacity(blocks.len());
        let mut replays = Vec::with_capacity(blocks.len());
        let mut states = Vec::with_capacity(blocks.len());
        let mut debugs = Vec::with_capacity(blocks.len());
        for (block, args) in blocks.iter().zip(&layer_args) {
            let mut replay = BlockReplay::default();
            let out = block.forward(&h, args, &mut replay, rng, RngMode::Record, true)?;
            inputs.push(std::mem::replace(&mut h, out.y));
            replays.push(replay);
            states.push(out.state);
            debugs.push(out.debug);
        }

        let output = ForwardOutput {
            output: recombine(&h, self.seq.recombine_mode())?,
            state: StackedState::stack(&states)?,
            debug: StackedState::stack(&debugs)?,
        };
        let trace = StoredTrace {
            inputs,
            output: h,
            layer_args,
            replays,
            input_shape: x.shape().to_vec(),
        };
        Ok((output, trace))
    }

    pub fn run_backward(&self, trace: StoredTrace, grad_output: &Tensor) -> Result<BackwardOutput> {
        if grad_output.shape() != trace.input_shape.as_slice() {
            return Err(EngineError::shape(
                "grad_output",
                grad_output.shape(),
                &trace.input_shape,
            ));
        }
        let blocks = self.seq.blocks();
        if trace.inputs.len() != blocks.len() {
            return Err(EngineError::shape(
                "trace layers",
                &[trace.inputs.len()],
                &[blocks.len()],
            ));
        }

        let mut grads = ParamGrads::new();
        let mut dh = recombine_grad(grad_output, self.seq.recombine_mode())?;
        for (i, block) in blocks.iter().enumerate().rev() {
            dh = block.backward_from_input(
                &trace.inputs[i],
                &dh,
                &trace.layer_args[i],
                &trace.replays[i],
                &mut grads,
            )?;
        }

        let first = trace.inputs.first().unwrap_or(&trace.output);
        Ok(BackwardOutput {
            grad_input: fold_duplicate_grad(&dh)?,
            param_grads: grads,
            reconstructed_input: recombine(first, Recombine::Mean)?,
        })
    }
}

impl Traversal for StoredExecutor<'_> {
    type Saved = StoredTrace;

    fn forward_traversal(
        &self,
        x: &Tensor,
        kwargs: &ArgBundle,
        rng: &mut StdRng,
    ) -> Result<(ForwardOutput, StoredTrace)> {
        self.run_forward(x, kwargs, rng)
    }

    fn backward_traversal(&self, saved: StoredTrace, grad_output: &Tensor) -> Result<BackwardOutput> {
        self.run_backward(saved, grad_output)
    }

    fn retained_activations(saved: &StoredTrace) -> usize {
        saved.retained_activations()
    }
}
