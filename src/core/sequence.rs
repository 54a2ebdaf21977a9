//! Reversible sequence orchestrator.
//!
//! Duplicates the input into two halves, runs the coupling blocks in order,
//! stacks their state and recombines the halves. The backward traversal
//! starts from the single retained output activation and walks the blocks in
//! reverse, reconstructing each block's input as it goes.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::core::coupling::{BlockReplay, ReversibleBlock};
use crate::core::deterministic::RngMode;
use crate::core::function::{BackwardOutput, ForwardOutput, Traversal};
use crate::error::{EngineError, Result};
use crate::layers::Transform;
use crate::learning::grads::ParamGrads;
use crate::routing::{route, ArgBundle, LayerArgs, RouteSpec};
use crate::state::{StackedState, StateMap};
use crate::tensor::{
    duplicate, fold_duplicate_grad, recombine, recombine_grad, Recombine, Tensor,
};

/// Everything a forward call leaves behind for its backward call.
///
/// Holds exactly one activation (the final duplicated activation), plus the
/// routed arguments and captured randomness of every block.
#[derive(Debug)]
pub struct ReversibleTrace {
    activation: Tensor,
    layer_args: Vec<LayerArgs>,
    replays: Vec<BlockReplay>,
    input_shape: Vec<usize>,
}

impl ReversibleTrace {
    /// Always one: the final duplicated activation. See [`Self::retained_elements`].
    pub fn retained_activations(&self) -> usize {
        1
    }

    /// Activation elements held for the backward pass.
    pub fn retained_elements(&self) -> usize {
        self.activation.len()
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn num_layers(&self) -> usize {
        self.replays.len()
    }

    pub fn activation(&self) -> &Tensor {
        &self.activation
    }
}

#[derive(Debug)]
pub struct ReversibleSequence {
    blocks: Vec<ReversibleBlock>,
    route: RouteSpec,
    recombine: Recombine,
}

impl ReversibleSequence {
    pub fn new(blocks: Vec<ReversibleBlock>, route: RouteSpec) -> Self {
        Self {
            blocks,
            route,
            recombine: Recombine::default(),
        }
    }

    /// Build blocks `0..N` from `(F, G)` pairs.
    pub fn from_pairs(pairs: Vec<(Box<dyn Transform>, Box<dyn Transform>)>, route: RouteSpec) -> Self {
        let blocks = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (f, g))| ReversibleBlock::new(i, f, g))
            .collect();
        Self::new(blocks, route)
    }

    pub fn with_recombine(mut self, recombine: Recombine) -> Self {
        self.recombine = recombine;
        self
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[ReversibleBlock] {
        &self.blocks
    }

    pub fn route_spec(&self) -> &RouteSpec {
        &self.route
    }

    pub fn recombine_mode(&self) -> Recombine {
        self.recombine
    }

    pub fn param_count(&self) -> usize {
        self.blocks.iter().map(ReversibleBlock::param_count).sum()
    }

    /// Forward traversal recording everything needed for [`Self::run_backward`].
    pub fn run_forward(
        &self,
        x: &Tensor,
        kwargs: &ArgBundle,
        rng: &mut StdRng,
    ) -> Result<(ForwardOutput, ReversibleTrace)> {
        let layer_args = route(kwargs, &self.route, self.blocks.len())?;
        let mut h = duplicate(x)?;

        let mut replays = Vec::with_capacity(self.blocks.len());
        let mut states = Vec::with_capacity(self.blocks.len());
        let mut debugs = Vec::with_capacity(self.blocks.len());
        for (block, args) in self.blocks.iter().zip(&layer_args) {
            let mut replay = BlockReplay::default();
            let out = block.forward(&h, args, &mut replay, rng, RngMode::Record, true)?;
            tracing::debug!(
                layer = block.index(),
                state_fields = out.state.len(),
                "reversible block forward"
            );
            h = out.y;
            replays.push(replay);
            states.push(out.state);
            debugs.push(out.debug);
        }

        let output = self.finish(&h, &states, &debugs)?;
        let trace = ReversibleTrace {
            activation: h,
            layer_args,
            replays,
            input_shape: x.shape().to_vec(),
        };
        Ok((output, trace))
    }

    /// Backward traversal. Consumes the trace.
    pub fn run_backward(&self, trace: ReversibleTrace, grad_output: &Tensor) -> Result<BackwardOutput> {
        if grad_output.shape() != trace.input_shape.as_slice() {
            return Err(EngineError::shape(
                "grad_output",
                grad_output.shape(),
                &trace.input_shape,
            ));
        }
        if trace.replays.len() != self.blocks.len() {
            return Err(EngineError::shape(
                "trace layers",
                &[trace.replays.len()],
                &[self.blocks.len()],
            ));
        }

        let mut grads = ParamGrads::new();
        let mut h = trace.activation;
        let mut dh = recombine_grad(grad_output, self.recombine)?;
        for ((block, args), replay) in self
            .blocks
            .iter()
            .zip(&trace.layer_args)
            .zip(&trace.replays)
            .rev()
        {
            let (x, dx) = block.backward_pass(&h, &dh, args, replay, &mut grads)?;
            tracing::debug!(layer = block.index(), "reversible block backward");
            h = x;
            dh = dx;
        }

        Ok(BackwardOutput {
            grad_input: fold_duplicate_grad(&dh)?,
            param_grads: grads,
            reconstructed_input: recombine(&h, Recombine::Mean)?,
        })
    }

    /// Evaluation-mode forward: no dropout, nothing recorded.
    pub fn infer(&self, x: &Tensor, kwargs: &ArgBundle, rng: &mut StdRng) -> Result<ForwardOutput> {
        let layer_args = route(kwargs, &self.route, self.blocks.len())?;
        let mut h = duplicate(x)?;
        let mut states = Vec::with_capacity(self.blocks.len());
        let mut debugs = Vec::with_capacity(self.blocks.len());
        for (block, args) in self.blocks.iter().zip(&layer_args) {
            let mut unused = BlockReplay::default();
            let out = block.forward(&h, args, &mut unused, rng, RngMode::Untracked, false)?;
            h = out.y;
            states.push(out.state);
            debugs.push(out.debug);
        }
        self.finish(&h, &states, &debugs)
    }

    /// Independent forward calls over several inputs, in parallel.
    ///
    /// Input `i` draws its randomness from `StdRng::seed_from_u64(seed + i)`,
    /// so the result does not depend on scheduling.
    pub fn forward_many(
        &self,
        inputs: &[Tensor],
        kwargs: &ArgBundle,
        seed: u64,
    ) -> Result<Vec<(ForwardOutput, ReversibleTrace)>> {
        inputs
            .par_iter()
            .enumerate()
            .map(|(i, x)| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                self.run_forward(x, kwargs, &mut rng)
            })
            .collect()
    }

    fn finish(&self, h: &Tensor, states: &[StateMap], debugs: &[StateMap]) -> Result<ForwardOutput> {
        Ok(ForwardOutput {
            output: recombine(h, self.recombine)?,
            state: StackedState::stack(states)?,
            debug: StackedState::stack(debugs)?,
        })
    }
}

impl Traversal for ReversibleSequence {
    type Saved = ReversibleTrace;

    fn forward_traversal(
        &self,
        x: &Tensor,
        kwargs: &ArgBundle,
        rng: &mut StdRng,
    ) -> Result<(ForwardOutput, ReversibleTrace)> {
        self.run_forward(x, kwargs, rng)
    }

    fn backward_traversal(&self, saved: ReversibleTrace, grad_output: &Tensor) -> Result<BackwardOutput> {
        self.run_backward(saved, grad_output)
    }

    fn retained_activations(saved: &ReversibleTrace) -> usize {
        saved.retained_activations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{CumulativeMemory, FeedForward, Linear, Zero};
    use crate::routing::{ArgValue, RouteTarget};
    use crate::tensor::{max_abs_diff, randn};
    use rand::Rng;

    type Pair = (Box<dyn Transform>, Box<dyn Transform>);

    fn pair(f: impl Transform + 'static, g: impl Transform + 'static) -> Pair {
        (Box::new(f), Box::new(g))
    }

    fn zero_stack(n: usize) -> ReversibleSequence {
        let pairs = (0..n).map(|_| pair(Zero, Zero)).collect();
        ReversibleSequence::from_pairs(pairs, RouteSpec::new())
    }

    fn dense_stack(n: usize, d: usize, dropout: f32) -> ReversibleSequence {
        let pairs = (0..n as u64)
            .map(|i| {
                pair(
                    Linear::new(d, d, dropout, 10 + i),
                    FeedForward::new(d, 2 * d, dropout, 20 + i),
                )
            })
            .collect();
        ReversibleSequence::from_pairs(pairs, RouteSpec::new())
    }

    #[test]
    fn test_zero_stack_is_identity() {
        let seq = zero_stack(2);
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[1, 4, 8], 1.0, &mut rng);
        let (out, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(out.output, x);
        assert!(out.state.is_empty());

        let dy = randn(&[1, 4, 8], 1.0, &mut rng);
        let back = seq.run_backward(trace, &dy).unwrap();
        assert_eq!(back.grad_input, dy);
        assert!(back.param_grads.is_empty());
    }

    #[test]
    fn test_sum_recombine_doubles() {
        let seq = zero_stack(1).with_recombine(Recombine::Sum);
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[2, 2, 4], 1.0, &mut rng);
        let (out, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(out.output, &x * 2.0);
        let back = seq.run_backward(trace, &Tensor::ones(x.raw_dim())).unwrap();
        assert!(back.grad_input.iter().all(|&g| g == 2.0));
    }

    #[test]
    fn test_backward_reconstructs_input() {
        let seq = dense_stack(3, 4, 0.25);
        let mut rng = StdRng::seed_from_u64(8);
        let x = randn(&[2, 3, 4], 1.0, &mut rng);
        let (out, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(trace.retained_activations(), 1);
        assert_eq!(trace.num_layers(), 3);

        let back = seq.run_backward(trace, &Tensor::ones(out.output.raw_dim())).unwrap();
        assert!(max_abs_diff(&back.reconstructed_input, &x) < 1e-4);
        assert_eq!(back.grad_input.shape(), x.shape());
        assert!(back.param_grads.get("blocks.2.g.w2").is_some());
        assert!(back.param_grads.all_finite());
    }

    #[test]
    fn test_grad_output_shape_checked() {
        let seq = dense_stack(1, 4, 0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[1, 2, 4], 1.0, &mut rng);
        let (_, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
        let wrong = Tensor::ones(ndarray::IxDyn(&[1, 2, 8]));
        assert!(matches!(
            seq.run_backward(trace, &wrong),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_route_failure_before_any_block() {
        let seq = dense_stack(2, 4, 0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let mut untouched = rng.clone();
        let x = Tensor::ones(ndarray::IxDyn(&[1, 2, 4]));
        let kwargs = ArgBundle::new().with("unrouted", 1.0f32);
        assert!(matches!(
            seq.run_forward(&x, &kwargs, &mut rng),
            Err(EngineError::RouteSpecMismatch { .. })
        ));
        assert_eq!(rng.gen::<u64>(), untouched.gen::<u64>());
    }

    #[test]
    fn test_state_stacked_across_layers() {
        let pairs = vec![pair(CumulativeMemory::new(3, 1), Zero), pair(Zero, Zero)];
        let seq = ReversibleSequence::from_pairs(pairs, RouteSpec::new());
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[2, 5, 6], 1.0, &mut rng);
        let out = seq.infer(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(out.state.num_layers, 2);
        assert_eq!(out.state.fields["S"].shape(), &[2, 3, 2]);
        assert_eq!(out.state.fields["Z"].shape(), &[2, 2]);
        // Layer 1 never produced S.
        let layer1 = out.state.slice_layer(1).unwrap();
        assert!(layer1["S"].iter().all(|&v| v == 0.0));
        assert_eq!(out.debug.fields["s_norm"].shape(), &[2, 2]);
    }

    #[test]
    fn test_scalar_routed_to_f_only() {
        let pairs = vec![pair(Linear::new(2, 2, 0.0, 1), Linear::new(2, 2, 0.0, 2))];
        let seq = ReversibleSequence::from_pairs(pairs, RouteSpec::new().shared("scale", RouteTarget::F));
        let mut rng = StdRng::seed_from_u64(0);
        let x = randn(&[1, 3, 2], 1.0, &mut rng);
        let plain = seq
            .infer(&x, &ArgBundle::new().with("scale", ArgValue::Scalar(1.0)), &mut rng)
            .unwrap();
        let scaled = seq
            .infer(&x, &ArgBundle::new().with("scale", ArgValue::Scalar(0.0)), &mut rng)
            .unwrap();
        assert!(max_abs_diff(&plain.output, &scaled.output) > 0.0);
    }

    #[test]
    fn test_forward_many_matches_sequential() {
        let seq = dense_stack(2, 4, 0.5);
        let mut init = StdRng::seed_from_u64(1);
        let inputs: Vec<Tensor> = (0..4).map(|_| randn(&[1, 3, 4], 1.0, &mut init)).collect();
        let parallel = seq.forward_many(&inputs, &ArgBundle::new(), 100).unwrap();
        for (i, (x, (out, _))) in inputs.iter().zip(&parallel).enumerate() {
            let mut rng = StdRng::seed_from_u64(100 + i as u64);
            let (expected, _) = seq.run_forward(x, &ArgBundle::new(), &mut rng).unwrap();
            assert_eq!(out, &expected);
        }
    }
}
