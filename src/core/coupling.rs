//! Additive coupling block.
//!
//! ```text
//! forward:   y1 = x1 + F(x2)        y2 = x2 + G(y1)
//! inverse:   x2 = y2 - G(y1)        x1 = y1 - F(x2)
//! ```
//!
//! The forward pass keeps nothing but its output: `x1`, `x2`, `F(x2)` and
//! `G(y1)` die with the call. `backward_pass` rebuilds them from `y` by
//! re-running G and F with their recorded randomness, and computes the
//! input gradient on the way.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::deterministic::{Deterministic, RngCapture, RngMode, Site};
use crate::error::{Branch, Result};
use crate::layers::Transform;
use crate::learning::grads::ParamGrads;
use crate::routing::LayerArgs;
use crate::state::StateMap;
use crate::tensor::{chunk2, concat2, ensure_same_shape, Tensor};

/// Randomness captured for one block during one forward call.
#[derive(Clone, Debug, Default)]
pub struct BlockReplay {
    pub f: RngCapture,
    pub g: RngCapture,
}

/// Output of one coupling step.
#[derive(Clone, Debug)]
pub struct BlockOutput {
    pub y: Tensor,
    pub state: StateMap,
    pub debug: StateMap,
}

#[derive(Debug)]
pub struct ReversibleBlock {
    index: usize,
    f: Deterministic,
    g: Deterministic,
}

impl ReversibleBlock {
    pub fn new(index: usize, f: Box<dyn Transform>, g: Box<dyn Transform>) -> Self {
        Self {
            index,
            f: Deterministic::new(
                f,
                Site {
                    block: index,
                    branch: Branch::F,
                },
            ),
            g: Deterministic::new(
                g,
                Site {
                    block: index,
                    branch: Branch::G,
                },
            ),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn f(&self) -> &dyn Transform {
        self.f.inner()
    }

    pub fn g(&self) -> &dyn Transform {
        self.g.inner()
    }

    pub fn param_count(&self) -> usize {
        self.f.inner().param_count() + self.g.inner().param_count()
    }

    pub fn forward(
        &self,
        x: &Tensor,
        args: &LayerArgs,
        replay: &mut BlockReplay,
        rng: &mut StdRng,
        mode: RngMode,
        training: bool,
    ) -> Result<BlockOutput> {
        let (x1, x2) = chunk2(x)?;

        let f_out = self
            .f
            .invoke(&x2, mode, &mut replay.f, rng, training, &args.f)?;
        ensure_same_shape("F output", &f_out.output, &x2)?;
        let y1 = x1 + &f_out.output;

        let g_out = self
            .g
            .invoke(&y1, mode, &mut replay.g, rng, training, &args.g)?;
        ensure_same_shape("G output", &g_out.output, &y1)?;
        let y2 = x2 + &g_out.output;

        tracing::trace!(block = self.index, "coupling forward");
        Ok(BlockOutput {
            y: concat2(&y1, &y2)?,
            state: f_out.state,
            debug: f_out.debug,
        })
    }

    /// Reconstruct `(x, dL/dx)` from `(y, dL/dy)`.
    pub fn backward_pass(
        &self,
        y: &Tensor,
        dy: &Tensor,
        args: &LayerArgs,
        replay: &BlockReplay,
        grads: &mut ParamGrads,
    ) -> Result<(Tensor, Tensor)> {
        ensure_same_shape("block gradient", y, dy)?;
        let (y1, y2) = chunk2(y)?;
        let (dy1, dy2) = chunk2(dy)?;

        let g = self.g.replay_vjp(
            &y1,
            &dy2,
            &replay.g,
            &args.g,
            &mut grads.scope(format!("blocks.{}.g", self.index)),
        )?;
        ensure_same_shape("G output", &g.output.output, &y2)?;
        let x2 = y2 - &g.output.output;
        let dx1 = dy1 + &g.grad_input;

        let f = self.f.replay_vjp(
            &x2,
            &dx1,
            &replay.f,
            &args.f,
            &mut grads.scope(format!("blocks.{}.f", self.index)),
        )?;
        ensure_same_shape("F output", &f.output.output, &y1)?;
        let x1 = y1 - &f.output.output;
        let dx2 = dy2 + &f.grad_input;

        tracing::trace!(block = self.index, "coupling backward");
        Ok((concat2(&x1, &x2)?, concat2(&dx1, &dx2)?))
    }

    /// Chain-rule backward from a kept input `x`; no reconstruction.
    ///
    /// `y1` is recomputed from `x` with F's recorded randomness, then both
    /// branches are differentiated exactly as in [`Self::backward_pass`].
    pub fn backward_from_input(
        &self,
        x: &Tensor,
        dy: &Tensor,
        args: &LayerArgs,
        replay: &BlockReplay,
        grads: &mut ParamGrads,
    ) -> Result<Tensor> {
        ensure_same_shape("block gradient", x, dy)?;
        let (x1, x2) = chunk2(x)?;
        let (dy1, dy2) = chunk2(dy)?;

        let mut scratch = StdRng::seed_from_u64(0);
        let mut f_capture = replay.f.clone();
        let f_out = self
            .f
            .invoke(&x2, RngMode::Replay, &mut f_capture, &mut scratch, true, &args.f)?;
        let y1 = x1 + &f_out.output;

        let g = self.g.replay_vjp(
            &y1,
            &dy2,
            &replay.g,
            &args.g,
            &mut grads.scope(format!("blocks.{}.g", self.index)),
        )?;
        let dx1 = dy1 + &g.grad_input;

        let f = self.f.replay_vjp(
            &x2,
            &dx1,
            &replay.f,
            &args.f,
            &mut grads.scope(format!("blocks.{}.f", self.index)),
        )?;
        let dx2 = dy2 + &f.grad_input;
        concat2(&dx1, &dx2)
    }

    /// Reconstruct `x` from `y` without computing gradients.
    pub fn inverse(&self, y: &Tensor, args: &LayerArgs, replay: &BlockReplay) -> Result<Tensor> {
        let (y1, y2) = chunk2(y)?;
        // Replay clones the capture; the scratch generator is never drawn from.
        let mut scratch = StdRng::seed_from_u64(0);
        let mut g_capture = replay.g.clone();
        let g = self
            .g
            .invoke(&y1, RngMode::Replay, &mut g_capture, &mut scratch, true, &args.g)?;
        let x2 = y2 - &g.output;

        let mut f_capture = replay.f.clone();
        let f = self
            .f
            .invoke(&x2, RngMode::Replay, &mut f_capture, &mut scratch, true, &args.f)?;
        let x1 = y1 - &f.output;
        concat2(&x1, &x2)
    }
}
