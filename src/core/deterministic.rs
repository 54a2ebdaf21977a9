//! Deterministic wrapper that replays the randomness of a transformation.
//!
//! The forward pass records the generator state a transformation is about to
//! consume; backward reconstruction replays it so dropout masks and other
//! stochastic choices are bit-identical. The captured state is a call-local
//! [`RngCapture`] owned by the trace, never by the wrapper, so one block can
//! serve concurrent forward/backward pairs.

use rand::rngs::StdRng;

use crate::error::{Branch, EngineError, Result};
use crate::layers::{CallCtx, Transform, TransformOutput, Vjp};
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::tensor::Tensor;

/// What to do with randomness on this invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RngMode {
    /// Snapshot the generator before running (forward pass of a training call).
    Record,
    /// Run on a clone of the snapshot (reconstruction).
    Replay,
    /// Run on the caller's generator, record nothing (inference).
    Untracked,
}

/// Generator state captured by a `Record` invocation.
#[derive(Clone, Debug, Default)]
pub struct RngCapture {
    state: Option<StdRng>,
}

impl RngCapture {
    pub fn is_recorded(&self) -> bool {
        self.state.is_some()
    }
}

/// Where a wrapped transformation sits, for error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Site {
    pub block: usize,
    pub branch: Branch,
}

#[derive(Debug)]
pub struct Deterministic {
    inner: Box<dyn Transform>,
    site: Site,
}

impl Deterministic {
    pub fn new(inner: Box<dyn Transform>, site: Site) -> Self {
        Self { inner, site }
    }

    pub fn inner(&self) -> &dyn Transform {
        self.inner.as_ref()
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn invoke(
        &self,
        x: &Tensor,
        mode: RngMode,
        capture: &mut RngCapture,
        rng: &mut StdRng,
        training: bool,
        args: &ArgBundle,
    ) -> Result<TransformOutput> {
        match mode {
            RngMode::Record => {
                capture.state = Some(rng.clone());
                let mut ctx = CallCtx { rng, training };
                self.inner.forward(x, &mut ctx, args)
            }
            RngMode::Replay => {
                let mut replay = self.replay_rng(capture)?;
                let mut ctx = CallCtx {
                    rng: &mut replay,
                    training,
                };
                self.inner.forward(x, &mut ctx, args)
            }
            RngMode::Untracked => {
                let mut ctx = CallCtx { rng, training };
                self.inner.forward(x, &mut ctx, args)
            }
        }
    }

    /// Gradient-enabled re-execution: always replays the recorded randomness.
    pub fn replay_vjp(
        &self,
        x: &Tensor,
        grad_output: &Tensor,
        capture: &RngCapture,
        args: &ArgBundle,
        grads: &mut GradScope<'_>,
    ) -> Result<Vjp> {
        let mut replay = self.replay_rng(capture)?;
        let mut ctx = CallCtx {
            rng: &mut replay,
            training: true,
        };
        self.inner.vjp(x, grad_output, &mut ctx, args, grads)
    }

    fn replay_rng(&self, capture: &RngCapture) -> Result<StdRng> {
        capture
            .state
            .clone()
            .ok_or_else(|| EngineError::RandomnessReplayFailure {
                block: self.site.block,
                branch: self.site.branch,
            })
    }
}
