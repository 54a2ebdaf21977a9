//! Engine configuration, training steps and chunked inference.
//!
//! - [`EngineConfig`] builds a demo stack of memory/linear F and
//!   feed-forward G blocks.
//! - [`train_step`] runs one forward + backward with either execution
//!   strategy and reports timings.
//! - [`ChunkedRunner`] feeds a long sequence through the stack chunk by
//!   chunk, carrying each chunk's stacked state into the next.

use std::path::Path;
use std::time::Instant;

use ndarray::{concatenate, Axis, Slice};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::core::{
    BackwardOutput, ExecuteType, ForwardOutput, ReversibleSequence, StoredExecutor, Traversal,
};
use crate::error::{EngineError, Result};
use crate::layers::{CumulativeMemory, FeedForward, Linear, Transform, STATES_ARG};
use crate::routing::{ArgBundle, ArgValue, RouteSpec, RouteTarget};
use crate::state::StackedState;
use crate::tensor::{Recombine, Tensor};

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Width of the external activation (each coupling half has this width).
    pub d_model: usize,

    /// Number of coupling blocks.
    pub n_layers: usize,

    /// Hidden width of the feed-forward G.
    pub hidden: usize,

    /// Dropout probability inside F and G while training.
    pub dropout: f32,

    /// Seed for weight init and the per-call generator.
    pub seed: u64,

    /// How the two final halves are merged.
    pub recombine: Recombine,

    /// Reversible reconstruction or stored activations.
    pub execute_type: ExecuteType,

    /// Use cumulative memory as F on even layers (linear F otherwise).
    pub use_memory: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            d_model: crate::config::D_MODEL,
            n_layers: crate::config::N_LAYERS,
            hidden: crate::config::FFN_HIDDEN,
            dropout: crate::config::DROPOUT,
            seed: crate::config::SEED,
            recombine: Recombine::default(),
            execute_type: ExecuteType::default(),
            use_memory: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.hidden == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "d_model ({}) and hidden ({}) must be positive",
                self.d_model, self.hidden
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(EngineError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Route table of the demo stack: prior state is sliced per layer into F.
    pub fn route_spec(&self) -> RouteSpec {
        RouteSpec::new().layer_slice(STATES_ARG, RouteTarget::F)
    }

    pub fn build_demo_sequence(&self) -> Result<ReversibleSequence> {
        self.validate()?;
        let d = self.d_model;
        let pairs = (0..self.n_layers)
            .map(|i| {
                let seed = self.seed.wrapping_add(1000 * i as u64);
                let f: Box<dyn Transform> = if self.use_memory && i % 2 == 0 {
                    Box::new(CumulativeMemory::new(d, seed))
                } else {
                    Box::new(Linear::new(d, d, self.dropout, seed))
                };
                let g: Box<dyn Transform> =
                    Box::new(FeedForward::new(d, self.hidden, self.dropout, seed.wrapping_add(500)));
                (f, g)
            })
            .collect();
        let seq = ReversibleSequence::from_pairs(pairs, self.route_spec()).with_recombine(self.recombine);
        tracing::info!(
            layers = seq.len(),
            params = seq.param_count(),
            "built demo sequence"
        );
        Ok(seq)
    }
}

/// Wall-clock split of one training step (microseconds).
#[derive(Clone, Debug, Default)]
pub struct StepTimings {
    pub forward_us: u64,
    pub backward_us: u64,
    pub total_us: u64,
}

impl StepTimings {
    /// Percentage breakdown.
    pub fn breakdown(&self) -> Vec<(&str, f32)> {
        let t = self.total_us as f32;
        if t == 0.0 {
            return vec![];
        }
        vec![
            ("forward", self.forward_us as f32 / t * 100.0),
            ("backward", self.backward_us as f32 / t * 100.0),
        ]
    }
}

/// Everything one forward + backward produced.
#[derive(Debug)]
pub struct StepReport {
    pub execute_type: ExecuteType,
    pub forward: ForwardOutput,
    pub backward: BackwardOutput,
    /// Activation tensors the trace held between the two halves.
    pub retained_activations: usize,
    pub timings: StepTimings,
}

fn timed_step<T: Traversal>(
    traversal: &T,
    execute_type: ExecuteType,
    x: &Tensor,
    kwargs: &ArgBundle,
    grad_output: &Tensor,
    rng: &mut StdRng,
) -> Result<StepReport> {
    let start = Instant::now();
    let (forward, saved) = traversal.forward_traversal(x, kwargs, rng)?;
    let forward_us = start.elapsed().as_micros() as u64;
    let retained_activations = T::retained_activations(&saved);

    let back_start = Instant::now();
    let backward = traversal.backward_traversal(saved, grad_output)?;
    let backward_us = back_start.elapsed().as_micros() as u64;

    Ok(StepReport {
        execute_type,
        forward,
        backward,
        retained_activations,
        timings: StepTimings {
            forward_us,
            backward_us,
            total_us: start.elapsed().as_micros() as u64,
        },
    })
}

/// One forward + backward pass with the chosen execution strategy.
pub fn train_step(
    seq: &ReversibleSequence,
    execute_type: ExecuteType,
    x: &Tensor,
    kwargs: &ArgBundle,
    grad_output: &Tensor,
    rng: &mut StdRng,
) -> Result<StepReport> {
    let report = match execute_type {
        ExecuteType::Reversible => timed_step(seq, execute_type, x, kwargs, grad_output, rng)?,
        ExecuteType::Stored => {
            let stored = StoredExecutor::new(seq);
            timed_step(&stored, execute_type, x, kwargs, grad_output, rng)?
        }
    };
    tracing::debug!(
        ?execute_type,
        retained = report.retained_activations,
        total_us = report.timings.total_us,
        "train step"
    );
    Ok(report)
}

/// Runs consecutive chunks of a sequence, threading stacked state between them.
///
/// The sequence's route table must send [`STATES_ARG`] through a
/// `LayerSlice` route; the first chunk runs without prior state.
pub struct ChunkedRunner<'a> {
    seq: &'a ReversibleSequence,
    state: Option<StackedState>,
    chunks_run: usize,
}

impl<'a> ChunkedRunner<'a> {
    pub fn new(seq: &'a ReversibleSequence) -> Self {
        Self {
            seq,
            state: None,
            chunks_run: 0,
        }
    }

    /// Resume from a previously saved state.
    pub fn with_state(seq: &'a ReversibleSequence, state: StackedState) -> Self {
        Self {
            seq,
            state: Some(state),
            chunks_run: 0,
        }
    }

    pub fn state(&self) -> Option<&StackedState> {
        self.state.as_ref()
    }

    pub fn chunks_run(&self) -> usize {
        self.chunks_run
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.chunks_run = 0;
    }

    /// Evaluate one chunk and keep its stacked state for the next.
    pub fn step(&mut self, chunk: &Tensor, rng: &mut StdRng) -> Result<ForwardOutput> {
        let mut kwargs = ArgBundle::new();
        if let Some(prev) = self.state.take() {
            kwargs.insert(STATES_ARG, ArgValue::Stacked(prev));
        }
        let out = self.seq.infer(chunk, &kwargs, rng)?;
        self.state = Some(out.state.clone());
        self.chunks_run += 1;
        tracing::debug!(chunk = self.chunks_run, "chunk evaluated");
        Ok(out)
    }

    /// Split `x` along the position axis into `n_chunks` near-equal pieces and
    /// run them in order.
    ///
    /// `n_chunks` is clamped to `1..=positions`, so every chunk holds at least
    /// one position and earlier chunks take the remainder. An input with no
    /// positions runs no chunks and yields an empty output of the same shape.
    pub fn run(&mut self, x: &Tensor, n_chunks: usize, rng: &mut StdRng) -> Result<Tensor> {
        if x.ndim() < 2 {
            return Err(EngineError::shape("chunked input", x.shape(), &[0, 0]));
        }
        let positions = x.len_of(Axis(1));
        if positions == 0 {
            return Ok(Tensor::zeros(x.raw_dim()));
        }
        let n_chunks = n_chunks.clamp(1, positions);
        let (base, extra) = (positions / n_chunks, positions % n_chunks);

        let mut outputs = Vec::with_capacity(n_chunks);
        let mut start = 0;
        for i in 0..n_chunks {
            let end = start + base + usize::from(i < extra);
            let chunk = x.slice_axis(Axis(1), Slice::from(start..end)).to_owned();
            outputs.push(self.step(&chunk, rng)?.output);
            start = end;
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        Ok(concatenate(Axis(1), &views)?)
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        match &self.state {
            Some(state) => state.save(path),
            None => StackedState::default().save(path),
        }
    }

    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        let state = StackedState::load(path)?;
        self.state = if state.num_layers == 0 { None } else { Some(state) };
        Ok(())
    }
}
