//! # revstack
//!
//! **Reversible execution engine** for deep stacks of coupling blocks: train
//! with activation memory that does not grow with depth.
//!
//! Each block splits its activation into two halves and applies
//!
//! ```text
//! y1 = x1 + F(x2)
//! y2 = x2 + G(y1)
//! ```
//!
//! which is exactly invertible. The forward pass keeps only the final
//! activation; the backward pass rebuilds every block's input from its
//! output, replaying the randomness each F and G consumed.
//!
//! ## Components
//!
//! 1. **Deterministic wrapper**: records and replays generator state
//! 2. **Coupling block**: forward, reconstruction-based backward, inverse
//! 3. **Sequence orchestrator**: duplicate, run, stack state, recombine
//! 4. **Argument router**: shared / per-layer / layer-sliced arguments
//! 5. **State stack**: per-layer auxiliary state and debug telemetry on a
//!    trailing layer axis
//! 6. **Stored baseline**: same blocks, all activations kept, for checking
//! 7. **Runtime**: config, chunked inference, traversal health

pub mod core;
pub mod error;
pub mod layers;
pub mod learning;
pub mod routing;
pub mod runtime;
pub mod state;
pub mod tensor;

pub use crate::core::{
    BackwardOutput, ExecuteType, ForwardOutput, ReversibleBlock, ReversibleSequence, ReversibleTrace,
    StoredExecutor, Traversal,
};
pub use crate::error::{EngineError, Result};
pub use crate::routing::{route, ArgBundle, ArgValue, RouteSpec, RouteTarget};
pub use crate::state::{StackedState, StateMap};
pub use crate::tensor::{Recombine, Tensor};

/// Engine-wide defaults.
pub mod config {
    /// Default feature width of the external activation.
    pub const D_MODEL: usize = 16;

    /// Default number of coupling blocks.
    pub const N_LAYERS: usize = 4;

    /// Default hidden width of the feed-forward G.
    pub const FFN_HIDDEN: usize = 2 * D_MODEL;

    /// Default dropout probability.
    pub const DROPOUT: f32 = 0.1;

    /// Default seed.
    pub const SEED: u64 = 42;

    /// Reconstruction error (max abs) above which health is degraded.
    pub const RECON_WARN: f32 = 1e-3;

    /// Reconstruction error above which reconstructed gradients are unusable.
    pub const RECON_CRITICAL: f32 = 1e-1;
}
