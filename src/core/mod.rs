//! Core module: coupling blocks, randomness replay, traversal strategies.

pub mod coupling;
pub mod deterministic;
pub mod function;
pub mod sequence;
pub mod stored;

pub use coupling::{BlockOutput, BlockReplay, ReversibleBlock};
pub use deterministic::{Deterministic, RngCapture, RngMode, Site};
pub use function::{BackwardOutput, ForwardOutput, Traversal};
pub use sequence::{ReversibleSequence, ReversibleTrace};
pub use stored::{ExecuteType, StoredExecutor, StoredTrace};
