//! Auxiliary state and debug telemetry threaded through the stack.
//!
//! Each layer's F may emit named tensors (recurrent statistics, debug
//! probes). The stack manager lays them out along a trailing "layer" axis so
//! a consumer gets one tensor per field, and slices that axis back out when a
//! layer needs its own state as an argument.

pub mod stack;

pub use stack::{StackedState, StateMap};
