//! Gradient bookkeeping.
//!
//! - **grads**: parameter gradient sink keyed by dotted path
//! - **gradcheck**: finite-difference and directional-derivative checks used
//!   to validate reconstructed gradients

pub mod gradcheck;
pub mod grads;

pub use gradcheck::{
    directional_derivative, finite_difference_input_grad, random_direction, vjp_consistency, VjpCheck,
};
pub use grads::{GradScope, ParamGrads};
