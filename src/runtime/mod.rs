//! Runtime module: configuration, training steps and diagnostics.
//!
//! This module provides:
//! - Engine configuration and the demo stack builder
//! - Timed training steps for either execution strategy
//! - Chunked inference with state carried across chunks
//! - Traversal health monitoring

pub mod health;
pub mod pipeline;

pub use health::{HealthReport, HealthStatus, TraversalHealth};
pub use pipeline::{train_step, ChunkedRunner, EngineConfig, StepReport, StepTimings};
