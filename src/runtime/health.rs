//! Traversal health: is reconstruction still exact and are gradients sane?
//!
//! Reversible backward passes trust that `x = y - F(...)` recovers the input.
//! Numerical drift (large activations, unstable transformations) breaks that
//! silently, so each step's reconstruction error and gradient norm are kept
//! in rolling windows with warn/critical thresholds.

use std::collections::VecDeque;

use crate::runtime::pipeline::StepReport;
use crate::tensor::{max_abs_diff, Tensor};

/// Health status levels.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthStatus {
    Healthy,
    /// Within tolerance, but worth a look.
    Degraded(String),
    /// Reconstruction or gradients can no longer be trusted.
    Critical(String),
}

impl HealthStatus {
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Critical(_) => 2,
        }
    }
}

/// Rolling window of one scalar with upper-bound thresholds.
#[derive(Clone, Debug)]
pub struct RollingMetric {
    pub name: &'static str,
    values: VecDeque<f32>,
    window: usize,
    warn: Option<f32>,
    critical: Option<f32>,
}

impl RollingMetric {
    pub fn new(name: &'static str, window: usize) -> Self {
        Self {
            name,
            values: VecDeque::with_capacity(window),
            window: window.max(1),
            warn: None,
            critical: None,
        }
    }

    pub fn with_thresholds(mut self, warn: f32, critical: f32) -> Self {
        self.warn = Some(warn);
        self.critical = Some(critical);
        self
    }

    pub fn record(&mut self, value: f32) {
        if self.values.len() >= self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn latest(&self) -> Option<f32> {
        self.values.back().copied()
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn p99(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f32> = self.values.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);
        let idx = ((sorted.len() as f32) * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Status of the latest value. A NaN sample is always critical.
    pub fn status(&self) -> HealthStatus {
        let Some(val) = self.latest() else {
            return HealthStatus::Healthy;
        };
        if val.is_nan() {
            return HealthStatus::Critical(format!("{}: NaN", self.name));
        }
        if let Some(crit) = self.critical {
            if val >= crit {
                return HealthStatus::Critical(format!("{}: {:.3e} >= critical {:.1e}", self.name, val, crit));
            }
        }
        if let Some(warn) = self.warn {
            if val >= warn {
                return HealthStatus::Degraded(format!("{}: {:.3e} >= warn {:.1e}", self.name, val, warn));
            }
        }
        HealthStatus::Healthy
    }
}

/// Health monitor fed with one [`StepReport`] per training step.
#[derive(Clone, Debug)]
pub struct TraversalHealth {
    /// Max abs difference between the input and its reconstruction.
    pub reconstruction_error: RollingMetric,

    /// Global L2 norm of the parameter gradients.
    pub grad_norm: RollingMetric,

    pub forward_ms: RollingMetric,
    pub backward_ms: RollingMetric,

    /// Steps whose gradients contained NaN or inf.
    pub nonfinite_steps: u64,

    pub total_steps: u64,
}

impl Default for TraversalHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl TraversalHealth {
    pub fn new() -> Self {
        Self {
            reconstruction_error: RollingMetric::new("reconstruction_error", 256)
                .with_thresholds(crate::config::RECON_WARN, crate::config::RECON_CRITICAL),
            grad_norm: RollingMetric::new("grad_norm", 256).with_thresholds(1e3, 1e6),
            forward_ms: RollingMetric::new("forward_ms", 256),
            backward_ms: RollingMetric::new("backward_ms", 256),
            nonfinite_steps: 0,
            total_steps: 0,
        }
    }

    /// Record a step taken on input `x`.
    pub fn record(&mut self, x: &Tensor, step: &StepReport) {
        self.total_steps += 1;
        let recon = max_abs_diff(x, &step.backward.reconstructed_input);
        self.reconstruction_error.record(recon);

        let finite = step.backward.param_grads.all_finite() && step.backward.grad_input.iter().all(|v| v.is_finite());
        if !finite {
            self.nonfinite_steps += 1;
        }
        self.grad_norm.record(step.backward.param_grads.global_norm());
        self.forward_ms.record(step.timings.forward_us as f32 / 1000.0);
        self.backward_ms.record(step.timings.backward_us as f32 / 1000.0);

        let status = self.overall_status();
        if status != HealthStatus::Healthy {
            tracing::warn!(step = self.total_steps, ?status, "traversal health");
        }
    }

    pub fn overall_status(&self) -> HealthStatus {
        if self.nonfinite_steps > 0 {
            return HealthStatus::Critical(format!(
                "{} of {} steps produced non-finite gradients",
                self.nonfinite_steps, self.total_steps
            ));
        }
        [self.reconstruction_error.status(), self.grad_norm.status()]
            .into_iter()
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            total_steps: self.total_steps,
            max_reconstruction_error: if self.reconstruction_error.is_empty() {
                0.0
            } else {
                self.reconstruction_error.max()
            },
            avg_grad_norm: self.grad_norm.mean(),
            avg_forward_ms: self.forward_ms.mean(),
            avg_backward_ms: self.backward_ms.mean(),
            p99_backward_ms: self.backward_ms.p99(),
        }
    }
}

/// A health report snapshot.
#[derive(Debug)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_steps: u64,
    pub max_reconstruction_error: f32,
    pub avg_grad_norm: f32,
    pub avg_forward_ms: f32,
    pub avg_backward_ms: f32,
    pub p99_backward_ms: f32,
}
