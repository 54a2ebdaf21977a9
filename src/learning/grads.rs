//! Parameter gradient accumulation.
//!
//! Gradients are keyed by dotted parameter path (`blocks.2.g.w1`). The
//! engine only accumulates; applying updates is the training loop's job.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamGrads {
    grads: BTreeMap<String, Tensor>,
}

impl ParamGrads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` into the slot for `path`, creating it on first use.
    pub fn accumulate(&mut self, path: &str, grad: Tensor) -> Result<()> {
        match self.grads.get_mut(path) {
            Some(slot) => {
                if slot.shape() != grad.shape() {
                    return Err(EngineError::shape(
                        format!("gradient for {}", path),
                        slot.shape(),
                        grad.shape(),
                    ));
                }
                *slot += &grad;
            }
            None => {
                self.grads.insert(path.to_string(), grad);
            }
        }
        Ok(())
    }

    /// A view that prefixes every path with `prefix.`.
    pub fn scope(&mut self, prefix: impl Into<String>) -> GradScope<'_> {
        GradScope {
            grads: self,
            prefix: prefix.into(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Tensor> {
        self.grads.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.grads.iter()
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// L2 norm over every accumulated gradient.
    pub fn global_norm(&self) -> f32 {
        self.grads
            .values()
            .flat_map(|t| t.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    pub fn all_finite(&self) -> bool {
        self.grads.values().all(|t| t.iter().all(|v| v.is_finite()))
    }
}

/// Prefixed handle handed to a single transformation.
pub struct GradScope<'a> {
    grads: &'a mut ParamGrads,
    prefix: String,
}

impl GradScope<'_> {
    pub fn accumulate(&mut self, name: &str, grad: Tensor) -> Result<()> {
        let path = format!("{}.{}", self.prefix, name);
        self.grads.accumulate(&path, grad)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_accumulate_sums() {
        let mut grads = ParamGrads::new();
        grads.accumulate("w", Tensor::ones(IxDyn(&[2]))).unwrap();
        grads.accumulate("w", Tensor::ones(IxDyn(&[2]))).unwrap();
        assert_eq!(grads.get("w").unwrap()[[1]], 2.0);
        assert!((grads.global_norm() - 8.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_scope_prefixes() {
        let mut grads = ParamGrads::new();
        grads
            .scope("blocks.0.f")
            .accumulate("weight", Tensor::zeros(IxDyn(&[3])))
            .unwrap();
        assert!(grads.get("blocks.0.f.weight").is_some());
    }

    #[test]
    fn test_shape_conflict() {
        let mut grads = ParamGrads::new();
        grads.accumulate("w", Tensor::ones(IxDyn(&[2]))).unwrap();
        assert!(grads.accumulate("w", Tensor::ones(IxDyn(&[3]))).is_err());
    }
}
