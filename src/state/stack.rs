//! Stacking per-layer state maps along a new trailing layer axis.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{stack, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;

/// Named tensors produced (or consumed) by a single layer.
pub type StateMap = BTreeMap<String, Tensor>;

/// Per-field tensors with a trailing axis of length `num_layers`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StackedState {
    /// Field name -> `[..field shape, num_layers]`.
    pub fields: BTreeMap<String, Tensor>,

    /// Number of layers stacked.
    pub num_layers: usize,
}

impl StackedState {
    /// Stack per-layer maps in layer order.
    ///
    /// Layers that did not produce a field contribute zeros of that field's
    /// shape. Every produced instance of a field must share one shape.
    pub fn stack(per_layer: &[StateMap]) -> Result<Self> {
        let mut shapes: BTreeMap<&str, &[usize]> = BTreeMap::new();
        for map in per_layer {
            for (name, t) in map {
                match shapes.get(name.as_str()) {
                    Some(expected) if *expected != t.shape() => {
                        return Err(EngineError::StateShapeMismatch {
                            field: name.clone(),
                            expected: expected.to_vec(),
                            found: t.shape().to_vec(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        shapes.insert(name.as_str(), t.shape());
                    }
                }
            }
        }

        let mut fields = BTreeMap::new();
        for (name, shape) in shapes {
            let zeros = Tensor::zeros(IxDyn(shape));
            let views: Vec<_> = per_layer
                .iter()
                .map(|map| map.get(name).unwrap_or(&zeros).view())
                .collect();
            let stacked = stack(Axis(shape.len()), &views)?;
            fields.insert(name.to_string(), stacked);
        }

        Ok(Self {
            fields,
            num_layers: per_layer.len(),
        })
    }

    /// Every field must carry a trailing layer axis of length `num_layers`.
    pub fn validate(&self) -> Result<()> {
        for (name, t) in &self.fields {
            if t.shape().last() != Some(&self.num_layers) {
                return Err(EngineError::StateShapeMismatch {
                    field: name.clone(),
                    expected: vec![self.num_layers],
                    found: t.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// The state of a single layer, in the map format F consumes.
    pub fn slice_layer(&self, layer: usize) -> Result<StateMap> {
        self.validate()?;
        if layer >= self.num_layers {
            return Err(EngineError::shape(
                "state layer index",
                &[layer],
                &[self.num_layers],
            ));
        }
        let mut out = StateMap::new();
        for (name, t) in &self.fields {
            let axis = Axis(t.ndim() - 1);
            out.insert(name.clone(), t.index_axis(axis, layer).to_owned());
        }
        Ok(out)
    }

    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Memory footprint of the stacked tensors in bytes.
    pub fn size_bytes(&self) -> usize {
        self.fields.values().map(|t| t.len()).sum::<usize>() * std::mem::size_of::<f32>()
    }

    /// Serialise (for persistence across decoding chunks or sessions).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: Self = bincode::deserialize(bytes)?;
        state.validate()?;
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}
