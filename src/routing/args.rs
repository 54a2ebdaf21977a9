//! Keyword-argument bundles passed to layer transformations.

use std::collections::BTreeMap;

use crate::state::{StackedState, StateMap};
use crate::tensor::Tensor;

/// A single argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Scalar(f32),
    Flag(bool),
    Tensor(Tensor),
    /// One layer's state, as consumed by a stateful F.
    State(StateMap),
    /// State for every layer; the router slices it per layer.
    Stacked(StackedState),
    /// One value per layer; the router hands element `i` to layer `i`.
    PerLayer(Vec<ArgValue>),
}

impl ArgValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ArgValue::Scalar(_) => "scalar",
            ArgValue::Flag(_) => "flag",
            ArgValue::Tensor(_) => "tensor",
            ArgValue::State(_) => "state",
            ArgValue::Stacked(_) => "stacked state",
            ArgValue::PerLayer(_) => "per-layer list",
        }
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Scalar(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Flag(v)
    }
}

impl From<Tensor> for ArgValue {
    fn from(v: Tensor) -> Self {
        ArgValue::Tensor(v)
    }
}

impl From<StackedState> for ArgValue {
    fn from(v: StackedState) -> Self {
        ArgValue::Stacked(v)
    }
}

/// Named arguments, ordered by name so routing is deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgBundle {
    values: BTreeMap<String, ArgValue>,
}

impl ArgBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<ArgValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ArgValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f32> {
        match self.values.get(name) {
            Some(ArgValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ArgValue::Flag(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        match self.values.get(name) {
            Some(ArgValue::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    pub fn state(&self, name: &str) -> Option<&StateMap> {
        match self.values.get(name) {
            Some(ArgValue::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Routed arguments for one coupling block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerArgs {
    pub f: ArgBundle,
    pub g: ArgBundle,
}
