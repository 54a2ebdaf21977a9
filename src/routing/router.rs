//! Argument router: splits one flat argument bundle into per-layer,
//! per-branch bundles.
//!
//! The route specification is built once alongside the blocks and never
//! changes. Routing runs before any block executes, so a bad bundle fails
//! the call without partial computation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::routing::args::{ArgBundle, ArgValue, LayerArgs};

/// Which branch(es) of a coupling block receive an argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub f: bool,
    pub g: bool,
}

impl RouteTarget {
    pub const F: RouteTarget = RouteTarget { f: true, g: false };
    pub const G: RouteTarget = RouteTarget { f: false, g: true };
    pub const BOTH: RouteTarget = RouteTarget { f: true, g: true };
}

/// How a value is distributed over layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteMode {
    /// Same value at every layer.
    Shared,
    /// `ArgValue::PerLayer` with exactly one element per layer.
    PerLayer,
    /// `ArgValue::Stacked`; layer `i` receives its own slice as `ArgValue::State`.
    LayerSlice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub target: RouteTarget,
    pub mode: RouteMode,
}

/// Static routing description for every argument a sequence accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub entries: BTreeMap<String, RouteEntry>,
}

impl RouteSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self, name: &str, target: RouteTarget) -> Self {
        self.entry(name, target, RouteMode::Shared)
    }

    pub fn per_layer(self, name: &str, target: RouteTarget) -> Self {
        self.entry(name, target, RouteMode::PerLayer)
    }

    pub fn layer_slice(self, name: &str, target: RouteTarget) -> Self {
        self.entry(name, target, RouteMode::LayerSlice)
    }

    pub fn entry(mut self, name: &str, target: RouteTarget, mode: RouteMode) -> Self {
        self.entries
            .insert(name.to_string(), RouteEntry { target, mode });
        self
    }

    pub fn get(&self, name: &str) -> Option<&RouteEntry> {
        self.entries.get(name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Route `flat_args` into `num_layers` per-layer `(f, g)` bundles.
pub fn route(flat_args: &ArgBundle, spec: &RouteSpec, num_layers: usize) -> Result<Vec<LayerArgs>> {
    let mut layers = vec![LayerArgs::default(); num_layers];

    for (key, value) in flat_args.iter() {
        let entry = spec
            .get(key)
            .ok_or_else(|| EngineError::route(key.as_str(), "no routing entry"))?;
        if !entry.target.f && !entry.target.g {
            return Err(EngineError::route(key.as_str(), "entry targets neither F nor G"));
        }

        for (layer, args) in layers.iter_mut().enumerate() {
            let routed = layer_value(key, value, entry.mode, layer, num_layers)?;
            if entry.target.f {
                args.f.insert(key, routed.clone());
            }
            if entry.target.g {
                args.g.insert(key, routed);
            }
        }
    }

    Ok(layers)
}

fn layer_value(
    key: &str,
    value: &ArgValue,
    mode: RouteMode,
    layer: usize,
    num_layers: usize,
) -> Result<ArgValue> {
    match (mode, value) {
        (RouteMode::Shared, v) => Ok(v.clone()),
        (RouteMode::PerLayer, ArgValue::PerLayer(items)) => {
            if items.len() != num_layers {
                return Err(EngineError::route(
                    key,
                    format!("expected {} per-layer values, got {}", num_layers, items.len()),
                ));
            }
            Ok(items[layer].clone())
        }
        (RouteMode::LayerSlice, ArgValue::Stacked(stacked)) => {
            if stacked.num_layers != num_layers {
                return Err(EngineError::route(
                    key,
                    format!(
                        "stacked state covers {} layers, sequence has {}",
                        stacked.num_layers, num_layers
                    ),
                ));
            }
            Ok(ArgValue::State(stacked.slice_layer(layer)?))
        }
        (RouteMode::PerLayer, other) | (RouteMode::LayerSlice, other) => Err(EngineError::route(
            key,
            format!("{:?} route cannot take a {}", mode, other.kind()),
        )),
    }
}
