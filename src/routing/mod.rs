//! Argument routing: flat per-call bundles into per-layer F/G bundles.

pub mod args;
pub mod router;

pub use args::{ArgBundle, ArgValue, LayerArgs};
pub use router::{route, RouteEntry, RouteMode, RouteSpec, RouteTarget};
