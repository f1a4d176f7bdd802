//! Capability context passed to every fibril.

#[allow(clippy::module_inception)]
mod cx;

pub use cx::{Cx, Yield};
