//! Equivariant Neural Operator Module
//!
//! E(n)-equivariant message passing over fixed-size particle graphs,
//! stacked into a neural operator that emits a whole trajectory window per
//! forward pass. Position updates are built exclusively from coordinate
//! differences and per-edge scalars, so predictions co-rotate and
//! co-translate with the input frame.

mod layer;
mod mlp;
mod network;
mod ops;
mod rbf;
mod time_conv;

pub use layer::{EquivariantLayer, LayerGrads};
pub use mlp::{Linear, Mlp2};
pub use network::{EgnoModel, ModelInput};
pub use ops::{segment_mean, segment_sum};
pub use rbf::RbfExpansion;
pub use time_conv::{TimeConv, TimeConvScalar};
