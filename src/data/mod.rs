//! Data Module
//!
//! Trajectory dataset loading, the `.npy` storage codec, and the
//! synthetic charged-particle generator.

pub mod generate;
pub mod npy;

mod dataset;

pub use dataset::{file_suffix, Batch, DataError, NBodyDataset, Sample};
