//! Artifact packaging.
//!
//! - [`archive`] - Deterministic tar + zstd archive creation
//! - [`package`] - Moves/compresses stage outputs into the deliverable set

pub mod archive;
pub mod package;

pub use package::{Packager, StageOutputs};
