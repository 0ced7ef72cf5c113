//! Patched ChromeOS kernel builds for x86 Chromebooks.
//!
//! One run takes a version key, clones the matching kernel branch, applies a
//! fixed set of hardware patches, builds the kernel image, modules and
//! headers, and packages them as three artifacts:
//!
//! ```text
//! version key ──► VariantRegistry::resolve ──► BuildVariant
//!                                                  │
//!                         StageRunner::run ◄───────┘
//!                               │
//!   acquire source → apply patches → build kernel → build modules
//!                               → build headers → package artifacts
//!                               │
//!                  <output>/{kernel image, modules archive, headers archive}
//! ```
//!
//! Variants and patches are data, loaded from `kernel-builder.toml` (see
//! [`config`]). All external commands go through the [`process::Shell`] seam.

pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod manifest;
pub mod patch;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod telemetry;
pub mod variant;

#[cfg(test)]
mod test_support;

pub use config::{BuildSettings, Config};
pub use error::{PackagingError, PatchConfigError, VariantError};
pub use patch::{PatchOutcome, PatchSet, PatchSpec, Severity, VerificationProbe};
pub use pipeline::{PipelineReport, RunState, Stage, StageResult, StageRunner, StageStatus};
pub use process::{HostShell, Shell};
pub use variant::{ArtifactNames, BuildVariant, VariantRegistry};
