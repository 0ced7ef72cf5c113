//! Typed errors for the failure modes callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use std::path::PathBuf;
use thiserror::Error;

/// Version key resolution failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("version key must not be empty")]
    EmptyKey,

    #[error("unknown version key '{key}'; expected one of: {}", known.join(", "))]
    NotFound { key: String, known: Vec<String> },
}

/// Patch set configuration errors, detected when the set is loaded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchConfigError {
    #[error("critical patch '{name}' has no verification probe")]
    CriticalWithoutProbe { name: String },

    #[error("patch '{name}' is declared more than once")]
    DuplicateName { name: String },

    #[error("patch '{name}' has an empty verification marker")]
    EmptyMarker { name: String },
}

/// Packaging failures. `MissingOutput` means an earlier stage reported success
/// without producing what it promised.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("expected {what} not found at {}", path.display())]
    MissingOutput { what: &'static str, path: PathBuf },

    #[error("stage output for {what} was never recorded")]
    Unrecorded { what: &'static str },

    #[error("output directory holds {}, which is not an artifact of this variant", path.display())]
    ForeignOutput { path: PathBuf },

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
