//! Idempotent patch application.
//!
//! `git apply` exits non-zero both when a patch was already applied by an
//! earlier build in the same tree and when the upstream code it targets is
//! gone. The two cases are told apart by the patch's verification probe, run
//! only after application fails:
//!
//! ```text
//! git apply ── ok ──────────────────────────────▶ Applied
//!     │
//!   fails ── probe output contains marker ──────▶ AlreadyApplied
//!     │
//!     └───── no probe / no marker ──────────────▶ Unverifiable
//! ```
//!
//! What `Unverifiable` means for the run is decided by the patch stage based on
//! [`Severity`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::resolve_path;
use crate::error::PatchConfigError;
use crate::process::{Cmd, CmdOutput, Shell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure to verify is tolerated upstream drift.
    Benign,
    /// Failure to verify aborts the run.
    Critical,
}

/// Shell command whose output proves a patch's effect is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationProbe {
    /// Run with `sh -c` at the tree root.
    pub command: String,
    /// Literal text the probe's stdout must contain.
    pub marker: String,
}

impl VerificationProbe {
    pub fn new(command: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            marker: marker.into(),
        }
    }

    /// A probe matches when it exits 0 and its stdout contains the marker.
    pub fn matches(&self, output: &CmdOutput) -> bool {
        output.success() && output.stdout.contains(&self.marker)
    }
}

/// One patch applied during the patch stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    pub name: String,
    pub patch_file: PathBuf,
    pub verification_probe: Option<VerificationProbe>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    AlreadyApplied,
    Unverifiable,
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchOutcome::Applied => "applied",
            PatchOutcome::AlreadyApplied => "already applied",
            PatchOutcome::Unverifiable => "unverifiable",
        })
    }
}

/// Apply `patch` to the tree rooted at `work_dir`.
///
/// Errors are reserved for conditions that are not patch outcomes: a missing
/// patch file or a command that cannot be spawned.
pub fn apply(shell: &dyn Shell, patch: &PatchSpec, work_dir: &Path) -> Result<PatchOutcome> {
    if !patch.patch_file.is_file() {
        bail!(
            "patch file for '{}' not found: {}",
            patch.name,
            patch.patch_file.display()
        );
    }

    let apply = Cmd::new("git")
        .arg("apply")
        .arg(patch.patch_file.to_string_lossy())
        .current_dir(work_dir);
    let applied = shell
        .exec(&apply)
        .with_context(|| format!("applying patch '{}'", patch.name))?;
    if applied.success() {
        info!(patch = %patch.name, "patch applied");
        return Ok(PatchOutcome::Applied);
    }
    debug!(
        patch = %patch.name,
        code = ?applied.code,
        "git apply rejected patch; checking whether it is already present"
    );

    let Some(probe) = &patch.verification_probe else {
        return Ok(PatchOutcome::Unverifiable);
    };

    let output = shell
        .exec(&Cmd::sh(probe.command.clone()).current_dir(work_dir))
        .with_context(|| format!("running verification probe for patch '{}'", patch.name))?;
    if probe.matches(&output) {
        info!(patch = %patch.name, "patch already applied");
        Ok(PatchOutcome::AlreadyApplied)
    } else {
        Ok(PatchOutcome::Unverifiable)
    }
}

/// `[[patches]]` entry as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PatchToml {
    name: String,
    file: String,
    severity: Severity,
    probe: Option<VerificationProbe>,
}

impl PatchToml {
    pub(crate) fn into_spec(self, base_dir: &Path) -> PatchSpec {
        PatchSpec {
            name: self.name.trim().to_string(),
            patch_file: resolve_path(base_dir, self.file.trim()),
            verification_probe: self.probe,
            severity: self.severity,
        }
    }
}

/// Ordered, validated list of patches.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    patches: Vec<PatchSpec>,
}

impl PatchSet {
    /// Validate and wrap `patches`, keeping their order.
    pub fn new(patches: Vec<PatchSpec>) -> Result<Self, PatchConfigError> {
        let mut names = BTreeSet::new();
        for patch in &patches {
            if !names.insert(patch.name.clone()) {
                return Err(PatchConfigError::DuplicateName {
                    name: patch.name.clone(),
                });
            }
            match &patch.verification_probe {
                None if patch.severity == Severity::Critical => {
                    return Err(PatchConfigError::CriticalWithoutProbe {
                        name: patch.name.clone(),
                    });
                }
                Some(probe) if probe.marker.is_empty() => {
                    return Err(PatchConfigError::EmptyMarker {
                        name: patch.name.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(Self { patches })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchSpec> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl<'a> IntoIterator for &'a PatchSet {
    type Item = &'a PatchSpec;
    type IntoIter = std::slice::Iter<'a, PatchSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedShell;
    use std::fs;

    const MARKER: &str = "jsl-force-probe-removed";

    fn spec(dir: &Path, severity: Severity, probe: Option<VerificationProbe>) -> PatchSpec {
        let patch_file = dir.join("jsl-i915.patch");
        fs::write(&patch_file, "--- a/x\n+++ b/x\n").unwrap();
        PatchSpec {
            name: "jsl-i915".into(),
            patch_file,
            verification_probe: probe,
            severity,
        }
    }

    fn probe() -> VerificationProbe {
        VerificationProbe::new("check-jsl-info", MARKER)
    }

    #[test]
    fn clean_apply_is_applied_and_skips_probe() {
        let temp = tempfile::tempdir().unwrap();
        let shell = ScriptedShell::new();
        let patch = spec(temp.path(), Severity::Critical, Some(probe()));

        let outcome = apply(&shell, &patch, temp.path()).unwrap();

        assert_eq!(outcome, PatchOutcome::Applied);
        assert_eq!(shell.count(|c| c.program() == "sh"), 0);
        let calls = shell.calls();
        assert_eq!(calls[0].working_dir(), Some(temp.path()));
    }

    #[test]
    fn rejected_patch_with_matching_probe_is_already_applied() {
        let temp = tempfile::tempdir().unwrap();
        let shell = ScriptedShell::new()
            .on(|c| c.has_arg("apply"), |_| CmdOutput::failed(1, "error"))
            .on(
                |c| c.program() == "sh",
                |_| CmdOutput::ok(format!("{MARKER}\n")),
            );
        let patch = spec(temp.path(), Severity::Critical, Some(probe()));

        assert_eq!(
            apply(&shell, &patch, temp.path()).unwrap(),
            PatchOutcome::AlreadyApplied
        );
    }

    #[test]
    fn rejected_patch_with_silent_probe_is_unverifiable() {
        let temp = tempfile::tempdir().unwrap();
        let shell = ScriptedShell::new()
            .on(|c| c.has_arg("apply"), |_| CmdOutput::failed(1, "error"))
            .on(|c| c.program() == "sh", |_| CmdOutput::failed(1, ""));
        let patch = spec(temp.path(), Severity::Critical, Some(probe()));

        assert_eq!(
            apply(&shell, &patch, temp.path()).unwrap(),
            PatchOutcome::Unverifiable
        );
    }

    #[test]
    fn probe_must_exit_zero_even_if_marker_printed() {
        let output = CmdOutput {
            code: Some(2),
            stdout: MARKER.into(),
            stderr: String::new(),
        };
        assert!(!probe().matches(&output));
        assert!(probe().matches(&CmdOutput::ok(MARKER)));
    }

    #[test]
    fn rejected_patch_without_probe_is_unverifiable() {
        let temp = tempfile::tempdir().unwrap();
        let shell =
            ScriptedShell::new().on(|c| c.has_arg("apply"), |_| CmdOutput::failed(1, "error"));
        let patch = spec(temp.path(), Severity::Benign, None);

        assert_eq!(
            apply(&shell, &patch, temp.path()).unwrap(),
            PatchOutcome::Unverifiable
        );
        assert_eq!(shell.calls().len(), 1);
    }

    #[test]
    fn reapplying_to_patched_tree_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("drivers")).unwrap();
        let shell = ScriptedShell::new()
            .on(
                |c| c.has_arg("apply"),
                |c| {
                    let marker = c.working_dir().unwrap().join("drivers/probe.c");
                    if marker.exists() {
                        return CmdOutput::failed(1, "patch does not apply");
                    }
                    fs::write(&marker, MARKER).unwrap();
                    CmdOutput::ok("")
                },
            )
            .on(
                |c| c.program() == "sh",
                |c| {
                    let marker = c.working_dir().unwrap().join("drivers/probe.c");
                    CmdOutput::ok(fs::read_to_string(marker).unwrap_or_default())
                },
            );
        let patch = spec(temp.path(), Severity::Critical, Some(probe()));

        assert_eq!(apply(&shell, &patch, &tree).unwrap(), PatchOutcome::Applied);
        assert_eq!(
            apply(&shell, &patch, &tree).unwrap(),
            PatchOutcome::AlreadyApplied
        );
        assert_eq!(
            apply(&shell, &patch, &tree).unwrap(),
            PatchOutcome::AlreadyApplied
        );
    }

    #[test]
    fn missing_patch_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let shell = ScriptedShell::new();
        let patch = PatchSpec {
            name: "ghost".into(),
            patch_file: temp.path().join("ghost.patch"),
            verification_probe: None,
            severity: Severity::Benign,
        };

        let err = apply(&shell, &patch, temp.path()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(shell.calls().is_empty());
    }

    #[test]
    fn critical_patch_requires_probe() {
        let temp = tempfile::tempdir().unwrap();
        let patch = spec(temp.path(), Severity::Critical, None);
        assert_eq!(
            PatchSet::new(vec![patch]).unwrap_err(),
            PatchConfigError::CriticalWithoutProbe {
                name: "jsl-i915".into()
            }
        );
    }

    #[test]
    fn duplicate_patch_names_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let patch = spec(temp.path(), Severity::Benign, None);
        assert!(matches!(
            PatchSet::new(vec![patch.clone(), patch]),
            Err(PatchConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn patch_toml_resolves_file_against_base_dir() {
        let entry: PatchToml = toml::from_str(
            r#"
            name = "jsl-i915"
            file = "patches/jsl-i915.patch"
            severity = "critical"
            probe = { command = "check-jsl-info", marker = "jsl-force-probe-removed" }
            "#,
        )
        .unwrap();
        let spec = entry.into_spec(Path::new("/srv/kb"));
        assert_eq!(spec.patch_file, PathBuf::from("/srv/kb/patches/jsl-i915.patch"));
        assert_eq!(spec.severity, Severity::Critical);
        assert_eq!(spec.verification_probe.unwrap().marker, MARKER);
    }
}
