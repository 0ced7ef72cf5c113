use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, warn};

use crate::patch::{self, PatchOutcome, PatchSet, Severity};
use crate::process::Shell;

/// Outcome of one patch in the patch stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    pub name: String,
    pub severity: Severity,
    pub outcome: PatchOutcome,
}

/// Apply every patch in order, interpreting `Unverifiable` by severity.
///
/// A critical patch that cannot be verified stops the stage at that patch;
/// benign ones are logged and skipped. `reports` keeps what was decided so far
/// either way.
pub(crate) fn apply_patches(
    shell: &dyn Shell,
    patches: &PatchSet,
    source_dir: &Path,
    reports: &mut Vec<PatchReport>,
) -> Result<()> {
    for spec in patches {
        let outcome = patch::apply(shell, spec, source_dir)?;
        reports.push(PatchReport {
            name: spec.name.clone(),
            severity: spec.severity,
            outcome,
        });

        if outcome != PatchOutcome::Unverifiable {
            continue;
        }
        match spec.severity {
            Severity::Benign => {
                warn!(
                    patch = %spec.name,
                    "patch does not apply and could not be verified; continuing"
                );
            }
            Severity::Critical => {
                error!(patch = %spec.name, "critical patch could not be applied or verified");
                bail!(
                    "critical patch '{}' ({}) does not apply and its verification probe found no trace of it; the code it requires is missing from the tree",
                    spec.name,
                    spec.patch_file.display()
                );
            }
        }
    }
    Ok(())
}
