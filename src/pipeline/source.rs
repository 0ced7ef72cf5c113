use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::build::context::BuildLayout;
use crate::process::{Cmd, Shell};
use crate::variant::BuildVariant;

/// Identity of a cloned tree, written next to it so a later run can tell
/// whether the tree on disk is the one it would clone.
fn source_identity(repository: &str, variant: &BuildVariant) -> String {
    format!(
        "repository={}\nbranch={}\npinned_before={}\n",
        repository,
        variant.source_branch,
        variant.pinned_before.as_deref().unwrap_or("")
    )
}

/// Make the variant's source tree available at `layout.source_dir()`.
///
/// An existing tree cloned for the same repository, branch and pin is reused
/// (`fresh` forces a new clone); anything else is removed first.
pub(crate) fn acquire_source(
    shell: &dyn Shell,
    layout: &BuildLayout,
    repository: &str,
    variant: &BuildVariant,
    fresh: bool,
) -> Result<PathBuf> {
    let source = layout.source_dir();
    let marker = layout.source_marker();
    let identity = source_identity(repository, variant);

    if source.exists() {
        let recorded = fs::read_to_string(&marker).unwrap_or_default();
        if !fresh && recorded == identity && source.join(".git").exists() {
            info!(
                branch = %variant.source_branch,
                path = %source.display(),
                "reusing existing source tree"
            );
            prevent_dirty_build(&source)?;
            return Ok(source);
        }
        info!(path = %source.display(), "removing existing source tree");
        fs::remove_dir_all(&source)
            .with_context(|| format!("removing source tree '{}'", source.display()))?;
    }
    if marker.exists() {
        fs::remove_file(&marker)
            .with_context(|| format!("removing source marker '{}'", marker.display()))?;
    }

    clone(shell, layout.work_dir(), &source, repository, variant)?;
    fs::write(&marker, identity)
        .with_context(|| format!("writing source marker '{}'", marker.display()))?;
    prevent_dirty_build(&source)?;
    Ok(source)
}

fn clone(
    shell: &dyn Shell,
    work_dir: &Path,
    source: &Path,
    repository: &str,
    variant: &BuildVariant,
) -> Result<()> {
    let branch = variant.source_branch.as_str();
    info!(branch, repository, "cloning kernel");

    let mut clone = Cmd::new("git")
        .args(["clone", "--branch", branch, "--single-branch"])
        .current_dir(work_dir)
        .error_msg(format!("cloning branch '{}' failed", branch));
    // A pinned checkout needs history to walk back through.
    if variant.pinned_before.is_none() {
        clone = clone.args(["--depth", "1"]);
    }
    shell.run(&clone.arg(repository).arg(source.to_string_lossy()))?;

    let Some(before) = variant.pinned_before.as_deref() else {
        return Ok(());
    };

    let rev = shell
        .run(
            &Cmd::new("git")
                .args(["rev-list", "-n", "1", "--first-parent"])
                .arg(format!("--before={}", before))
                .arg(branch)
                .current_dir(source)
                .error_msg(format!("resolving pinned revision of '{}'", branch)),
        )?
        .stdout
        .trim()
        .to_string();
    if rev.is_empty() {
        bail!("branch '{}' has no commit before '{}'", branch, before);
    }

    info!(branch, before, rev = %rev, "checking out pinned revision");
    shell.run(
        &Cmd::new("git")
            .args(["checkout", "--quiet"])
            .arg(&rev)
            .current_dir(source)
            .error_msg(format!("checking out '{}'", rev)),
    )?;
    Ok(())
}

/// Keep the release string free of a `-dirty` suffix: ignore the module
/// staging directory and pin an empty `.scmversion`.
fn prevent_dirty_build(source: &Path) -> Result<()> {
    let gitignore = source.join(".gitignore");
    let mut content = if gitignore.exists() {
        fs::read_to_string(&gitignore)
            .with_context(|| format!("reading '{}'", gitignore.display()))?
    } else {
        String::new()
    };
    if !content.lines().any(|line| line.trim() == "mod") {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str("mod\n");
        fs::write(&gitignore, content)
            .with_context(|| format!("writing '{}'", gitignore.display()))?;
    }

    let scmversion = source.join(".scmversion");
    fs::write(&scmversion, "").with_context(|| format!("writing '{}'", scmversion.display()))
}
