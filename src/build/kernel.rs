//! Kernel, module and header builds.
//!
//! All make invocations run at the root of the source tree. The config file of
//! the variant is copied verbatim to `.config` and `make olddefconfig` fills in
//! anything it leaves unset.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::build::context::BuildLayout;
use crate::process::{Cmd, Shell};

/// Copy the variant config into the tree and resolve defaults.
pub fn seed_config(shell: &dyn Shell, layout: &BuildLayout, config_file: &Path) -> Result<()> {
    if !config_file.is_file() {
        bail!("kernel config not found: {}", config_file.display());
    }

    let source = layout.source_dir();
    if !source.join("Makefile").exists() {
        bail!(
            "invalid kernel source at {} - no Makefile found",
            source.display()
        );
    }

    let dot_config = source.join(".config");
    fs::copy(config_file, &dot_config).with_context(|| {
        format!(
            "copying kernel config '{}' to '{}'",
            config_file.display(),
            dot_config.display()
        )
    })?;

    info!(config = %config_file.display(), "resolving config defaults");
    shell.run(
        &Cmd::new("make")
            .arg("olddefconfig")
            .current_dir(&source)
            .error_msg("make olddefconfig failed"),
    )?;
    Ok(())
}

/// What `make <target>` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBuild {
    /// Where the image is expected; existence is checked at packaging.
    pub image: PathBuf,
    /// `None` when the tree does not say.
    pub release: Option<String>,
}

/// Build the kernel image and read the resulting release string.
pub fn build_kernel(
    shell: &dyn Shell,
    layout: &BuildLayout,
    target: &str,
    jobs: usize,
) -> Result<KernelBuild> {
    info!(target, jobs, "building kernel");
    shell.run(
        &Cmd::new("make")
            .arg(format!("-j{}", jobs))
            .arg(target)
            .current_dir(layout.source_dir())
            .error_msg("kernel build failed")
            .interactive(),
    )?;

    let release = match kernel_release(&layout.source_dir()) {
        Ok(release) => {
            info!(release = %release, "kernel built");
            Some(release)
        }
        Err(e) => {
            warn!("could not determine kernel release: {:#}", e);
            None
        }
    };
    Ok(KernelBuild {
        image: layout.kernel_image(),
        release,
    })
}

/// Build and install modules into the staging area. Returns the module root.
pub fn build_modules(shell: &dyn Shell, layout: &BuildLayout, jobs: usize) -> Result<PathBuf> {
    let source = layout.source_dir();

    info!(jobs, "building modules");
    shell.run(
        &Cmd::new("make")
            .arg(format!("-j{}", jobs))
            .arg("modules")
            .current_dir(&source)
            .error_msg("module build failed")
            .interactive(),
    )?;

    let install_dir = layout.modules_install_dir();
    reset_dir(&install_dir)?;
    info!(path = %install_dir.display(), "installing modules");
    shell.run(
        &Cmd::new("make")
            .arg(format!("INSTALL_MOD_PATH={}", install_dir.display()))
            .arg("modules_install")
            .current_dir(&source)
            .error_msg("module install failed"),
    )?;

    let modules_root = layout.modules_root();
    remove_build_links(&modules_root)?;
    Ok(modules_root)
}

/// Install the exported kernel headers into the staging area.
pub fn build_headers(shell: &dyn Shell, layout: &BuildLayout) -> Result<PathBuf> {
    let headers_root = layout.headers_root();
    reset_dir(&headers_root)?;

    info!(path = %headers_root.display(), "installing headers");
    shell.run(
        &Cmd::new("make")
            .arg(format!("INSTALL_HDR_PATH={}", headers_root.display()))
            .arg("headers_install")
            .current_dir(layout.source_dir())
            .error_msg("header install failed"),
    )?;
    Ok(headers_root)
}

/// `modules_install` leaves `build`/`source` symlinks pointing back into the
/// tree; they dangle once the archive is unpacked elsewhere.
fn remove_build_links(modules_root: &Path) -> Result<()> {
    if !modules_root.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(modules_root)
        .with_context(|| format!("reading module root '{}'", modules_root.display()))?
    {
        let release_dir = entry?.path();
        for link in ["build", "source"] {
            let path = release_dir.join(link);
            if path.is_symlink() {
                fs::remove_file(&path)
                    .with_context(|| format!("removing '{}'", path.display()))?;
            }
        }
    }
    Ok(())
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("removing '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))
}

/// Kernel release string of a configured tree (e.g. "5.15.59-eupnea").
pub fn kernel_release(source_dir: &Path) -> Result<String> {
    let release_path = source_dir.join("include/config/kernel.release");
    if release_path.exists() {
        return Ok(fs::read_to_string(&release_path)?.trim().to_string());
    }

    let makefile = source_dir.join("Makefile");
    if makefile.exists() {
        let content = fs::read_to_string(&makefile)?;
        let mut version = String::new();
        let mut patchlevel = String::new();
        let mut sublevel = String::new();
        let mut extraversion = String::new();

        for line in content.lines() {
            if let Some(v) = line.strip_prefix("VERSION = ") {
                version = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("PATCHLEVEL = ") {
                patchlevel = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("SUBLEVEL = ") {
                sublevel = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("EXTRAVERSION = ") {
                extraversion = v.trim().to_string();
            }
        }

        if !version.is_empty() && !patchlevel.is_empty() {
            return Ok(format!(
                "{}.{}.{}{}",
                version, patchlevel, sublevel, extraversion
            ));
        }
    }

    bail!("could not determine kernel release")
}
