//! Directory context for one run.
//!
//! Every stage receives its paths from a [`BuildLayout`]; nothing changes the
//! process working directory.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::BuildSettings;

const LOCK_FILENAME: &str = ".kernel-builder.lock";
const SOURCE_MARKER_FILENAME: &str = ".kernel-builder-source";
const MANIFEST_FILENAME: &str = "run-manifest.json";

/// Paths used by a run, all derived from the work and output directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    work_dir: PathBuf,
    output_dir: PathBuf,
    kernel_image_path: PathBuf,
}

impl BuildLayout {
    pub fn new(work_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
            kernel_image_path: PathBuf::from("arch/x86/boot/bzImage"),
        }
    }

    pub fn from_settings(settings: &BuildSettings) -> Self {
        Self::new(&settings.work_dir, &settings.output_dir)
            .with_kernel_image_path(&settings.kernel_image_path)
    }

    pub fn with_kernel_image_path(mut self, relative: impl Into<PathBuf>) -> Self {
        self.kernel_image_path = relative.into();
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Root of the kernel source tree.
    pub fn source_dir(&self) -> PathBuf {
        self.work_dir.join("chromeos-kernel")
    }

    /// Records which branch/pin the source tree was cloned for.
    pub fn source_marker(&self) -> PathBuf {
        self.work_dir.join(SOURCE_MARKER_FILENAME)
    }

    /// Kernel image as produced by the build.
    pub fn kernel_image(&self) -> PathBuf {
        self.source_dir().join(&self.kernel_image_path)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    /// `INSTALL_MOD_PATH` for `make modules_install`.
    pub fn modules_install_dir(&self) -> PathBuf {
        self.staging_dir().join("modules")
    }

    /// Root of the module tree as installed (`<release>/kernel/...` beneath it).
    pub fn modules_root(&self) -> PathBuf {
        self.modules_install_dir().join("lib/modules")
    }

    /// `INSTALL_HDR_PATH` for `make headers_install`.
    pub fn headers_root(&self) -> PathBuf {
        self.staging_dir().join("headers")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(MANIFEST_FILENAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.work_dir.join(LOCK_FILENAME)
    }

    /// Take exclusive ownership of the work directory, creating it if needed.
    pub fn lock(&self) -> Result<WorkDirLock> {
        fs::create_dir_all(&self.work_dir).with_context(|| {
            format!("creating work directory '{}'", self.work_dir.display())
        })?;

        let lock_path = self.lock_path();
        // The lock file is never unlinked: removing a file another process
        // still holds would let a third process lock a fresh inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "work directory '{}' is in use by another run (lock: {})",
                self.work_dir.display(),
                lock_path.display()
            );
        }

        Ok(WorkDirLock { _file: file })
    }
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct WorkDirLock {
    _file: File,
}
