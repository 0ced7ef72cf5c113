//! Pipeline configuration.
//!
//! A single TOML document carries the build settings, the variant registry and
//! the patch list:
//!
//! ```toml
//! [build]
//! repository = "https://chromium.googlesource.com/chromiumos/third_party/kernel.git"
//!
//! [variants."5.15"]
//! branch = "chromeos-5.15"
//!
//! [[patches]]
//! name = "bloog-audio"
//! file = "patches/bloog-audio.patch"
//! severity = "benign"
//! ```
//!
//! Relative paths resolve against the directory holding the configuration file.
//! The repository's `kernel-builder.toml` is embedded in the binary and used
//! when no file is given.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::patch::{PatchSet, PatchToml};
use crate::variant::{BuildVariant, VariantRegistry, VariantToml};

/// The configuration shipped with the repository.
pub const EMBEDDED_CONFIG: &str = include_str!("../kernel-builder.toml");

pub const DEFAULT_REPOSITORY: &str =
    "https://chromium.googlesource.com/chromiumos/third_party/kernel.git";
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 19;

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Git remote the source branches are cloned from.
    pub repository: String,
    /// Scratch area owned by the run (source tree, staging, manifest).
    pub work_dir: PathBuf,
    /// Where the three artifacts land.
    pub output_dir: PathBuf,
    /// Parallel jobs for make; 0 means one per CPU.
    pub jobs: usize,
    pub compression_level: i32,
    /// Make target producing the kernel image.
    pub kernel_target: String,
    /// Kernel image location relative to the tree root.
    pub kernel_image_path: PathBuf,
}

impl BuildSettings {
    /// `jobs`, with 0 replaced by the CPU count.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(e) => {
                tracing::warn!("could not detect CPU count ({}), using 4 jobs", e);
                4
            }
        }
    }
}

/// Fully loaded configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub build: BuildSettings,
    pub variants: VariantRegistry,
    pub patches: PatchSet,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    build: BuildToml,
    #[serde(default)]
    variants: BTreeMap<String, VariantToml>,
    #[serde(default)]
    patches: Vec<PatchToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    repository: Option<String>,
    work_dir: Option<String>,
    output_dir: Option<String>,
    jobs: Option<usize>,
    compression_level: Option<i32>,
    kernel_target: Option<String>,
    kernel_image_path: Option<String>,
}

impl Config {
    /// Load a configuration file. Relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading configuration '{}'", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
            .with_context(|| format!("loading configuration '{}'", path.display()))
    }

    /// The embedded configuration, with relative paths resolved against `base_dir`.
    pub fn embedded(base_dir: &Path) -> Result<Self> {
        Self::parse(EMBEDDED_CONFIG, base_dir).context("loading embedded configuration")
    }

    /// Parse `text`. A relative `base_dir` is taken relative to the current
    /// directory; every resolved path comes out absolute.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text).context("parsing TOML")?;
        // git runs inside the source tree; patch paths must be absolute.
        let base_dir = &absolute_base(base_dir)?;

        let build = parsed.build;
        let build = BuildSettings {
            repository: build
                .repository
                .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string()),
            work_dir: resolve_path(base_dir, build.work_dir.as_deref().unwrap_or("build")),
            output_dir: resolve_path(base_dir, build.output_dir.as_deref().unwrap_or("out")),
            jobs: build.jobs.unwrap_or(0),
            compression_level: build
                .compression_level
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            kernel_target: build.kernel_target.unwrap_or_else(|| "bzImage".to_string()),
            kernel_image_path: PathBuf::from(
                build
                    .kernel_image_path
                    .as_deref()
                    .unwrap_or("arch/x86/boot/bzImage"),
            ),
        };

        let variants = VariantRegistry::from_toml(parsed.variants, base_dir)?;
        let patches = PatchSet::new(
            parsed
                .patches
                .into_iter()
                .map(|p| p.into_spec(base_dir))
                .collect(),
        )?;

        Ok(Self {
            build,
            variants,
            patches,
        })
    }

    /// Fail, listing every path, when a patch file or the kernel config of
    /// `variant` is missing on disk.
    ///
    /// Loading does not look at these files, so `--list` works without them.
    pub fn check_inputs(&self, variant: &BuildVariant) -> Result<()> {
        let missing: Vec<&Path> = self
            .patches
            .iter()
            .map(|p| p.patch_file.as_path())
            .chain(std::iter::once(variant.config_file.as_path()))
            .filter(|path| !path.is_file())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let list = missing
            .iter()
            .map(|p| format!("  {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(
            "build inputs for '{}' are missing (patch files and kernel configs are resolved against the configuration's directory):\n{}",
            variant.key,
            list
        )
    }
}

fn absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_absolute() {
        return Ok(base_dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolving current directory")?;
    Ok(cwd.join(base_dir))
}

/// Join `raw` onto `base` unless it is already absolute.
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}
