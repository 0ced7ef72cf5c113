//! Ordered build stages.
//!
//! ```text
//! AcquireSource → ApplyPatches → BuildKernel → BuildModules → BuildHeaders → PackageArtifacts
//! ```
//!
//! Stages run strictly in order. The first stage that fails aborts the run:
//! its duration and error detail are recorded and nothing after it executes,
//! so a failed build never reaches packaging. Nothing is retried.

pub mod patches;
pub(crate) mod source;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::artifact::{Packager, StageOutputs};
use crate::build::context::BuildLayout;
use crate::build::kernel;
use crate::config::BuildSettings;
use crate::manifest::RunManifest;
use crate::patch::PatchSet;
use crate::process::Shell;
use crate::variant::{BuildVariant, VariantRegistry};

pub use patches::PatchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AcquireSource,
    ApplyPatches,
    BuildKernel,
    BuildModules,
    BuildHeaders,
    PackageArtifacts,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 6] = [
        Stage::AcquireSource,
        Stage::ApplyPatches,
        Stage::BuildKernel,
        Stage::BuildModules,
        Stage::BuildHeaders,
        Stage::PackageArtifacts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::AcquireSource => "acquire source",
            Stage::ApplyPatches => "apply patches",
            Stage::BuildKernel => "build kernel",
            Stage::BuildModules => "build modules",
            Stage::BuildHeaders => "build headers",
            Stage::PackageArtifacts => "package artifacts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of one stage. `error_detail` is set iff the stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub error_detail: Option<String>,
}

impl StageResult {
    fn pending(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            duration_ms: 0,
            error_detail: None,
        }
    }
}

/// State of the run as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running(Stage),
    Succeeded,
    Aborted { stage: Stage, reason: String },
}

/// Everything a finished run reports to its caller.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub variant: BuildVariant,
    pub state: RunState,
    /// One entry per stage that started, in order.
    pub stages: Vec<StageResult>,
    pub patches: Vec<PatchReport>,
    pub outputs: StageOutputs,
    /// Final artifact paths; empty unless the run succeeded.
    pub artifacts: Vec<PathBuf>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
    }

    /// Whether `stage` started at all.
    pub fn ran(&self, stage: Stage) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.duration_ms).sum()
    }
}

/// Runs the stages for one variant inside an exclusively owned work directory.
pub struct StageRunner<'a> {
    shell: &'a dyn Shell,
    settings: &'a BuildSettings,
    patches: &'a PatchSet,
    layout: BuildLayout,
    fresh: bool,
}

impl<'a> StageRunner<'a> {
    pub fn new(shell: &'a dyn Shell, settings: &'a BuildSettings, patches: &'a PatchSet) -> Self {
        Self {
            shell,
            settings,
            patches,
            layout: BuildLayout::from_settings(settings),
            fresh: false,
        }
    }

    /// Discard any existing source tree instead of reusing it.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Resolve `key` and run it. Resolution failures return before anything
    /// touches the filesystem or runs a command.
    pub fn run_key(&self, variants: &VariantRegistry, key: &str) -> Result<PipelineReport> {
        let variant = variants.resolve(key)?;
        self.run(&variant)
    }

    /// Run every stage for `variant`.
    ///
    /// A stage failure is not an `Err`: it is reported as
    /// [`RunState::Aborted`]. `Err` means the run could not be set up, e.g. the
    /// work directory is locked by another run.
    pub fn run(&self, variant: &BuildVariant) -> Result<PipelineReport> {
        let _lock = self.layout.lock()?;
        let started_at = OffsetDateTime::now_utc();
        info!(
            variant = %variant.key,
            branch = %variant.source_branch,
            work_dir = %self.layout.work_dir().display(),
            "starting build"
        );

        let mut report = PipelineReport {
            variant: variant.clone(),
            state: RunState::NotStarted,
            stages: Vec::with_capacity(Stage::ALL.len()),
            patches: Vec::new(),
            outputs: StageOutputs::default(),
            artifacts: Vec::new(),
        };

        for stage in Stage::ALL {
            report.stages.push(StageResult::pending(stage));
            let idx = report.stages.len() - 1;
            report.stages[idx].status = StageStatus::Running;
            report.state = RunState::Running(stage);
            info!(stage = %stage, "stage started");

            let start = Instant::now();
            let outcome = self.execute(stage, variant, &mut report);
            let duration_ms = start.elapsed().as_millis() as u64;

            let result = &mut report.stages[idx];
            result.duration_ms = duration_ms;
            match outcome {
                Ok(()) => {
                    result.status = StageStatus::Succeeded;
                    info!(stage = %stage, duration_ms, "stage succeeded");
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    result.status = StageStatus::Failed;
                    result.error_detail = Some(reason.clone());
                    error!(stage = %stage, duration_ms, "stage failed: {}", reason);
                    report.state = RunState::Aborted { stage, reason };
                    break;
                }
            }
        }

        if matches!(report.state, RunState::Running(_)) {
            report.state = RunState::Succeeded;
            info!(
                variant = %variant.key,
                duration_ms = report.total_duration_ms(),
                "build succeeded"
            );
        }

        let finished_at = OffsetDateTime::now_utc();
        if let Err(e) = self.write_manifest(&report, started_at, finished_at) {
            warn!("could not write run manifest: {:#}", e);
        }
        Ok(report)
    }

    fn execute(&self, stage: Stage, variant: &BuildVariant, report: &mut PipelineReport) -> Result<()> {
        let jobs = self.settings.effective_jobs();
        match stage {
            Stage::AcquireSource => {
                source::acquire_source(
                    self.shell,
                    &self.layout,
                    &self.settings.repository,
                    variant,
                    self.fresh,
                )?;
            }
            Stage::ApplyPatches => {
                patches::apply_patches(
                    self.shell,
                    self.patches,
                    &self.layout.source_dir(),
                    &mut report.patches,
                )?;
            }
            Stage::BuildKernel => {
                kernel::seed_config(self.shell, &self.layout, &variant.config_file)?;
                let built =
                    kernel::build_kernel(self.shell, &self.layout, &self.settings.kernel_target, jobs)?;
                report.outputs.kernel_image = Some(built.image);
                report.outputs.kernel_release = built.release;
            }
            Stage::BuildModules => {
                report.outputs.modules_root = Some(kernel::build_modules(self.shell, &self.layout, jobs)?);
            }
            Stage::BuildHeaders => {
                report.outputs.headers_root = Some(kernel::build_headers(self.shell, &self.layout)?);
            }
            Stage::PackageArtifacts => {
                let workers = u32::try_from(jobs).unwrap_or(u32::MAX);
                let packager = Packager::new(
                    self.layout.output_dir(),
                    self.settings.compression_level,
                    workers,
                );
                report.artifacts = packager
                    .package(&report.outputs, variant)
                    .context("packaging artifacts")?;
            }
        }
        Ok(())
    }

    fn write_manifest(
        &self,
        report: &PipelineReport,
        started_at: OffsetDateTime,
        finished_at: OffsetDateTime,
    ) -> Result<()> {
        let manifest = RunManifest::from_report(report, started_at, finished_at)?;
        manifest.write(&self.layout.manifest_path())
    }
}
