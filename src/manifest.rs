//! Run manifest: a JSON record of what one run did.
//!
//! Written to the work directory (never the output directory) after every run,
//! successful or not, so the output directory only ever holds artifacts.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::pipeline::{PatchReport, PipelineReport, RunState, Stage, StageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub variant: String,
    pub branch: String,
    pub pinned_before: Option<String>,
    /// "success" or "aborted".
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub kernel_release: Option<String>,
    pub aborted_stage: Option<Stage>,
    pub reason: Option<String>,
    pub stages: Vec<StageResult>,
    pub patches: Vec<PatchReport>,
    pub artifacts: Vec<ArtifactRecord>,
}

impl RunManifest {
    pub fn from_report(
        report: &PipelineReport,
        started_at: OffsetDateTime,
        finished_at: OffsetDateTime,
    ) -> Result<Self> {
        let (status, aborted_stage, reason) = match &report.state {
            RunState::Aborted { stage, reason } => ("aborted", Some(*stage), Some(reason.clone())),
            RunState::Succeeded => ("success", None, None),
            other => return Err(anyhow!("run has not finished: {:?}", other)),
        };

        let artifacts = report
            .artifacts
            .iter()
            .map(|path| artifact_record(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            variant: report.variant.key.clone(),
            branch: report.variant.source_branch.clone(),
            pinned_before: report.variant.pinned_before.clone(),
            status: status.to_string(),
            started_at: started_at.format(&Rfc3339)?,
            finished_at: finished_at.format(&Rfc3339)?,
            kernel_release: report.outputs.kernel_release.clone(),
            aborted_stage,
            reason,
            stages: report.stages.clone(),
            patches: report.patches.clone(),
            artifacts,
        })
    }

    /// Write atomically: serialize to a temporary sibling, then rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let payload = serde_json::to_vec_pretty(self).context("serializing run manifest")?;
        fs::write(&tmp, payload)
            .with_context(|| format!("writing temp file '{}'", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| {
            format!(
                "renaming temp file '{}' to '{}'",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("reading run manifest '{}'", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))
    }
}

fn artifact_record(path: &Path) -> Result<ArtifactRecord> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("artifact path without file name '{}'", path.display()))?
        .to_string_lossy()
        .into_owned();
    let (sha256, size_bytes) = sha256_file(path)?;
    Ok(ArtifactRecord {
        file_name,
        size_bytes,
        sha256,
    })
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
