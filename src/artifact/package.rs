//! Final deliverables: kernel image, module archive, header archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::artifact::archive::create_tar_zst;
use crate::error::PackagingError;
use crate::variant::{ArtifactNames, BuildVariant};

/// What the build stages produced, recorded as each stage succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutputs {
    pub kernel_image: Option<PathBuf>,
    pub modules_root: Option<PathBuf>,
    pub headers_root: Option<PathBuf>,
    pub kernel_release: Option<String>,
}

/// Writes the three artifacts of a run into the output directory.
#[derive(Debug, Clone)]
pub struct Packager {
    output_dir: PathBuf,
    compression_level: i32,
    workers: u32,
}

impl Packager {
    pub fn new(output_dir: impl Into<PathBuf>, compression_level: i32, workers: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            compression_level,
            workers,
        }
    }

    /// Package `outputs` under the names declared by `variant`.
    ///
    /// Every input is checked before anything is written. Archives are
    /// compressed to a hidden temporary name and renamed into place; the kernel
    /// image is moved last. Returns the artifact paths in the order kernel,
    /// modules, headers.
    pub fn package(
        &self,
        outputs: &StageOutputs,
        variant: &BuildVariant,
    ) -> Result<Vec<PathBuf>, PackagingError> {
        let kernel_image = require(&outputs.kernel_image, "kernel image", Path::is_file)?;
        let modules_root = require(&outputs.modules_root, "module tree", Path::is_dir)?;
        let headers_root = require(&outputs.headers_root, "header tree", Path::is_dir)?;

        let names = &variant.artifact_names;
        self.check_output_dir(names)?;
        fs::create_dir_all(&self.output_dir).map_err(|source| PackagingError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let modules_archive = self.archive(modules_root, &names.modules_archive)?;
        let headers_archive = match self.archive(headers_root, &names.headers_archive) {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&modules_archive);
                return Err(e);
            }
        };

        let kernel_dest = self.output_dir.join(&names.kernel_image);
        if let Err(source) = move_file(kernel_image, &kernel_dest) {
            let _ = fs::remove_file(&modules_archive);
            let _ = fs::remove_file(&headers_archive);
            return Err(PackagingError::Io {
                path: kernel_dest,
                source,
            });
        }
        info!(path = %kernel_dest.display(), "kernel image packaged");

        Ok(vec![kernel_dest, modules_archive, headers_archive])
    }

    /// The output directory may only hold this variant's artifacts (from an
    /// earlier run) or their temporary names.
    fn check_output_dir(&self, names: &ArtifactNames) -> Result<(), PackagingError> {
        let io_err = |source| PackagingError::Io {
            path: self.output_dir.clone(),
            source,
        };
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let known = names
                .iter()
                .any(|name| file_name == name || file_name == temp_name(name));
            if !known {
                return Err(PackagingError::ForeignOutput { path: entry.path() });
            }
        }
        Ok(())
    }

    fn archive(&self, root: &Path, name: &str) -> Result<PathBuf, PackagingError> {
        let dest = self.output_dir.join(name);
        let tmp = self.output_dir.join(temp_name(name));

        info!(
            root = %root.display(),
            archive = %dest.display(),
            level = self.compression_level,
            "compressing"
        );
        let written = create_tar_zst(root, &tmp, self.compression_level, self.workers)
            .and_then(|()| fs::rename(&tmp, &dest));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(PackagingError::Io { path: dest, source });
        }
        Ok(dest)
    }
}

fn temp_name(name: &str) -> String {
    format!(".{}.tmp", name)
}

fn require<'a>(
    recorded: &'a Option<PathBuf>,
    what: &'static str,
    exists: fn(&Path) -> bool,
) -> Result<&'a Path, PackagingError> {
    let path = recorded
        .as_deref()
        .ok_or(PackagingError::Unrecorded { what })?;
    if !exists(path) {
        return Err(PackagingError::MissingOutput {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(path)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant() -> BuildVariant {
        BuildVariant {
            key: "v1".into(),
            source_branch: "rel-1".into(),
            config_file: PathBuf::from("cfg1"),
            artifact_names: ArtifactNames {
                kernel_image: "image-1".into(),
                modules_archive: "mods-1.tar".into(),
                headers_archive: "hdrs-1.tar".into(),
            },
            pinned_before: None,
        }
    }

    fn built_outputs(root: &Path) -> StageOutputs {
        let image = root.join("tree/arch/x86/boot/bzImage");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"kernel").unwrap();

        let modules = root.join("staging/modules/lib/modules");
        fs::create_dir_all(modules.join("5.15.59/kernel")).unwrap();
        fs::write(modules.join("5.15.59/kernel/snd.ko"), b"ko").unwrap();

        let headers = root.join("staging/headers");
        fs::create_dir_all(headers.join("include/linux")).unwrap();
        fs::write(headers.join("include/linux/types.h"), b"").unwrap();

        StageOutputs {
            kernel_image: Some(image),
            modules_root: Some(modules),
            headers_root: Some(headers),
            kernel_release: Some("5.15.59".into()),
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn produces_exactly_the_declared_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let outputs = built_outputs(temp.path());
        let out = temp.path().join("out");

        let paths = Packager::new(&out, 3, 0).package(&outputs, &variant()).unwrap();

        assert_eq!(
            paths,
            vec![out.join("image-1"), out.join("mods-1.tar"), out.join("hdrs-1.tar")]
        );
        assert_eq!(listing(&out), vec!["hdrs-1.tar", "image-1", "mods-1.tar"]);
        assert_eq!(fs::read(out.join("image-1")).unwrap(), b"kernel");
        assert!(!outputs.kernel_image.unwrap().exists());
    }

    #[test]
    fn missing_kernel_image_fails_before_writing_anything() {
        let temp = tempfile::tempdir().unwrap();
        let outputs = built_outputs(temp.path());
        fs::remove_file(outputs.kernel_image.as_ref().unwrap()).unwrap();
        let out = temp.path().join("out");

        let err = Packager::new(&out, 3, 0)
            .package(&outputs, &variant())
            .unwrap_err();

        assert!(matches!(
            err,
            PackagingError::MissingOutput {
                what: "kernel image",
                ..
            }
        ));
        assert!(!out.exists());
    }

    #[test]
    fn stale_files_in_output_dir_are_refused() {
        let temp = tempfile::tempdir().unwrap();
        let outputs = built_outputs(temp.path());
        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("bzImage-5.15"), b"other variant").unwrap();

        let err = Packager::new(&out, 3, 0)
            .package(&outputs, &variant())
            .unwrap_err();

        match err {
            PackagingError::ForeignOutput { path } => assert_eq!(path, out.join("bzImage-5.15")),
            other => panic!("expected ForeignOutput, got {:?}", other),
        }
        assert_eq!(listing(&out), vec!["bzImage-5.15"]);
        assert!(outputs.kernel_image.unwrap().exists());
    }

    #[test]
    fn previous_artifacts_of_same_variant_are_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let outputs = built_outputs(temp.path());
        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("image-1"), b"old kernel").unwrap();
        fs::write(out.join(".mods-1.tar.tmp"), b"partial").unwrap();

        Packager::new(&out, 3, 0).package(&outputs, &variant()).unwrap();

        assert_eq!(listing(&out), vec!["hdrs-1.tar", "image-1", "mods-1.tar"]);
        assert_eq!(fs::read(out.join("image-1")).unwrap(), b"kernel");
    }

    #[test]
    fn unrecorded_output_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let mut outputs = built_outputs(temp.path());
        outputs.modules_root = None;

        let err = Packager::new(temp.path().join("out"), 3, 0)
            .package(&outputs, &variant())
            .unwrap_err();
        assert!(matches!(err, PackagingError::Unrecorded { what: "module tree" }));
    }
}
