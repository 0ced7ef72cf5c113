//! Version key → build variant resolution.
//!
//! The registry is plain data loaded from the `[variants.<key>]` tables of the
//! configuration. Resolution is a pure lookup: it never touches the filesystem
//! and never runs anything.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::config::resolve_path;
use crate::error::VariantError;

/// File names of the three deliverables of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactNames {
    pub kernel_image: String,
    pub modules_archive: String,
    pub headers_archive: String,
}

impl ArtifactNames {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        [
            self.kernel_image.as_str(),
            self.modules_archive.as_str(),
            self.headers_archive.as_str(),
        ]
        .into_iter()
    }
}

/// One buildable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildVariant {
    pub key: String,
    pub source_branch: String,
    pub config_file: PathBuf,
    pub artifact_names: ArtifactNames,
    /// Check out the last first-parent commit before this date instead of the
    /// branch tip.
    pub pinned_before: Option<String>,
}

/// `[variants.<key>]` table as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct VariantToml {
    branch: String,
    config: Option<String>,
    kernel_image: Option<String>,
    modules_archive: Option<String>,
    headers_archive: Option<String>,
    pinned_before: Option<String>,
}

impl VariantToml {
    /// Fill in derived names and resolve the config path against `base_dir`.
    pub(crate) fn into_variant(self, key: &str, base_dir: &Path) -> Result<BuildVariant> {
        let branch = self.branch.trim();
        if branch.is_empty() {
            bail!("variant '{}': branch must not be empty", key);
        }

        let config = self
            .config
            .unwrap_or_else(|| format!("configs/{}.conf", key));
        let artifact_names = ArtifactNames {
            kernel_image: self
                .kernel_image
                .unwrap_or_else(|| format!("bzImage-{}", key)),
            modules_archive: self
                .modules_archive
                .unwrap_or_else(|| format!("modules-{}.tar.zst", key)),
            headers_archive: self
                .headers_archive
                .unwrap_or_else(|| format!("headers-{}.tar.zst", key)),
        };
        for name in artifact_names.iter() {
            validate_artifact_name(key, name)?;
        }
        let mut seen: Vec<&str> = artifact_names.iter().collect();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != 3 {
            bail!("variant '{}': artifact names must be distinct", key);
        }

        Ok(BuildVariant {
            key: key.to_string(),
            source_branch: branch.to_string(),
            config_file: resolve_path(base_dir, config.trim()),
            artifact_names,
            pinned_before: self
                .pinned_before
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }
}

fn validate_artifact_name(key: &str, name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!(
            "variant '{}': artifact name '{}' must be a plain file name",
            key,
            name
        ),
    }
}

/// Static mapping from version key to [`BuildVariant`].
#[derive(Debug, Clone, Default)]
pub struct VariantRegistry {
    variants: BTreeMap<String, BuildVariant>,
}

impl VariantRegistry {
    pub fn new(variants: impl IntoIterator<Item = BuildVariant>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for variant in variants {
            if variant.key.trim().is_empty() {
                bail!("variant registry contains an empty version key");
            }
            if let Some(previous) = map.insert(variant.key.clone(), variant) {
                bail!("version key '{}' is declared more than once", previous.key);
            }
        }
        Ok(Self { variants: map })
    }

    pub(crate) fn from_toml(
        entries: BTreeMap<String, VariantToml>,
        base_dir: &Path,
    ) -> Result<Self> {
        let variants = entries
            .into_iter()
            .map(|(key, entry)| entry.into_variant(&key, base_dir))
            .collect::<Result<Vec<_>>>()?;
        Self::new(variants)
    }

    /// Look up `key`. Unknown keys report every valid key.
    pub fn resolve(&self, key: &str) -> Result<BuildVariant, VariantError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(VariantError::EmptyKey);
        }
        self.variants
            .get(key)
            .cloned()
            .ok_or_else(|| VariantError::NotFound {
                key: key.to_string(),
                known: self.keys().map(str::to_string).collect(),
            })
    }

    /// Valid keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.variants.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VariantRegistry {
        let toml = r#"
            [v1]
            branch = "rel-1"
            config = "cfg1"
            kernel_image = "image-1"
            modules_archive = "mods-1.tar"
            headers_archive = "hdrs-1.tar"

            [v2]
            branch = "rel-2"
        "#;
        let entries: BTreeMap<String, VariantToml> = toml::from_str(toml).unwrap();
        VariantRegistry::from_toml(entries, Path::new("/etc/kb")).unwrap()
    }

    #[test]
    fn resolves_explicit_variant() {
        let variant = registry().resolve("v1").unwrap();
        assert_eq!(variant.key, "v1");
        assert_eq!(variant.source_branch, "rel-1");
        assert_eq!(variant.config_file, PathBuf::from("/etc/kb/cfg1"));
        assert_eq!(
            variant.artifact_names,
            ArtifactNames {
                kernel_image: "image-1".into(),
                modules_archive: "mods-1.tar".into(),
                headers_archive: "hdrs-1.tar".into(),
            }
        );
        assert_eq!(variant.pinned_before, None);
    }

    #[test]
    fn derives_missing_names_from_key() {
        let variant = registry().resolve("v2").unwrap();
        assert_eq!(variant.config_file, PathBuf::from("/etc/kb/configs/v2.conf"));
        assert_eq!(variant.artifact_names.kernel_image, "bzImage-v2");
        assert_eq!(variant.artifact_names.modules_archive, "modules-v2.tar.zst");
        assert_eq!(variant.artifact_names.headers_archive, "headers-v2.tar.zst");
    }

    #[test]
    fn unknown_key_lists_valid_keys() {
        let err = registry().resolve("v9").unwrap_err();
        assert_eq!(
            err,
            VariantError::NotFound {
                key: "v9".into(),
                known: vec!["v1".into(), "v2".into()],
            }
        );
        assert!(err.to_string().contains("v1, v2"));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(registry().resolve("  "), Err(VariantError::EmptyKey));
    }

    #[test]
    fn artifact_names_must_be_plain_file_names() {
        let entry: VariantToml =
            toml::from_str("branch = \"b\"\nkernel_image = \"../escape\"").unwrap();
        assert!(entry.into_variant("k", Path::new(".")).is_err());
    }

    #[test]
    fn artifact_names_must_be_distinct() {
        let entry: VariantToml = toml::from_str(
            "branch = \"b\"\nmodules_archive = \"same.tar\"\nheaders_archive = \"same.tar\"",
        )
        .unwrap();
        let err = entry.into_variant("k", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let variant = registry().resolve("v1").unwrap();
        assert!(VariantRegistry::new([variant.clone(), variant]).is_err());
    }
}
