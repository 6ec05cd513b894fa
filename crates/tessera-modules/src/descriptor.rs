//! Module descriptor (`module.json`) parsing and validation.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModuleError, ModuleResult};
use crate::id::ModuleId;

/// Descriptor file name inside a module directory.
pub const DESCRIPTOR_FILE_NAME: &str = "module.json";

/// Largest descriptor accepted, in bytes.
pub const MAX_DESCRIPTOR_SIZE: u64 = 1_048_576;

/// Parse a semantic version, padding `"1"` and `"1.0"` with zeros.
///
/// Four-part versions are rejected.
///
/// # Errors
///
/// Returns the `semver` parse error for anything that is not a version.
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_end);
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}

mod lenient_version {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(version: &Version, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(version)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_version(&raw).map_err(serde::de::Error::custom)
    }
}

fn default_version() -> Version {
    Version::new(0, 0, 0)
}

/// A declared dependency on another module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequirement {
    /// Id of the required module.
    pub id: ModuleId,
    /// Lowest acceptable version.
    #[serde(with = "lenient_version")]
    pub minimum_version: Version,
}

impl DependencyRequirement {
    /// Create a requirement.
    #[must_use]
    pub fn new(id: ModuleId, minimum_version: Version) -> Self {
        Self {
            id,
            minimum_version,
        }
    }

    /// Whether `version` meets the minimum.
    #[must_use]
    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        *version >= self.minimum_version
    }
}

/// License reference by SPDX id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseInformation {
    /// SPDX identifier such as `MIT`.
    pub spdx_id: String,
    /// License text location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Human-facing text for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedInformation {
    /// Language tag such as `en-US`.
    pub language: String,
    /// Display name.
    pub name: String,
    /// Free-form category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// License that applies to this module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseInformation>,
}

/// Publisher details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralInformation {
    /// Publishing company.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    /// People who contributed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<String>,
    /// Copyright line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    /// Project homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Trademark notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trademark: Option<String>,
    /// Source repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Support location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
}

/// Build provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInformation {
    /// When the build was released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_timestamp: Option<DateTime<Utc>>,
    /// Commit or tag the build came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs_reference: Option<String>,
}

/// Parsed contents of a `module.json` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module id.
    pub id: ModuleId,
    /// Entry library, relative to the module directory.
    pub entry_library: String,
    /// Declared dependencies.
    pub dependencies: Vec<DependencyRequirement>,
    /// Build version.
    #[serde(default = "default_version", with = "lenient_version")]
    pub version: Version,
    /// Refuse to unload once loaded.
    #[serde(default)]
    pub unload_disabled: bool,
    /// Localized names and descriptions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<LocalizedInformation>,
    /// Publisher details.
    #[serde(default)]
    pub general: GeneralInformation,
    /// Build provenance.
    #[serde(default)]
    pub build: BuildInformation,
    /// Licenses of bundled third-party code.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used_licenses: Vec<LicenseInformation>,
}

/// A descriptor together with where and when it was read.
#[derive(Debug, Clone)]
pub struct LoadedDescriptor {
    /// The descriptor.
    pub descriptor: ModuleDescriptor,
    /// Path of the file it was read from.
    pub path: PathBuf,
    /// File modification time, when the platform reports one.
    pub modified: Option<SystemTime>,
}

impl ModuleDescriptor {
    /// A minimal descriptor with version `0.0.0` and no metadata.
    #[must_use]
    pub fn new(id: ModuleId, entry_library: impl Into<String>) -> Self {
        Self {
            id,
            entry_library: entry_library.into(),
            dependencies: Vec::new(),
            version: default_version(),
            unload_disabled: false,
            info: Vec::new(),
            general: GeneralInformation::default(),
            build: BuildInformation::default(),
            used_licenses: Vec::new(),
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: ModuleId, minimum_version: Version) -> Self {
        self.dependencies
            .push(DependencyRequirement::new(id, minimum_version));
        self
    }

    /// Set the unload policy.
    #[must_use]
    pub fn with_unload_disabled(mut self, disabled: bool) -> Self {
        self.unload_disabled = disabled;
        self
    }

    /// Read the descriptor in `directory`.
    ///
    /// Returns `Ok(None)` when the directory holds no descriptor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file exists but cannot be read,
    /// is too large, or does not describe a valid module.
    pub async fn try_load(directory: &Path) -> ModuleResult<Option<LoadedDescriptor>> {
        let path = directory.join(DESCRIPTOR_FILE_NAME);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ModuleError::ConfigRead { path, source }),
        };

        if metadata.len() > MAX_DESCRIPTOR_SIZE {
            return Err(ModuleError::ConfigTooLarge {
                path,
                size: metadata.len(),
                limit: MAX_DESCRIPTOR_SIZE,
            });
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ModuleError::ConfigRead { path, source }),
        };

        let descriptor = Self::from_json(&content, &path)?;
        debug!(path = %path.display(), module_id = %descriptor.id, "Read module descriptor");
        Ok(Some(LoadedDescriptor {
            descriptor,
            path,
            modified: metadata.modified().ok(),
        }))
    }

    /// Parse and validate descriptor JSON. `path` is used for error context.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigParse`] for malformed JSON or missing
    /// required fields, and [`ModuleError::ConfigInvalid`] for bad values.
    pub fn from_json(content: &str, path: &Path) -> ModuleResult<Self> {
        let descriptor: Self =
            serde_json::from_str(content).map_err(|e| ModuleError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        descriptor.validate(path)?;
        Ok(descriptor)
    }

    /// Check field values that the parser cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigInvalid`] naming the offending field.
    pub fn validate(&self, path: &Path) -> ModuleResult<()> {
        let invalid = |field: &'static str, message: String| ModuleError::ConfigInvalid {
            path: path.to_path_buf(),
            field,
            message,
        };

        let entry = self.entry_library.trim();
        if entry.is_empty() {
            return Err(invalid("entry_library", "must not be empty".into()));
        }
        let entry_path = Path::new(entry);
        if entry_path.is_absolute()
            || !entry_path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid(
                "entry_library",
                format!("'{entry}' must be a relative path inside the module directory"),
            ));
        }

        let mut seen = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            if dependency.id == self.id {
                return Err(invalid("dependencies", "module cannot depend on itself".into()));
            }
            if seen.contains(&dependency.id) {
                return Err(invalid(
                    "dependencies",
                    format!("dependency {} is declared twice", dependency.id),
                ));
            }
            seen.push(dependency.id);
        }
        Ok(())
    }

    /// File stem of the entry library.
    #[must_use]
    pub fn entry_stem(&self) -> &str {
        Path::new(&self.entry_library)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.entry_library)
    }

    /// Localized information for `language`.
    ///
    /// Tries an exact tag match, then the primary subtag (`en` for `en-GB`),
    /// then falls back to the first entry.
    #[must_use]
    pub fn localized(&self, language: Option<&str>) -> Option<&LocalizedInformation> {
        if let Some(language) = language {
            if let Some(exact) = self
                .info
                .iter()
                .find(|i| i.language.eq_ignore_ascii_case(language))
            {
                return Some(exact);
            }
            let primary = primary_subtag(language);
            if let Some(close) = self
                .info
                .iter()
                .find(|i| primary_subtag(&i.language).eq_ignore_ascii_case(primary))
            {
                return Some(close);
            }
        }
        self.info.first()
    }

    /// Name for display, falling back to the entry library stem.
    #[must_use]
    pub fn display_name(&self, language: Option<&str>) -> &str {
        self.localized(language)
            .map_or_else(|| self.entry_stem(), |i| i.name.as_str())
    }

    /// Whether the dependency lists declare the same requirements,
    /// ignoring order.
    #[must_use]
    pub fn same_dependencies(&self, other: &Self) -> bool {
        self.dependencies.len() == other.dependencies.len()
            && self
                .dependencies
                .iter()
                .all(|d| other.dependencies.contains(d))
    }
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "6f1c0a44-3c0e-4a43-9d62-91c0f4a3b7e2";
    const DEP: &str = "0b7a7d5e-21a4-4bb4-8a3e-5b0f8c1d2e3f";

    fn parse(json: &str) -> ModuleResult<ModuleDescriptor> {
        ModuleDescriptor::from_json(json, Path::new("module.json"))
    }

    #[test]
    fn minimal_descriptor_defaults() {
        let d = parse(&format!(
            r#"{{"id":"{ID}","entry_library":"greeter.module","dependencies":[]}}"#
        ))
        .unwrap();
        assert_eq!(d.version, Version::new(0, 0, 0));
        assert!(!d.unload_disabled);
        assert!(d.info.is_empty());
        assert_eq!(d.entry_stem(), "greeter");
        assert_eq!(d.display_name(None), "greeter");
    }

    #[test]
    fn full_descriptor_parses() {
        let d = parse(&format!(
            r#"{{
                "id": "{ID}",
                "entry_library": "lib/greeter.module",
                "version": "1.2",
                "dependencies": [{{"id": "{DEP}", "minimum_version": "1"}}],
                "unload_disabled": true,
                "info": [
                    {{"language": "en-US", "name": "Greeter"}},
                    {{"language": "de", "name": "Begrüßer", "license": {{"spdx_id": "MIT"}}}}
                ],
                "general": {{"company": "Acme", "contributors": ["a", "b"]}},
                "build": {{"release_timestamp": "2024-01-01T00:00:00Z", "vcs_reference": "abc123"}},
                "used_licenses": [{{"spdx_id": "Apache-2.0"}}],
                "unknown_field": 42
            }}"#
        ))
        .unwrap();
        assert_eq!(d.version, Version::new(1, 2, 0));
        assert_eq!(d.dependencies[0].minimum_version, Version::new(1, 0, 0));
        assert!(d.unload_disabled);
        assert_eq!(d.general.contributors.len(), 2);
        assert_eq!(d.build.vcs_reference.as_deref(), Some("abc123"));
        assert_eq!(d.display_name(Some("de-AT")), "Begrüßer");
        assert_eq!(d.display_name(Some("fr")), "Greeter");
        assert_eq!(d.localized(Some("en-us")).unwrap().language, "en-US");
    }

    #[test]
    fn missing_required_field_is_parse_error() {
        let err = parse(&format!(r#"{{"id":"{ID}","entry_library":"x.module"}}"#)).unwrap_err();
        assert!(matches!(
            err,
            ModuleError::ConfigParse { ref message, .. } if message.contains("dependencies")
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let empty = parse(&format!(r#"{{"id":"{ID}","entry_library":" ","dependencies":[]}}"#));
        assert!(matches!(empty, Err(ModuleError::ConfigInvalid { field: "entry_library", .. })));

        let escape = parse(&format!(
            r#"{{"id":"{ID}","entry_library":"../other/x.module","dependencies":[]}}"#
        ));
        assert!(matches!(escape, Err(ModuleError::ConfigInvalid { field: "entry_library", .. })));

        let self_dep = parse(&format!(
            r#"{{
                "id": "{ID}",
                "entry_library": "x.module",
                "dependencies": [{{"id": "{ID}", "minimum_version": "1.0.0"}}]
            }}"#
        ));
        assert!(matches!(self_dep, Err(ModuleError::ConfigInvalid { field: "dependencies", .. })));

        let nil = parse(
            r#"{
                "id": "00000000-0000-0000-0000-000000000000",
                "entry_library": "x.module",
                "dependencies": []
            }"#,
        );
        assert!(matches!(nil, Err(ModuleError::ConfigParse { .. })));
    }

    #[test]
    fn version_padding_rules() {
        assert_eq!(parse_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version("2.1").unwrap(), Version::new(2, 1, 0));
        assert_eq!(parse_version("2.1-beta").unwrap().pre.as_str(), "beta");
        assert!(parse_version("1.2.3.4").is_err());
        assert!(parse_version("one").is_err());
    }

    #[test]
    fn requirement_is_inclusive() {
        let req = DependencyRequirement::new(ModuleId::from_u128(1), Version::new(1, 0, 0));
        assert!(req.is_satisfied_by(&Version::new(1, 0, 0)));
        assert!(req.is_satisfied_by(&Version::new(3, 1, 0)));
        assert!(!req.is_satisfied_by(&Version::new(0, 9, 9)));
    }

    #[tokio::test]
    async fn try_load_absent_and_present() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModuleDescriptor::try_load(dir.path()).await.unwrap().is_none());

        std::fs::write(
            dir.path().join(DESCRIPTOR_FILE_NAME),
            format!(r#"{{"id":"{ID}","entry_library":"x.module","dependencies":[]}}"#),
        )
        .unwrap();
        let loaded = ModuleDescriptor::try_load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.descriptor.id.to_string(), ID);
        assert!(loaded.modified.is_some());
    }

    #[tokio::test]
    async fn try_load_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let padding = " ".repeat(usize::try_from(MAX_DESCRIPTOR_SIZE).unwrap().saturating_add(1));
        std::fs::write(dir.path().join(DESCRIPTOR_FILE_NAME), padding).unwrap();
        let err = ModuleDescriptor::try_load(dir.path()).await.unwrap_err();
        assert!(matches!(err, ModuleError::ConfigTooLarge { .. }));
    }
}
