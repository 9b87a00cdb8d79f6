//! The lockfile document: a content-hashed, deterministic serialization of a
//! resolution, sufficient to reinstall the same versions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ProjectManifest;
use crate::types::{Candidate, CandidateSource, GroupName, Requirement};
use crate::utils::{atomic_replace, format_sha256};

/// The lockfile format revision this engine writes.
pub const LOCK_VERSION: &str = "4.0";

/// A parsed (or freshly formatted) lockfile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lockfile {
    /// Bookkeeping about the lock itself.
    pub metadata: LockMetadata,
    /// One entry per resolved (name, extras) vertex, sorted by name then
    /// version so the serialization is stable and diffs stay small.
    #[serde(rename = "package", default)]
    pub packages: Vec<LockedPackage>,
}

/// The `[metadata]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockMetadata {
    /// Format revision.
    pub lock_version: String,
    /// `sha256:<hex>` over the canonical serialization of the project's
    /// dependency surface.
    pub content_hash: String,
    /// `"name version"` to the artifact hashes the installer may verify.
    #[serde(default)]
    pub files: BTreeMap<String, Vec<FileHash>>,
}

/// One artifact hash entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHash {
    /// The artifact filename, for index artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// The artifact url, for direct candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `sha256:<hex>`.
    pub hash: String,
}

/// One `[[package]]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LockedPackage {
    /// Normalized distribution name.
    pub name: String,
    /// Pinned version.
    pub version: String,
    /// One-line summary, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Supported python range, canonical form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requires_python: String,
    /// Extras this vertex was selected with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    /// Direct artifact url, for url candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local path, for path candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Repository url, for git candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    /// Requested revision, for git candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Whether the candidate installs editable.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub editable: bool,
    /// The candidate's dependencies as requirement strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// The groups this candidate was selected for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
}

/// Error raised while reading or writing a lockfile.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum LockfileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid lockfile: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize lockfile: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Lockfile {
    /// Formats a resolution into a lockfile document.
    ///
    /// `candidates` maps vertex keys to pinned candidates, `dependencies`
    /// maps the same keys to the requirements the candidate contributed, and
    /// `sections` records which groups selected each vertex.
    pub fn from_resolution(
        manifest: &ProjectManifest,
        candidates: &indexmap::IndexMap<String, Candidate>,
        dependencies: &indexmap::IndexMap<String, Vec<Requirement>>,
        sections: &BTreeMap<String, BTreeSet<GroupName>>,
    ) -> Self {
        let mut packages = Vec::new();
        let mut files = BTreeMap::new();

        for (key, candidate) in candidates {
            let name = match &candidate.name {
                Some(name) => name.as_str().to_string(),
                None => continue,
            };
            let version = candidate
                .version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();

            let mut package = LockedPackage {
                name: name.clone(),
                version: version.clone(),
                summary: candidate.summary.clone(),
                requires_python: candidate.requires_python.to_string(),
                extras: candidate
                    .req
                    .extras
                    .iter()
                    .map(|extra| extra.to_string())
                    .collect(),
                dependencies: dependencies
                    .get(key)
                    .map(|requirements| {
                        let mut lines: Vec<String> =
                            requirements.iter().map(ToString::to_string).collect();
                        lines.sort();
                        lines
                    })
                    .unwrap_or_default(),
                sections: sections
                    .get(key)
                    .map(|groups| groups.iter().map(ToString::to_string).collect())
                    .unwrap_or_default(),
                ..Default::default()
            };
            match candidate.source() {
                CandidateSource::Index => {}
                CandidateSource::Url(url) => package.url = Some(url.to_string()),
                CandidateSource::Path { path, editable } => {
                    package.path = Some(path.display().to_string());
                    package.editable = editable;
                }
                CandidateSource::Vcs {
                    url,
                    revision,
                    editable,
                    ..
                } => {
                    package.git = Some(url.to_string());
                    package.revision = revision;
                    package.editable = editable;
                }
            }
            packages.push(package);

            if !candidate.hashes.is_empty() {
                let entries: Vec<FileHash> = candidate
                    .hashes
                    .iter()
                    .map(|(source, hash)| {
                        if source.contains("://") {
                            FileHash {
                                file: None,
                                url: Some(source.clone()),
                                hash: hash.clone(),
                            }
                        } else {
                            FileHash {
                                file: Some(source.clone()),
                                url: None,
                                hash: hash.clone(),
                            }
                        }
                    })
                    .collect();
                files.insert(format!("{name} {version}"), entries);
            }
        }

        packages.sort_by(|a, b| (&a.name, &a.version, &a.extras).cmp(&(&b.name, &b.version, &b.extras)));

        Lockfile {
            metadata: LockMetadata {
                lock_version: LOCK_VERSION.to_string(),
                content_hash: content_hash(manifest),
                files,
            },
            packages,
        }
    }

    /// Whether this lockfile matches the current project declaration.
    pub fn is_up_to_date(&self, manifest: &ProjectManifest) -> bool {
        self.metadata.content_hash == content_hash(manifest)
    }

    /// The deterministic TOML bytes of this document. Identical inputs
    /// produce identical bytes, which keeps the file friendly to VCS diffs.
    pub fn to_toml_bytes(&self) -> Result<Vec<u8>, LockfileError> {
        let text = toml::to_string_pretty(self)?;
        Ok(text.into_bytes())
    }

    /// Writes the document to `path` whole: temp file, fsync, rename.
    pub fn write_to(&self, path: &Path) -> Result<(), LockfileError> {
        let bytes = self.to_toml_bytes()?;
        atomic_replace(path, &bytes)?;
        Ok(())
    }

    /// Reads a lockfile from disk.
    pub fn load(path: &Path) -> Result<Self, LockfileError> {
        let text = fs_err::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Looks up the stored artifact hashes of a package.
    pub fn file_hashes(&self, name: &str, version: &str) -> &[FileHash] {
        self.metadata
            .files
            .get(&format!("{name} {version}"))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Computes the project's content hash: `sha256:<hex>` of a canonical,
/// minified, key-sorted JSON document covering the declared dependency
/// surface. Stable across runs, OSes and directory iteration order.
pub fn content_hash(manifest: &ProjectManifest) -> String {
    #[derive(Serialize)]
    struct Surface<'a> {
        // BTreeMaps serialize with sorted keys, lists keep declaration order.
        dependencies: BTreeMap<String, Vec<String>>,
        requires_python: String,
        sources: Vec<BTreeMap<&'static str, &'a str>>,
    }

    let dependencies = manifest
        .groups
        .iter()
        .map(|(group, requirements)| {
            (
                group.to_string(),
                requirements.iter().map(ToString::to_string).collect(),
            )
        })
        .collect();
    let sources = manifest
        .sources
        .iter()
        .map(|source| {
            BTreeMap::from([
                ("name", source.name.as_str()),
                ("url", source.url.as_str()),
            ])
        })
        .collect();

    let surface = Surface {
        dependencies,
        requires_python: manifest.requires_python.to_string(),
        sources,
    };
    let encoded = serde_json::to_vec(&surface).expect("surface serialization cannot fail");
    let digest = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(&encoded);
    format_sha256(digest.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IndexSource;
    use crate::types::PySpecSet;
    use std::str::FromStr;

    fn manifest() -> ProjectManifest {
        let mut groups = BTreeMap::new();
        groups.insert(
            GroupName::Default,
            vec![Requirement::from_str("requests>=2.19").unwrap()],
        );
        groups.insert(
            GroupName::Dev,
            vec![Requirement::from_str("pytest").unwrap()],
        );
        ProjectManifest {
            name: "demo".into(),
            version: "0.1.0".into(),
            requires_python: PySpecSet::from_str(">=3.8").unwrap(),
            groups,
            sources: vec![IndexSource {
                name: "pypi".into(),
                url: "https://pypi.org/simple/".into(),
                verify_ssl: true,
            }],
        }
    }

    fn sample_lockfile() -> Lockfile {
        let manifest = manifest();
        let mut candidates = indexmap::IndexMap::new();
        let mut dependencies = indexmap::IndexMap::new();
        let mut sections = BTreeMap::new();

        let mut requests = Candidate::new(Requirement::from_str("requests>=2.19").unwrap())
            .with_version("2.19.1".parse().unwrap());
        requests.summary = Some("Python HTTP for Humans.".into());
        requests.hashes.insert(
            "requests-2.19.1-py2.py3-none-any.whl".into(),
            "sha256:aaaa".into(),
        );
        candidates.insert("requests".to_string(), requests);
        dependencies.insert(
            "requests".to_string(),
            vec![Requirement::from_str("chardet<3.1.0,>=3.0.2").unwrap()],
        );
        sections.insert(
            "requests".to_string(),
            BTreeSet::from([GroupName::Default]),
        );

        let chardet = Candidate::new(Requirement::from_str("chardet<3.1.0,>=3.0.2").unwrap())
            .with_version("3.0.4".parse().unwrap());
        candidates.insert("chardet".to_string(), chardet);
        sections.insert("chardet".to_string(), BTreeSet::from([GroupName::Default]));

        Lockfile::from_resolution(&manifest, &candidates, &dependencies, &sections)
    }

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(&manifest());
        let b = content_hash(&manifest());
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn content_hash_tracks_the_dependency_surface() {
        let mut changed = manifest();
        changed
            .groups
            .get_mut(&GroupName::Default)
            .unwrap()
            .push(Requirement::from_str("click").unwrap());
        assert_ne!(content_hash(&manifest()), content_hash(&changed));

        // The project version is not part of the surface.
        let mut version_bump = manifest();
        version_bump.version = "9.9.9".into();
        assert_eq!(content_hash(&manifest()), content_hash(&version_bump));
    }

    #[test]
    fn staleness_detection() {
        let lockfile = sample_lockfile();
        assert!(lockfile.is_up_to_date(&manifest()));

        let mut changed = manifest();
        changed.requires_python = PySpecSet::from_str(">=3.9").unwrap();
        assert!(!lockfile.is_up_to_date(&changed));
    }

    #[test]
    fn serialization_is_deterministic_and_roundtrips() {
        let lockfile = sample_lockfile();
        let bytes_a = lockfile.to_toml_bytes().unwrap();
        let bytes_b = lockfile.to_toml_bytes().unwrap();
        assert_eq!(bytes_a, bytes_b);

        let parsed: Lockfile = toml::from_str(std::str::from_utf8(&bytes_a).unwrap()).unwrap();
        assert_eq!(parsed, lockfile);
        assert_eq!(parsed.to_toml_bytes().unwrap(), bytes_a);
    }

    #[test]
    fn packages_are_sorted_by_name() {
        let lockfile = sample_lockfile();
        let names: Vec<&str> = lockfile.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["chardet", "requests"]);
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockstep.lock");
        let lockfile = sample_lockfile();
        lockfile.write_to(&path).unwrap();
        let loaded = Lockfile::load(&path).unwrap();
        assert_eq!(loaded, lockfile);
    }
}
