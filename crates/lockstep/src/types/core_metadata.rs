use std::collections::HashSet;
use std::str::FromStr;

use miette::Diagnostic;
use pep440_rs::Version;
use thiserror::Error;

use super::extra::Extra;
use super::package_name::PackageName;
use super::pyspec::PySpecSet;
use super::requirement::Requirement;
use super::rfc822ish::{ParseRfc822ishError, Rfc822ish};

/// The distribution metadata the engine cares about, parsed from a wheel's
/// `METADATA` or an sdist's PEP 643 `PKG-INFO`. Serializable so the metadata
/// cache can store it as JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DistMetadata {
    /// Distribution name.
    pub name: PackageName,
    /// Distribution version.
    pub version: Version,
    /// The `Metadata-Version` of the document.
    pub metadata_version: Version,
    /// Declared dependencies. Entries that fail to parse are skipped with a
    /// warning; a single malformed requirement should not sink the release.
    pub requires_dist: Vec<Requirement>,
    /// The supported python range.
    pub requires_python: PySpecSet,
    /// Extras this distribution provides.
    pub extras: HashSet<Extra>,
    /// The one-line summary.
    pub summary: Option<String>,
}

/// Error produced when parsing distribution metadata.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParseDistMetadataError {
    #[error(transparent)]
    InvalidDocument(#[from] ParseRfc822ishError),

    #[error("missing key {0} in metadata")]
    MissingKey(String),

    #[error("invalid {key}: {value}")]
    InvalidField { key: String, value: String },

    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(Version),
}

impl DistMetadata {
    /// Whether the metadata is reliable without building, per PEP 643: a
    /// `PKG-INFO` at metadata version 2.2 or later with no dynamic
    /// dependency fields.
    pub fn is_reliable(&self) -> bool {
        static MIN: once_cell::sync::Lazy<Version> =
            once_cell::sync::Lazy::new(|| Version::from_str("2.2").unwrap());
        self.metadata_version >= *MIN
    }
}

impl TryFrom<&[u8]> for DistMetadata {
    type Error = ParseDistMetadataError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let text = String::from_utf8_lossy(value);
        let mut parsed = Rfc822ish::from_str(&text)?;

        let take = |parsed: &mut Rfc822ish, key: &str| {
            parsed
                .take(key)
                .map_err(|_| ParseDistMetadataError::MissingKey(key.to_string()))
        };

        // A greater metadata *major* version than we know is a hard error;
        // unknown minor revisions are fine by definition.
        let metadata_version: Version = take(&mut parsed, "Metadata-Version")?
            .parse()
            .map_err(|value| ParseDistMetadataError::InvalidField {
                key: "Metadata-Version".into(),
                value,
            })?;
        if metadata_version.release.first().copied().unwrap_or(0) >= 3 {
            return Err(ParseDistMetadataError::UnsupportedVersion(metadata_version));
        }

        let name: PackageName = take(&mut parsed, "Name")?.parse().map_err(
            |e: super::package_name::ParsePackageNameError| ParseDistMetadataError::InvalidField {
                key: "Name".into(),
                value: e.to_string(),
            },
        )?;
        let version: Version = take(&mut parsed, "Version")?.parse().map_err(|value| {
            ParseDistMetadataError::InvalidField {
                key: "Version".into(),
                value,
            }
        })?;

        let mut requires_dist = Vec::new();
        for entry in parsed.take_all("Requires-Dist") {
            match Requirement::parse(&entry) {
                Ok(requirement) => requires_dist.push(requirement),
                Err(e) => {
                    tracing::warn!("ignoring Requires-Dist '{entry}': {e}");
                }
            }
        }

        let requires_python = match parsed.maybe_take("Requires-Python") {
            Ok(Some(value)) => {
                value
                    .parse()
                    .map_err(|e: super::pyspec::ParsePySpecError| {
                        ParseDistMetadataError::InvalidField {
                            key: "Requires-Python".into(),
                            value: e.to_string(),
                        }
                    })?
            }
            Ok(None) => PySpecSet::allow_all(),
            Err(e) => return Err(ParseDistMetadataError::InvalidDocument(e)),
        };

        let mut extras = HashSet::new();
        for extra in parsed.take_all("Provides-Extra") {
            match extra.parse::<Extra>() {
                Ok(extra) => {
                    extras.insert(extra);
                }
                Err(e) => {
                    tracing::warn!("ignoring Provides-Extra '{extra}': {e}");
                }
            }
        }

        let summary = parsed
            .maybe_take("Summary")
            .unwrap_or(None)
            .filter(|s| !s.is_empty());

        Ok(DistMetadata {
            name,
            version,
            metadata_version,
            requires_dist,
            requires_python,
            extras,
            summary,
        })
    }
}
