use std::fmt::{Display, Formatter};
use std::str::FromStr;

use miette::Diagnostic;
use pep440_rs::Version;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use smallvec::SmallVec;
use thiserror::Error;

use super::package_name::PackageName;

/// Error produced when an artifact filename cannot be parsed.
#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParseArtifactNameError {
    #[error("invalid wheel filename '{0}': {1}")]
    InvalidWheelName(String, String),

    #[error("invalid sdist filename '{0}': {1}")]
    InvalidSDistName(String, String),

    #[error("'{0}' is neither a wheel nor a supported sdist")]
    UnknownFormat(String),
}

/// The parsed filename of a wheel,
/// `{distribution}-{version}(-{build})?-{python}-{abi}-{platform}.whl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct WheelFilename {
    /// The distribution name (underscores in the filename).
    pub distribution: PackageName,
    /// The distribution version.
    pub version: Version,
    /// The optional build tag.
    pub build_tag: Option<String>,
    /// Python implementation tags (`py3`, `cp311`, ...), `.`-separated in
    /// compressed form.
    pub python_tags: SmallVec<[String; 1]>,
    /// ABI tags (`none`, `abi3`, `cp311`, ...).
    pub abi_tags: SmallVec<[String; 1]>,
    /// Platform tags (`any`, `manylinux_2_17_x86_64`, ...).
    pub platform_tags: SmallVec<[String; 1]>,
}

impl WheelFilename {
    /// How tightly this wheel is bound to an interpreter and platform.
    ///
    /// Candidate ordering prefers higher scores within a version: a wheel
    /// built for a concrete abi and platform sorts before an `abi3` wheel,
    /// which sorts before a pure `py3-none-any` one.
    pub fn specificity(&self) -> u8 {
        let platform_specific = self.platform_tags.iter().any(|t| t != "any");
        let abi_specific = self.abi_tags.iter().any(|t| t != "none");
        u8::from(platform_specific) * 2 + u8::from(abi_specific)
    }

    /// Whether this is a pure-python wheel installable everywhere.
    pub fn is_universal(&self) -> bool {
        self.specificity() == 0
    }

    /// The `{dist}-{version}-{python}-{abi}-{platform}` tag triple string,
    /// used as the cache key of a materialized package.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.distribution.as_str().replace('-', "_"),
            self.version,
            self.python_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        )
    }
}

impl FromStr for WheelFilename {
    type Err = ParseArtifactNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: &str| ParseArtifactNameError::InvalidWheelName(s.to_string(), reason.into());

        let stem = s
            .strip_suffix(".whl")
            .ok_or_else(|| invalid("missing .whl suffix"))?;
        let parts: Vec<&str> = stem.split('-').collect();
        let (name, version, build_tag, tags) = match parts.len() {
            5 => (parts[0], parts[1], None, &parts[2..5]),
            6 => (parts[0], parts[1], Some(parts[2].to_string()), &parts[3..6]),
            _ => return Err(invalid("expected 5 or 6 dash-separated segments")),
        };

        let distribution: PackageName = name
            .parse()
            .map_err(|e| invalid(&format!("bad distribution name: {e}")))?;
        let version: Version = version
            .parse()
            .map_err(|e: String| invalid(&format!("bad version: {e}")))?;

        let split_tags = |tag: &str| tag.split('.').map(str::to_string).collect();
        Ok(WheelFilename {
            distribution,
            version,
            build_tag,
            python_tags: split_tags(tags[0]),
            abi_tags: split_tags(tags[1]),
            platform_tags: split_tags(tags[2]),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution.as_source_str(), self.version)?;
        if let Some(build_tag) = &self.build_tag {
            write!(f, "-{build_tag}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.python_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        )
    }
}

/// The archive format of an sdist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SDistFormat {
    /// `.tar.gz`
    TarGz,
    /// `.tar.bz2`
    TarBz2,
    /// `.tar`
    Tar,
    /// `.zip`
    Zip,
}

impl SDistFormat {
    /// Extracts the format from a filename.
    pub fn from_filename(name: &str) -> Option<(Self, &str)> {
        for (suffix, format) in [
            (".tar.gz", SDistFormat::TarGz),
            (".tar.bz2", SDistFormat::TarBz2),
            (".tar", SDistFormat::Tar),
            (".zip", SDistFormat::Zip),
        ] {
            if let Some(stem) = name.strip_suffix(suffix) {
                return Some((format, stem));
            }
        }
        None
    }

    /// Whether the engine can unpack this format.
    pub fn is_supported(&self) -> bool {
        // bzip2 decompression is not wired up.
        !matches!(self, SDistFormat::TarBz2)
    }

    /// The filename suffix of the format.
    pub fn suffix(&self) -> &'static str {
        match self {
            SDistFormat::TarGz => ".tar.gz",
            SDistFormat::TarBz2 => ".tar.bz2",
            SDistFormat::Tar => ".tar",
            SDistFormat::Zip => ".zip",
        }
    }
}

/// The parsed filename of an sdist, `{distribution}-{version}{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct SDistFilename {
    /// The distribution name.
    pub distribution: PackageName,
    /// The distribution version.
    pub version: Version,
    /// The archive format.
    pub format: SDistFormat,
}

impl FromStr for SDistFilename {
    type Err = ParseArtifactNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: &str| ParseArtifactNameError::InvalidSDistName(s.to_string(), reason.into());
        let (format, stem) =
            SDistFormat::from_filename(s).ok_or_else(|| invalid("unknown archive suffix"))?;
        let (name, version) = stem
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing version separator"))?;
        Ok(SDistFilename {
            distribution: name
                .parse()
                .map_err(|e| invalid(&format!("bad distribution name: {e}")))?,
            version: version
                .parse()
                .map_err(|e: String| invalid(&format!("bad version: {e}")))?,
            format,
        })
    }
}

impl Display for SDistFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}{}",
            self.distribution.as_source_str(),
            self.version,
            self.format.suffix()
        )
    }
}

/// The filename of any artifact the index can serve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum ArtifactName {
    /// A built wheel.
    Wheel(WheelFilename),
    /// A source distribution.
    SDist(SDistFilename),
}

impl ArtifactName {
    /// The version encoded in the filename.
    pub fn version(&self) -> &Version {
        match self {
            ArtifactName::Wheel(wheel) => &wheel.version,
            ArtifactName::SDist(sdist) => &sdist.version,
        }
    }

    /// The distribution name encoded in the filename.
    pub fn distribution(&self) -> &PackageName {
        match self {
            ArtifactName::Wheel(wheel) => &wheel.distribution,
            ArtifactName::SDist(sdist) => &sdist.distribution,
        }
    }

    /// Returns the wheel filename if this is a wheel.
    pub fn as_wheel(&self) -> Option<&WheelFilename> {
        match self {
            ArtifactName::Wheel(wheel) => Some(wheel),
            ArtifactName::SDist(_) => None,
        }
    }

    /// Returns the sdist filename if this is an sdist.
    pub fn as_sdist(&self) -> Option<&SDistFilename> {
        match self {
            ArtifactName::Wheel(_) => None,
            ArtifactName::SDist(sdist) => Some(sdist),
        }
    }

    /// Whether this artifact is a wheel.
    pub fn is_wheel(&self) -> bool {
        matches!(self, ArtifactName::Wheel(_))
    }
}

impl FromStr for ArtifactName {
    type Err = ParseArtifactNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.ends_with(".whl") {
            Ok(ArtifactName::Wheel(s.parse()?))
        } else if SDistFormat::from_filename(s).is_some() {
            Ok(ArtifactName::SDist(s.parse()?))
        } else {
            Err(ParseArtifactNameError::UnknownFormat(s.to_string()))
        }
    }
}

impl Display for ArtifactName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactName::Wheel(wheel) => wheel.fmt(f),
            ArtifactName::SDist(sdist) => sdist.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wheel_filename() {
        let name: WheelFilename = "charset_normalizer-2.1.1-py3-none-any.whl".parse().unwrap();
        assert_eq!(name.distribution.as_str(), "charset-normalizer");
        assert_eq!(name.version.to_string(), "2.1.1");
        assert!(name.is_universal());
        assert_eq!(name.to_string(), "charset_normalizer-2.1.1-py3-none-any.whl");
    }

    #[test]
    fn parse_wheel_with_build_tag() {
        let name: WheelFilename = "demo-1.0-1-cp311-cp311-linux_x86_64.whl".parse().unwrap();
        assert_eq!(name.build_tag.as_deref(), Some("1"));
        assert_eq!(name.specificity(), 3);
    }

    #[test]
    fn specificity_ordering() {
        let native: WheelFilename = "x-1.0-cp311-cp311-manylinux_2_17_x86_64.whl".parse().unwrap();
        let abi3: WheelFilename = "x-1.0-cp38-abi3-manylinux_2_17_x86_64.whl".parse().unwrap();
        let pure: WheelFilename = "x-1.0-py3-none-any.whl".parse().unwrap();
        assert!(native.specificity() >= abi3.specificity());
        assert!(abi3.specificity() > pure.specificity());
    }

    #[test]
    fn parse_sdist_filename() {
        let name: SDistFilename = "future-fstrings-1.2.0.tar.gz".parse().unwrap();
        assert_eq!(name.distribution.as_str(), "future-fstrings");
        assert_eq!(name.version.to_string(), "1.2.0");
        assert_eq!(name.format, SDistFormat::TarGz);
    }

    #[test]
    fn artifact_name_dispatch() {
        assert!("demo-1.0-py3-none-any.whl".parse::<ArtifactName>().unwrap().is_wheel());
        assert!(!"demo-1.0.tar.gz".parse::<ArtifactName>().unwrap().is_wheel());
        assert!("demo-1.0.rpm".parse::<ArtifactName>().is_err());
    }
}
