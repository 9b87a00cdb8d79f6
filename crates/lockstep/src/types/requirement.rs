use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use miette::Diagnostic;
use pep440_rs::VersionSpecifiers;
use pep508_rs::{MarkerEnvironment, MarkerTree, VersionOrUrl};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use url::Url;

use super::direct_url::VcsKind;
use super::extra::Extra;
use super::package_name::{NormalizedPackageName, PackageName};

/// The dependency group a requirement was declared in.
///
/// Groups partition the declared dependency surface and are the unit of
/// install selection: `default` for `project.dependencies`, `dev` for the dev
/// table and a named group for each optional-dependency table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub enum GroupName {
    /// The main `project.dependencies` group.
    Default,
    /// The development group.
    Dev,
    /// A named optional group.
    Named(String),
}

impl Display for GroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupName::Default => write!(f, "default"),
            GroupName::Dev => write!(f, "dev"),
            GroupName::Named(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for GroupName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "default" => GroupName::Default,
            "dev" => GroupName::Dev,
            other => GroupName::Named(other.to_string()),
        })
    }
}

/// Where a requirement points: an index lookup, a direct artifact URL, a
/// local file or directory, or a VCS checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementSource {
    /// A named requirement resolved against the configured indexes.
    Named {
        /// The version constraint, empty to accept any version.
        specifier: VersionSpecifiers,
    },
    /// A direct URL to an artifact (wheel or sdist).
    Url {
        /// Location of the artifact.
        url: Url,
    },
    /// A local file or directory.
    Path {
        /// The path as given.
        path: PathBuf,
        /// Whether the project should be installed in editable mode.
        editable: bool,
    },
    /// A VCS checkout.
    Vcs {
        /// The version control system.
        kind: VcsKind,
        /// Repository URL, without the `<vcs>+` scheme prefix.
        url: Url,
        /// The requested revision, if any.
        revision: Option<String>,
        /// Whether the checkout should be installed in editable mode.
        editable: bool,
    },
}

/// A declared dependency in normalized form.
///
/// The `group` tag records where the requirement was declared; it rides along
/// for lockfile sectioning but does not participate in equality, so a
/// stringify/parse round-trip compares equal.
#[derive(Debug, Clone, SerializeDisplay, DeserializeFromStr)]
pub struct Requirement {
    /// The package name; absent only for unnamed URL/path/VCS requirements
    /// whose name is discovered when the candidate is prepared.
    pub name: Option<PackageName>,
    /// Requested extras, sorted and deduplicated.
    pub extras: Vec<Extra>,
    /// The environment marker gating this requirement.
    pub marker: Option<MarkerTree>,
    /// Where the requirement points.
    pub source: RequirementSource,
    /// The dependency group this requirement was declared in.
    pub group: GroupName,
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.extras == other.extras
            && self.source == other.source
            && marker_str(&self.marker) == marker_str(&other.marker)
    }
}

impl Eq for Requirement {}

fn marker_str(marker: &Option<MarkerTree>) -> Option<String> {
    marker.as_ref().map(|m| m.to_string())
}

/// Error produced when parsing a requirement line.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParseRequirementError {
    #[error("invalid requirement '{line}': {reason}")]
    Invalid { line: String, reason: String },

    #[error("editable flag is only valid for local directories and VCS urls: '{0}'")]
    InvalidEditable(String),
}

impl Requirement {
    /// Parses a requirement line: a PEP 508 string, a `name @ url` form, a
    /// VCS url (`git+https://...@rev`), a local path, or any of these with an
    /// `-e`/`--editable` prefix.
    pub fn parse(line: &str) -> Result<Self, ParseRequirementError> {
        let trimmed = line.trim();
        let (editable, rest) = if let Some(rest) = trimmed
            .strip_prefix("-e ")
            .or_else(|| trimmed.strip_prefix("--editable "))
        {
            (true, rest.trim())
        } else {
            (false, trimmed)
        };

        let mut requirement = Self::parse_plain(rest, line)?;
        if editable {
            match &mut requirement.source {
                RequirementSource::Path { editable, .. }
                | RequirementSource::Vcs { editable, .. } => *editable = true,
                _ => return Err(ParseRequirementError::InvalidEditable(line.to_string())),
            }
        }
        Ok(requirement)
    }

    fn parse_plain(rest: &str, line: &str) -> Result<Self, ParseRequirementError> {
        // Bare VCS urls and local paths are not valid PEP 508, so pick those
        // off before handing the rest to the PEP 508 parser.
        if let Some((kind, url_part)) = split_vcs_prefix(rest) {
            let (url, revision) = split_revision(url_part);
            let url = Url::parse(&url).map_err(|e| ParseRequirementError::Invalid {
                line: line.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Requirement {
                name: None,
                extras: Vec::new(),
                marker: None,
                source: RequirementSource::Vcs {
                    kind,
                    url,
                    revision,
                    editable: false,
                },
                group: GroupName::Default,
            });
        }
        if looks_like_path(rest) {
            return Ok(Requirement {
                name: None,
                extras: Vec::new(),
                marker: None,
                source: RequirementSource::Path {
                    path: PathBuf::from(rest),
                    editable: false,
                },
                group: GroupName::Default,
            });
        }

        let parsed =
            pep508_rs::Requirement::from_str(rest).map_err(|e| ParseRequirementError::Invalid {
                line: line.to_string(),
                reason: e.to_string(),
            })?;
        Self::from_pep508(parsed).map_err(|reason| ParseRequirementError::Invalid {
            line: line.to_string(),
            reason,
        })
    }

    /// Converts a parsed PEP 508 requirement, splitting direct URLs into
    /// their path/VCS/plain-URL shapes.
    pub fn from_pep508(value: pep508_rs::Requirement) -> Result<Self, String> {
        let name = PackageName::from_str(&value.name).map_err(|e| e.to_string())?;
        let mut extras = value
            .extras
            .into_iter()
            .flatten()
            .map(|extra| Extra::from_str(&extra).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        extras.sort();
        extras.dedup();

        let source = match value.version_or_url {
            None => RequirementSource::Named {
                specifier: VersionSpecifiers::from_iter([]),
            },
            Some(VersionOrUrl::VersionSpecifier(specifier)) => {
                RequirementSource::Named { specifier }
            }
            Some(VersionOrUrl::Url(url)) => {
                if let Some((kind, url_part)) = split_vcs_prefix(url.as_str()) {
                    let (url, revision) = split_revision(url_part);
                    let url = Url::parse(&url).map_err(|e| e.to_string())?;
                    RequirementSource::Vcs {
                        kind,
                        url,
                        revision,
                        editable: false,
                    }
                } else if url.scheme() == "file" {
                    let path = url
                        .to_file_path()
                        .map_err(|_| format!("invalid file url '{url}'"))?;
                    RequirementSource::Path {
                        path,
                        editable: false,
                    }
                } else {
                    RequirementSource::Url { url }
                }
            }
        };

        Ok(Requirement {
            name: Some(name),
            extras,
            marker: value.marker,
            source,
            group: GroupName::Default,
        })
    }

    /// Returns a copy tagged with the given group.
    pub fn with_group(mut self, group: GroupName) -> Self {
        self.group = group;
        self
    }

    /// The canonical vertex key for this requirement:
    /// `normalized_name[extra1,extra2]`, or the source URL/path when the
    /// requirement is unnamed. Two requirements with the same name but
    /// different extras are distinct vertices.
    pub fn key(&self) -> String {
        match &self.name {
            Some(name) => key_for(&name.clone().into(), &self.extras),
            None => match &self.source {
                RequirementSource::Url { url } => url.to_string(),
                RequirementSource::Vcs { kind, url, .. } => format!("{kind}+{url}"),
                RequirementSource::Path { path, .. } => path.display().to_string(),
                RequirementSource::Named { .. } => {
                    unreachable!("named requirements always carry a name")
                }
            },
        }
    }

    /// The version constraint for named requirements; empty otherwise.
    pub fn specifier(&self) -> Option<&VersionSpecifiers> {
        match &self.source {
            RequirementSource::Named { specifier } => Some(specifier),
            _ => None,
        }
    }

    /// Whether this requirement asks for an editable install.
    pub fn is_editable(&self) -> bool {
        matches!(
            self.source,
            RequirementSource::Path { editable: true, .. }
                | RequirementSource::Vcs { editable: true, .. }
        )
    }

    /// Whether the requirement is pinned to a local file or directory.
    pub fn is_local(&self) -> bool {
        matches!(self.source, RequirementSource::Path { .. })
    }

    /// Evaluates the marker against an environment; a requirement without a
    /// marker always applies.
    pub fn marker_matches(&self, env: &MarkerEnvironment) -> bool {
        let extras: Vec<&str> = self.extras.iter().map(Extra::as_str).collect();
        self.marker
            .as_ref()
            .map(|marker| marker.evaluate(env, &extras))
            .unwrap_or(true)
    }

    /// Compares two requirements for the purpose of locating a declared entry
    /// (e.g. to replace or remove it): identity plus source location, with
    /// the name optionally ignored.
    pub fn matches(&self, other: &Requirement, ignore_name: bool) -> bool {
        if !ignore_name && self.name != other.name {
            return false;
        }
        match (&self.source, &other.source) {
            (RequirementSource::Named { .. }, RequirementSource::Named { .. }) => true,
            (RequirementSource::Url { url: a }, RequirementSource::Url { url: b }) => a == b,
            (
                RequirementSource::Path { path: a, .. },
                RequirementSource::Path { path: b, .. },
            ) => a == b,
            (
                RequirementSource::Vcs {
                    kind: ka, url: ua, ..
                },
                RequirementSource::Vcs {
                    kind: kb, url: ub, ..
                },
            ) => ka == kb && ua == ub,
            _ => false,
        }
    }
}

/// Builds the canonical `name[extras]` key used as a resolver vertex id.
pub(crate) fn key_for(name: &NormalizedPackageName, extras: &[Extra]) -> String {
    if extras.is_empty() {
        name.to_string()
    } else {
        let mut sorted: Vec<&str> = extras.iter().map(Extra::as_str).collect();
        sorted.sort_unstable();
        format!("{}[{}]", name, sorted.join(","))
    }
}

fn split_vcs_prefix(s: &str) -> Option<(VcsKind, &str)> {
    for (prefix, kind) in [
        ("git+", VcsKind::Git),
        ("hg+", VcsKind::Mercurial),
        ("svn+", VcsKind::Subversion),
        ("bzr+", VcsKind::Bazaar),
    ] {
        if let Some(rest) = s.strip_prefix(prefix) {
            if rest.contains("://") {
                return Some((kind, rest));
            }
        }
    }
    None
}

/// Splits the `@revision` suffix off a VCS url. An `@` that is followed by a
/// `/` belongs to the authority part and is left alone.
fn split_revision(s: &str) -> (String, Option<String>) {
    let authority_end = s.find("://").map(|i| i + 3).unwrap_or(0);
    match s[authority_end..].rfind('@') {
        Some(pos) => {
            let (url, revision) = s.split_at(authority_end + pos);
            let revision = &revision[1..];
            if revision.is_empty() || revision.contains('/') {
                (s.to_string(), None)
            } else {
                (url.to_string(), Some(revision.to_string()))
            }
        }
        None => (s.to_string(), None),
    }
}

impl FromStr for Requirement {
    type Err = ParseRequirementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Requirement::parse(s)
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_editable() {
            write!(f, "-e ")?;
        }

        let name_part = match &self.name {
            Some(name) => {
                if self.extras.is_empty() {
                    name.as_source_str().to_string()
                } else {
                    let extras: Vec<&str> = self.extras.iter().map(Extra::as_str).collect();
                    format!("{}[{}]", name.as_source_str(), extras.join(","))
                }
            }
            None => String::new(),
        };

        match &self.source {
            RequirementSource::Named { specifier } => {
                write!(f, "{name_part}{specifier}")?;
            }
            RequirementSource::Url { url } => {
                if name_part.is_empty() {
                    write!(f, "{url}")?;
                } else {
                    write!(f, "{name_part} @ {url}")?;
                }
            }
            RequirementSource::Path { path, .. } => {
                let location = match Url::from_file_path(path) {
                    Ok(url) => url.to_string(),
                    Err(_) => path.display().to_string(),
                };
                if name_part.is_empty() {
                    write!(f, "{location}")?;
                } else {
                    write!(f, "{name_part} @ {location}")?;
                }
            }
            RequirementSource::Vcs {
                kind,
                url,
                revision,
                ..
            } => {
                let revision = revision
                    .as_ref()
                    .map(|rev| format!("@{rev}"))
                    .unwrap_or_default();
                if name_part.is_empty() {
                    write!(f, "{kind}+{url}{revision}")?;
                } else {
                    write!(f, "{name_part} @ {kind}+{url}{revision}")?;
                }
            }
        }

        if let Some(marker) = &self.marker {
            write!(f, " ; {marker}")?;
        }
        Ok(())
    }
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with('/')
        || s.starts_with("~/")
        || s == "."
        || s == ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    #[test]
    fn parse_named() {
        let r = req("requests>=2.19,<3.0");
        assert_eq!(r.name.as_ref().unwrap().as_str(), "requests");
        assert!(matches!(r.source, RequirementSource::Named { .. }));
        assert_eq!(r.key(), "requests");
    }

    #[test]
    fn parse_named_with_extras_and_marker() {
        let r = req("Requests[socks,security]>=2.19 ; python_version >= '3.6'");
        assert_eq!(r.key(), "requests[security,socks]");
        assert!(r.marker.is_some());
    }

    #[test]
    fn extras_produce_distinct_keys() {
        assert_ne!(req("flask").key(), req("flask[dotenv]").key());
    }

    #[test]
    fn parse_direct_url() {
        let r = req("pip @ https://github.com/pypa/pip/archive/1.3.1.zip");
        assert!(matches!(r.source, RequirementSource::Url { .. }));
        assert_eq!(r.key(), "pip");
    }

    #[test]
    fn parse_vcs_with_revision() {
        let r = req("git+https://github.com/pypa/pip.git@22.0");
        match &r.source {
            RequirementSource::Vcs {
                kind,
                url,
                revision,
                editable,
            } => {
                assert_eq!(*kind, VcsKind::Git);
                assert_eq!(url.as_str(), "https://github.com/pypa/pip.git");
                assert_eq!(revision.as_deref(), Some("22.0"));
                assert!(!editable);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn parse_editable_path() {
        let r = req("-e ./vendor/package");
        match &r.source {
            RequirementSource::Path { path, editable } => {
                assert_eq!(path, &PathBuf::from("./vendor/package"));
                assert!(editable);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn editable_rejected_for_named() {
        assert!(Requirement::parse("-e requests>=2.0").is_err());
    }

    #[test]
    fn display_roundtrip() {
        for line in [
            "requests>=2.19,<3.0",
            "requests[security,socks]>=2.19",
            "pip @ https://github.com/pypa/pip/archive/1.3.1.zip",
            "git+https://github.com/pypa/pip.git@22.0",
            "pytz ; platform_system != 'Darwin'",
        ] {
            let parsed = req(line);
            let reparsed = req(&parsed.to_string());
            assert_eq!(parsed, reparsed, "roundtrip failed for {line}");
        }
    }

    #[test]
    fn group_does_not_affect_equality() {
        let a = req("requests").with_group(GroupName::Dev);
        let b = req("requests");
        assert_eq!(a, b);
    }

    #[test]
    fn matches_locates_entries() {
        let a = req("requests>=2.0");
        let b = req("requests==2.28.1");
        assert!(a.matches(&b, false));

        let c = req("git+https://github.com/pypa/pip.git@22.0");
        let d = req("git+https://github.com/pypa/pip.git@21.0");
        assert!(c.matches(&d, false));
        assert!(!a.matches(&c, false));
    }
}
