use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// The `direct_url.json` document written next to `METADATA` to record where
/// a distribution came from when it was not installed from an index.
///
/// See <https://packaging.python.org/en/latest/specifications/direct-url-data-structure/>.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectUrl {
    /// Location of the source.
    pub url: Url,
    /// What kind of source the url points at.
    #[serde(flatten)]
    pub source: DirectUrlSource,
}

impl DirectUrl {
    /// Provenance entry for a local directory, optionally editable.
    pub fn for_directory(url: Url, editable: bool) -> Self {
        DirectUrl {
            url,
            source: DirectUrlSource::Dir {
                editable: editable.then_some(true),
            },
        }
    }

    /// Provenance entry for a downloaded archive with a known hash.
    pub fn for_archive(url: Url, sha256: Option<String>) -> Self {
        DirectUrl {
            url,
            source: DirectUrlSource::Archive {
                hashes: sha256.map(|sha256| ArchiveHashes { sha256 }),
            },
        }
    }

    /// Whether this records an editable install.
    pub fn is_editable(&self) -> bool {
        matches!(
            self.source,
            DirectUrlSource::Dir {
                editable: Some(true)
            }
        )
    }
}

/// The source-specific half of a [`DirectUrl`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectUrlSource {
    /// An archive file (wheel or sdist).
    #[serde(rename = "archive_info")]
    Archive {
        /// Hashes of the archive, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        hashes: Option<ArchiveHashes>,
    },
    /// A VCS checkout.
    #[serde(rename = "vcs_info")]
    Vcs {
        /// The version control system used.
        vcs: VcsKind,
        /// The revision that was requested, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_revision: Option<String>,
        /// The commit that was actually checked out.
        commit_id: String,
    },
    /// A local directory.
    #[serde(rename = "dir_info")]
    Dir {
        /// Present and true for editable installs.
        #[serde(skip_serializing_if = "Option::is_none")]
        editable: Option<bool>,
    },
}

/// Hashes of an archive source. Only sha256 is recorded, per the
/// specification's recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHashes {
    /// Hex sha256 digest of the archive.
    pub sha256: String,
}

/// A supported version control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VcsKind {
    /// Git.
    #[serde(rename = "git")]
    Git,
    /// Mercurial.
    #[serde(rename = "hg")]
    Mercurial,
    /// Subversion.
    #[serde(rename = "svn")]
    Subversion,
    /// Bazaar.
    #[serde(rename = "bzr")]
    Bazaar,
}

impl Display for VcsKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VcsKind::Git => "git",
            VcsKind::Mercurial => "hg",
            VcsKind::Subversion => "svn",
            VcsKind::Bazaar => "bzr",
        };
        write!(f, "{name}")
    }
}

impl FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(VcsKind::Git),
            "hg" => Ok(VcsKind::Mercurial),
            "svn" => Ok(VcsKind::Subversion),
            "bzr" => Ok(VcsKind::Bazaar),
            other => Err(format!("unknown vcs '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_specification_examples() {
        let archive = r#"
        {
            "url": "https://github.com/pypa/pip/archive/1.3.1.zip",
            "archive_info": {
                "hashes": {
                    "sha256": "2dc6b5a470a1bde68946f263f1af1515a2574a150a30d6ce02c6ff742fcc0db8"
                }
            }
        }"#;
        serde_json::from_str::<DirectUrl>(archive).unwrap();

        let vcs = r#"
        {
            "url": "https://github.com/pypa/pip.git",
            "vcs_info": {
                "vcs": "git",
                "requested_revision": "1.3.1",
                "commit_id": "7921be1537eac1e97bc40179a57f0349c2aee67d"
            }
        }"#;
        serde_json::from_str::<DirectUrl>(vcs).unwrap();

        let editable = r#"
        {
            "url": "file:///home/user/project",
            "dir_info": {"editable": true}
        }"#;
        let parsed = serde_json::from_str::<DirectUrl>(editable).unwrap();
        assert!(parsed.is_editable());
    }

    #[test]
    fn editable_roundtrip() {
        let direct = DirectUrl::for_directory(Url::parse("file:///src/proj").unwrap(), true);
        let json = serde_json::to_string(&direct).unwrap();
        let back: DirectUrl = serde_json::from_str(&json).unwrap();
        assert!(back.is_editable());
    }
}
