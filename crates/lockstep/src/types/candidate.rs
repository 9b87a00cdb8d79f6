use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use pep440_rs::Version;
use url::Url;

use super::core_metadata::DistMetadata;
use super::direct_url::{DirectUrl, VcsKind};
use super::package_name::PackageName;
use super::pyspec::PySpecSet;
use super::requirement::{key_for, Requirement, RequirementSource};

/// Where a candidate's artifact comes from, in the shape the lockfile
/// records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    /// Found on a configured index.
    Index,
    /// A direct artifact URL.
    Url(Url),
    /// A local file or directory.
    Path {
        /// Path to the file or directory.
        path: PathBuf,
        /// Whether it installs in editable mode.
        editable: bool,
    },
    /// A VCS checkout.
    Vcs {
        /// The version control system.
        kind: VcsKind,
        /// The repository URL.
        url: Url,
        /// The requested revision.
        revision: Option<String>,
        /// Whether it installs in editable mode.
        editable: bool,
    },
}

/// Metadata materialized for a candidate: the artifact has been fetched (and
/// built, for sdists and source trees) and its distribution metadata read.
///
/// Producing this is the expensive step of resolution; the repository fills
/// it at most once per candidate.
#[derive(Debug, Clone)]
pub struct PreparedCandidate {
    /// The parsed distribution metadata.
    pub metadata: DistMetadata,
    /// Path to a wheel ready for installation. `None` when only metadata was
    /// needed and no wheel was produced (e.g. a PEP 658 sidecar fetch).
    pub wheel: Option<PathBuf>,
    /// Provenance to record as `direct_url.json`, for non-index candidates.
    pub direct_url: Option<DirectUrl>,
}

/// A concrete resolution result for one vertex: a (name, version, source)
/// triple plus everything the lockfile and installer need.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The distribution name. Unnamed URL candidates learn their name when
    /// prepared.
    pub name: Option<PackageName>,
    /// The selected version. Absent for URL candidates until prepared.
    pub version: Option<Version>,
    /// The artifact URL this candidate was matched to, if any.
    pub link: Option<Url>,
    /// The originating requirement; carries extras, marker, editability and
    /// the source variant.
    pub req: Requirement,
    /// Artifact hashes, `filename or url -> "sha256:<hex>"`.
    pub hashes: BTreeMap<String, String>,
    /// The one-line summary, once known.
    pub summary: Option<String>,
    /// The python range the candidate supports.
    pub requires_python: PySpecSet,
    /// Lazily materialized metadata; shared so clones observe the same
    /// preparation.
    prepared: Arc<tokio::sync::OnceCell<Arc<PreparedCandidate>>>,
}

impl Candidate {
    /// Creates an unprepared candidate from the requirement it satisfies.
    pub fn new(req: Requirement) -> Self {
        Candidate {
            name: req.name.clone(),
            version: None,
            link: None,
            req,
            hashes: BTreeMap::new(),
            summary: None,
            requires_python: PySpecSet::allow_all(),
            prepared: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// Sets the pinned version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the artifact link.
    pub fn with_link(mut self, link: Url) -> Self {
        self.link = Some(link);
        self
    }

    /// Sets the supported python range.
    pub fn with_requires_python(mut self, requires_python: PySpecSet) -> Self {
        self.requires_python = requires_python;
        self
    }

    /// The canonical vertex key, `name[extras]`, falling back to the
    /// requirement key for unnamed candidates.
    pub fn key(&self) -> String {
        match &self.name {
            Some(name) => key_for(&name.clone().into(), &self.req.extras),
            None => self.req.key(),
        }
    }

    /// Where the candidate's artifact comes from.
    pub fn source(&self) -> CandidateSource {
        match &self.req.source {
            RequirementSource::Named { .. } => CandidateSource::Index,
            RequirementSource::Url { url } => CandidateSource::Url(url.clone()),
            RequirementSource::Path { path, editable } => CandidateSource::Path {
                path: path.clone(),
                editable: *editable,
            },
            RequirementSource::Vcs {
                kind,
                url,
                revision,
                editable,
            } => CandidateSource::Vcs {
                kind: *kind,
                url: url.clone(),
                revision: revision.clone(),
                editable: *editable,
            },
        }
    }

    /// Whether this candidate installs from a named index (and is therefore
    /// eligible for the shared package cache).
    pub fn is_from_index(&self) -> bool {
        matches!(self.req.source, RequirementSource::Named { .. })
    }

    /// The prepared metadata, if preparation already happened.
    pub fn prepared(&self) -> Option<Arc<PreparedCandidate>> {
        self.prepared.get().cloned()
    }

    /// Runs `prepare` at most once across all clones of this candidate and
    /// returns the shared result.
    pub async fn prepare_with<E, F, Fut>(&self, prepare: F) -> Result<Arc<PreparedCandidate>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<PreparedCandidate, E>>,
    {
        self.prepared
            .get_or_try_init(|| async { prepare().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Absorbs prepared metadata into the candidate's own fields: name and
    /// version for unnamed URL candidates, summary and python range for
    /// everyone.
    pub fn absorb_metadata(&mut self, metadata: &DistMetadata) {
        if self.name.is_none() {
            self.name = Some(metadata.name.clone());
        }
        if self.version.is_none() {
            self.version = Some(metadata.version.clone());
        }
        if self.summary.is_none() {
            self.summary = metadata.summary.clone();
        }
        if self.requires_python.is_allow_all() {
            self.requires_python = metadata.requires_python.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn key_prefers_name_over_requirement() {
        let req = Requirement::from_str("demo[cli]>=1.0").unwrap();
        let candidate = Candidate::new(req).with_version(Version::from_str("1.2").unwrap());
        assert_eq!(candidate.key(), "demo[cli]");
    }

    #[tokio::test]
    async fn preparation_happens_once() {
        let req = Requirement::from_str("demo").unwrap();
        let candidate = Candidate::new(req);
        let clone = candidate.clone();

        let metadata = DistMetadata::try_from(
            "Metadata-Version: 2.1\nName: demo\nVersion: 1.0\n".as_bytes(),
        )
        .unwrap();

        let first = candidate
            .prepare_with(|| async {
                Ok::<_, std::convert::Infallible>(PreparedCandidate {
                    metadata: metadata.clone(),
                    wheel: None,
                    direct_url: None,
                })
            })
            .await
            .unwrap();

        // The clone sees the already-prepared value without re-running.
        let ran_again = std::sync::atomic::AtomicBool::new(false);
        let second = clone
            .prepare_with(|| async {
                ran_again.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(PreparedCandidate {
                    metadata: metadata.clone(),
                    wheel: None,
                    direct_url: None,
                })
            })
            .await
            .unwrap();
        assert!(!ran_again.load(std::sync::atomic::Ordering::SeqCst));
        assert!(Arc::ptr_eq(&first, &second));
    }
}
