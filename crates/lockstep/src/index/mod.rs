//! Candidate sources: the index-backed repository that queries package
//! indexes and builds sdists for metadata, and the locked repository
//! reconstituted from a lockfile for repeatable installs.

mod file_store;
mod http;
mod index_repository;
mod listing;
mod locked_repository;

use std::collections::BTreeMap;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::types::{Candidate, PySpecSet, Requirement};

pub use file_store::FileStore;
pub use http::{CacheMode, Http, HttpError, HttpResponse};
pub use index_repository::IndexRepository;
pub use listing::{ArtifactListing, ProjectListing, Yanked};
pub use locked_repository::LockedRepository;

/// The dependency information a repository reports for a candidate.
#[derive(Debug, Clone, Default)]
pub struct CandidateDependencies {
    /// The candidate's declared dependencies, markers intact.
    pub requirements: Vec<Requirement>,
    /// The python range the candidate supports.
    pub requires_python: PySpecSet,
    /// The candidate's one-line summary, if known.
    pub summary: Option<String>,
}

/// Error raised by repository operations.
///
/// The first two variants are *soft*: the resolver treats them as an
/// unsatisfiable branch and backtracks to a different candidate. Everything
/// else aborts the resolution.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum RepositoryError {
    #[error("no usable metadata could be obtained for {0}")]
    CandidateInfoNotFound(String),

    #[error("failed to build {candidate}: {message}")]
    CandidateBuild { candidate: String, message: String },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RepositoryError {
    /// Whether the resolver should treat this error as a dead branch rather
    /// than a fatal failure.
    pub fn is_backtrack(&self) -> bool {
        matches!(
            self,
            RepositoryError::CandidateInfoNotFound(_) | RepositoryError::CandidateBuild { .. }
        )
    }
}

/// A source of candidates.
///
/// `find_candidates` returns candidates best-first; the provider and the
/// resolver never re-sort them. `get_dependencies` may be expensive (it can
/// trigger a download or a PEP 517 build); `get_hashes` is only called after
/// a successful resolution, to give the lockfile its artifact hashes.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Finds candidates matching a requirement, ordered best-first.
    ///
    /// `requires_python` is the project's python range: candidates whose
    /// python range is disjoint from it are excluded. Pre-releases are
    /// excluded unless `allow_prereleases` is set or the requirement pins
    /// one explicitly.
    async fn find_candidates(
        &self,
        requirement: &Requirement,
        requires_python: &PySpecSet,
        allow_prereleases: bool,
    ) -> Result<Vec<Candidate>, RepositoryError>;

    /// Fetches the dependency information of a candidate, preparing it if
    /// necessary.
    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateDependencies, RepositoryError>;

    /// Returns `filename-or-url -> "sha256:<hex>"` for every artifact the
    /// installer may verify for this candidate.
    async fn get_hashes(
        &self,
        candidate: &Candidate,
    ) -> Result<BTreeMap<String, String>, RepositoryError>;
}
