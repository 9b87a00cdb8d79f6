use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use pep440_rs::{Operator, VersionSpecifier, VersionSpecifiers};
use pep508_rs::MarkerEnvironment;
use tokio::runtime::Handle;

use crate::index::{Repository, RepositoryError};
use crate::types::{Candidate, Extra, PySpecSet, Requirement, RequirementSource};

/// A resolver vertex id: `name[extras]`, or the source location for unnamed
/// requirements.
pub type Identifier = String;

/// Branching preference for a vertex; lower sorts first. The resolver picks
/// the vertex with the fewest remaining candidates, breaking ties towards
/// the one with more incoming constraints (most-constrained-variable).
pub type Preference = (usize, isize);

/// A requirement edge: the requirement and the pinned candidate that
/// introduced it (`None` for requirements declared by the project itself).
#[derive(Debug, Clone)]
pub struct RequirementInfo {
    /// The requirement.
    pub requirement: Requirement,
    /// The candidate whose dependencies contributed it.
    pub parent: Option<Candidate>,
}

/// Error raised by provider callbacks.
#[derive(Debug)]
pub enum ProviderError {
    /// The branch is a dead end; the resolver should try the next candidate.
    Backtrack(String),
    /// The resolution cannot continue.
    Fatal(RepositoryError),
}

impl From<RepositoryError> for ProviderError {
    fn from(error: RepositoryError) -> Self {
        if error.is_backtrack() {
            ProviderError::Backtrack(error.to_string())
        } else {
            ProviderError::Fatal(error)
        }
    }
}

/// The pluggable contract the resolver drives.
///
/// Implementations must be deterministic within one resolution: the resolver
/// re-asks `find_matches` while backtracking and relies on stable ordering.
pub trait Provider {
    /// The vertex id of a requirement.
    fn identify_requirement(&self, requirement: &Requirement) -> Identifier {
        requirement.key()
    }

    /// The vertex id of a candidate.
    fn identify_candidate(&self, candidate: &Candidate) -> Identifier {
        candidate.key()
    }

    /// The branching preference of an unsatisfied vertex.
    fn get_preference(
        &self,
        identifier: &str,
        candidates: &IndexMap<Identifier, Vec<Candidate>>,
        information: &IndexMap<Identifier, Vec<RequirementInfo>>,
    ) -> Preference;

    /// All candidates satisfying every requirement on `identifier`, minus
    /// the versions listed in `incompatibilities`, best first.
    fn find_matches(
        &self,
        identifier: &str,
        requirements: &IndexMap<Identifier, Vec<Requirement>>,
        incompatibilities: &IndexMap<Identifier, Vec<Candidate>>,
    ) -> Result<Vec<Candidate>, ProviderError>;

    /// Whether a candidate satisfies a single requirement.
    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool;

    /// The dependencies a pinned candidate contributes, already filtered by
    /// environment markers.
    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError>;
}

/// How an existing lock influences a new resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Ignore the lock entirely; everything may move.
    All,
    /// Keep the locked pin of every vertex not explicitly tracked.
    #[default]
    Reuse,
    /// Like `Reuse`, but the transitive dependencies of tracked vertices are
    /// unlocked too. The caller expands `tracked_names` to the closure.
    Eager,
}

/// The standard provider over a [`Repository`].
///
/// Carries the project's python range: offered candidates must support the
/// whole range (modulo the major-bound relaxation built into
/// [`PySpecSet::is_superset`]), and candidates rejected for their python
/// range are remembered so a failed resolution can suggest a workable
/// `requires-python`.
pub struct BaseProvider {
    repository: Arc<dyn Repository>,
    requires_python: PySpecSet,
    env_markers: MarkerEnvironment,
    allow_prereleases: bool,
    strategy: UpdateStrategy,
    locked: IndexMap<Identifier, Candidate>,
    tracked: HashSet<Identifier>,
    python_rejections: Mutex<IndexMap<Identifier, PySpecSet>>,
    /// Runtime handle used to drive repository futures from the resolver's
    /// dedicated blocking thread.
    handle: Handle,
}

impl BaseProvider {
    /// Creates a provider with no lock preference.
    pub fn new(
        repository: Arc<dyn Repository>,
        requires_python: PySpecSet,
        env_markers: MarkerEnvironment,
        allow_prereleases: bool,
        handle: Handle,
    ) -> Self {
        BaseProvider {
            repository,
            requires_python,
            env_markers,
            allow_prereleases,
            strategy: UpdateStrategy::All,
            locked: IndexMap::new(),
            tracked: HashSet::new(),
            python_rejections: Mutex::new(IndexMap::new()),
            handle,
        }
    }

    /// Applies an update strategy backed by the previously locked pins.
    /// `tracked` names the vertices the user asked to move; for
    /// [`UpdateStrategy::Eager`] the caller passes the transitive closure.
    pub fn with_strategy(
        mut self,
        strategy: UpdateStrategy,
        locked: IndexMap<Identifier, Candidate>,
        tracked: HashSet<Identifier>,
    ) -> Self {
        self.strategy = strategy;
        self.locked = locked;
        self.tracked = tracked;
        self
    }

    /// For each vertex whose candidates were all rejected over their python
    /// range, the union of the ranges those candidates would have accepted.
    /// Feeds the `requires-python` suggestion in failure diagnostics.
    pub fn python_rejections(&self) -> IndexMap<Identifier, PySpecSet> {
        self.python_rejections.lock().clone()
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Folds all named requirements on a vertex into one query requirement
    /// carrying the intersected specifier.
    fn merged_requirement(requirements: &[Requirement]) -> Requirement {
        let mut merged = requirements[0].clone();
        if let RequirementSource::Named { specifier } = &merged.source {
            let mut clauses: Vec<VersionSpecifier> = specifier.iter().cloned().collect();
            for other in &requirements[1..] {
                if let RequirementSource::Named { specifier } = &other.source {
                    clauses.extend(specifier.iter().cloned());
                }
            }
            merged.source = RequirementSource::Named {
                specifier: VersionSpecifiers::from_iter(clauses),
            };
        }
        merged
    }

    fn record_python_rejection(&self, identifier: &str, candidate: &Candidate) {
        let mut rejections = self.python_rejections.lock();
        let entry = rejections
            .entry(identifier.to_string())
            .or_insert_with(PySpecSet::impossible);
        *entry = entry.union(&candidate.requires_python);
    }
}

impl Provider for BaseProvider {
    fn get_preference(
        &self,
        identifier: &str,
        candidates: &IndexMap<Identifier, Vec<Candidate>>,
        information: &IndexMap<Identifier, Vec<RequirementInfo>>,
    ) -> Preference {
        let remaining = candidates
            .get(identifier)
            .map(Vec::len)
            .unwrap_or(usize::MAX);
        let constraints = information.get(identifier).map(Vec::len).unwrap_or(0);
        (remaining, -(constraints as isize))
    }

    fn find_matches(
        &self,
        identifier: &str,
        requirements: &IndexMap<Identifier, Vec<Requirement>>,
        incompatibilities: &IndexMap<Identifier, Vec<Candidate>>,
    ) -> Result<Vec<Candidate>, ProviderError> {
        let Some(reqs) = requirements.get(identifier).filter(|reqs| !reqs.is_empty()) else {
            return Ok(Vec::new());
        };
        let merged = Self::merged_requirement(reqs);
        let found = self.block_on(self.repository.find_candidates(
            &merged,
            &self.requires_python,
            self.allow_prereleases,
        ))?;

        let excluded: Vec<&Candidate> = incompatibilities
            .get(identifier)
            .into_iter()
            .flatten()
            .collect();
        let mut usable = Vec::new();
        let mut any_python_rejection = false;
        for candidate in found {
            if excluded
                .iter()
                .any(|other| other.version == candidate.version && candidate.version.is_some())
            {
                continue;
            }
            if !reqs.iter().all(|req| self.is_satisfied_by(req, &candidate)) {
                continue;
            }
            // Index candidates must support the project's entire python
            // range; direct candidates are checked once prepared.
            if candidate.is_from_index()
                && !candidate.requires_python.is_superset(&self.requires_python)
            {
                self.record_python_rejection(identifier, &candidate);
                any_python_rejection = true;
                continue;
            }
            usable.push(candidate);
        }

        if !any_python_rejection {
            // Every surviving candidate supports the range; drop a stale
            // rejection record from an earlier, wider query.
            self.python_rejections.lock().shift_remove(identifier);
        }

        // An untracked vertex with a still-valid lock keeps its pin.
        if self.strategy != UpdateStrategy::All && !self.tracked.contains(identifier) {
            if let Some(pin) = self.locked.get(identifier) {
                let pinned = usable
                    .iter()
                    .position(|candidate| candidate.version == pin.version)
                    .map(|index| usable.remove(index));
                if let Some(pinned) = pinned {
                    return Ok(vec![pinned]);
                }
            }
        }

        Ok(usable)
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        if let (Some(required), Some(name)) = (&requirement.name, &candidate.name) {
            if required != name {
                return false;
            }
        }
        if !requirement
            .extras
            .iter()
            .all(|extra| candidate.req.extras.contains(extra))
        {
            return false;
        }
        match (&requirement.source, &candidate.version) {
            (RequirementSource::Named { specifier }, Some(version)) => {
                specifier.contains(version)
            }
            // A direct candidate (or one not yet prepared) cannot be
            // contradicted by a version range.
            _ => true,
        }
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        tracing::debug!("collecting dependencies of {}", candidate.key());
        let info = self.block_on(self.repository.get_dependencies(candidate))?;

        // The project's python range and the candidate's must overlap once
        // real metadata is known.
        if info
            .requires_python
            .intersect(&self.requires_python)
            .is_impossible()
        {
            return Err(ProviderError::Backtrack(format!(
                "{} requires python {}",
                candidate.key(),
                info.requires_python
            )));
        }

        let mut dependencies = Vec::new();

        // An extras vertex depends on its base package at the same version,
        // so both always resolve together.
        if !candidate.req.extras.is_empty() {
            if let (Some(name), Some(version)) = (&candidate.name, &candidate.version) {
                let clause = VersionSpecifier::new(Operator::Equal, version.clone(), false)
                    .expect("an equality clause is always valid");
                dependencies.push(Requirement {
                    name: Some(name.clone()),
                    extras: Vec::new(),
                    marker: None,
                    source: RequirementSource::Named {
                        specifier: VersionSpecifiers::from_iter([clause]),
                    },
                    group: candidate.req.group.clone(),
                });
            }
        }

        let active: Vec<&str> = candidate.req.extras.iter().map(Extra::as_str).collect();
        for dependency in info.requirements {
            let applies = dependency
                .marker
                .as_ref()
                .map(|marker| marker.evaluate(&self.env_markers, &active))
                .unwrap_or(true);
            if applies {
                dependencies.push(dependency.with_group(candidate.req.group.clone()));
            }
        }
        Ok(dependencies)
    }
}
