//! The resolver driver: runs the backtracking core over a provider, formats
//! failures into actionable diagnostics and fetches artifact hashes for the
//! lockfile after a successful run.

mod provider;
mod resolution;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use futures::{stream, StreamExt};
use indexmap::IndexMap;
use miette::Diagnostic;
use pep508_rs::MarkerEnvironment;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::core::ProjectManifest;
use crate::index::{LockedRepository, Repository, RepositoryError};
use crate::types::{Candidate, GroupName, PySpecSet, Requirement};

pub use provider::{BaseProvider, Identifier, Preference, Provider, ProviderError, RequirementInfo, UpdateStrategy};
pub use resolution::{ResolutionError, ResolutionGraph, Resolver, DEFAULT_MAX_ROUNDS};

/// How many hash fetches run concurrently after a resolution.
const HASH_FETCH_CONCURRENCY: usize = 8;

/// Options controlling one resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// How an existing lock constrains the result.
    pub strategy: UpdateStrategy,
    /// The vertices the user asked to move; ignored for
    /// [`UpdateStrategy::All`].
    pub tracked_names: HashSet<String>,
    /// Whether prereleases may be picked without an explicit pin.
    pub allow_prereleases: bool,
    /// Round budget for the backtracking core.
    pub max_rounds: usize,
    /// Whether artifact hashes are fetched after a successful resolution.
    pub fetch_hashes: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            strategy: UpdateStrategy::default(),
            tracked_names: HashSet::new(),
            allow_prereleases: false,
            max_rounds: DEFAULT_MAX_ROUNDS,
            fetch_hashes: true,
        }
    }
}

/// The output of a successful resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Vertex key to pinned candidate.
    pub candidates: IndexMap<String, Candidate>,
    /// Vertex key to the requirements that candidate contributed.
    pub dependencies: IndexMap<String, Vec<Requirement>>,
    /// Vertex key to the dependency groups whose closure selected it.
    pub sections: BTreeMap<String, BTreeSet<GroupName>>,
}

/// Error raised by [`resolve`].
#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    /// No consistent set of pins exists for the requirements.
    #[error("unable to find a resolution\n{details}")]
    Impossible {
        /// Formatted `(requirement, parent)` cause lines.
        details: String,
        /// A `requires-python` that would admit the conflicting candidates.
        #[help]
        requires_python_hint: Option<String>,
    },

    /// The round budget ran out.
    #[error("resolution exceeded {0} rounds")]
    #[diagnostic(help(
        "a circular or pathologically large dependency graph is likely; \
         try constraining the versions of frequently revisited packages"
    ))]
    TooDeep(usize),

    /// A provider implementation bug surfaced.
    #[error("inconsistent provider behavior: {0}")]
    Inconsistent(String),

    /// A repository failure that was not a backtracking signal.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Resolves the requirements of the selected groups into a pinned candidate
/// set.
///
/// The resolver itself runs single-threaded on a blocking thread; repository
/// futures are driven through the runtime handle, and hash fetching is
/// parallelized afterwards.
pub async fn resolve(
    repository: Arc<dyn Repository>,
    manifest: &ProjectManifest,
    env_markers: MarkerEnvironment,
    groups: &[GroupName],
    locked: Option<&LockedRepository>,
    options: ResolveOptions,
) -> Result<Resolution, ResolveError> {
    let requirements = manifest.requirements_for(groups);
    let requires_python = manifest.requires_python.clone();

    // Expand tracked names per the strategy before the provider exists.
    let (locked_pins, tracked) = match (locked, options.strategy) {
        (Some(locked), UpdateStrategy::Reuse) => {
            (locked.all_candidates(), options.tracked_names.clone())
        }
        (Some(locked), UpdateStrategy::Eager) => (
            locked.all_candidates(),
            expand_tracked(locked, &options.tracked_names).await,
        ),
        _ => (IndexMap::new(), HashSet::new()),
    };

    let handle = Handle::current();
    let strategy = options.strategy;
    let allow_prereleases = options.allow_prereleases;
    let max_rounds = options.max_rounds;
    let resolver_repository = repository.clone();

    let (graph_result, python_rejections) = tokio::task::spawn_blocking(move || {
        let provider = BaseProvider::new(
            resolver_repository,
            requires_python.clone(),
            env_markers,
            allow_prereleases,
            handle,
        )
        .with_strategy(strategy, locked_pins, tracked);
        let result = Resolver::new(&provider).resolve(requirements, max_rounds);
        (result, provider.python_rejections())
    })
    .await
    .expect("the resolver thread never panics");

    let graph = match graph_result {
        Ok(graph) => graph,
        Err(error) => {
            return Err(into_resolve_error(
                error,
                &manifest.requires_python,
                python_rejections,
            ))
        }
    };

    let mut resolution = build_resolution(graph);
    if options.fetch_hashes {
        fetch_hashes(repository, &mut resolution).await?;
    }
    Ok(resolution)
}

/// Converts the resolver graph into the driver output: absorbs prepared
/// metadata into candidates, derives forward dependency edges from the
/// criteria, and propagates group membership through the graph.
fn build_resolution(graph: ResolutionGraph) -> Resolution {
    let mut candidates = IndexMap::new();
    let mut dependencies: IndexMap<String, Vec<Requirement>> = IndexMap::new();
    let mut roots: Vec<(String, GroupName)> = Vec::new();
    let mut edges: Vec<(String, String)> = Vec::new();

    for (key, candidate) in &graph.mapping {
        let mut candidate = candidate.clone();
        if let Some(prepared) = candidate.prepared() {
            candidate.absorb_metadata(&prepared.metadata);
        }
        candidates.insert(key.clone(), candidate);
        dependencies.entry(key.clone()).or_default();
    }

    for (key, infos) in &graph.criteria {
        if !graph.mapping.contains_key(key) {
            continue;
        }
        for info in infos {
            match &info.parent {
                Some(parent) => {
                    let parent_key = parent.key();
                    edges.push((parent_key.clone(), key.clone()));
                    dependencies
                        .entry(parent_key)
                        .or_default()
                        .push(info.requirement.clone());
                }
                None => roots.push((key.clone(), info.requirement.group.clone())),
            }
        }
    }

    // Group membership flows from the roots through the dependency edges to
    // a fixed point.
    let mut sections: BTreeMap<String, BTreeSet<GroupName>> = BTreeMap::new();
    for (key, group) in roots {
        sections.entry(key).or_default().insert(group);
    }
    loop {
        let mut changed = false;
        for (parent, child) in &edges {
            let parent_groups = sections.get(parent).cloned().unwrap_or_default();
            if parent_groups.is_empty() {
                continue;
            }
            let child_groups = sections.entry(child.clone()).or_default();
            for group in parent_groups {
                changed |= child_groups.insert(group);
            }
        }
        if !changed {
            break;
        }
    }

    for requirements in dependencies.values_mut() {
        requirements.sort_by_key(|requirement| requirement.to_string());
        requirements.dedup();
    }

    Resolution {
        candidates,
        dependencies,
        sections,
    }
}

/// Acquires artifact hashes for every candidate with a bounded amount of
/// parallelism, so the lockfile can record them.
async fn fetch_hashes(
    repository: Arc<dyn Repository>,
    resolution: &mut Resolution,
) -> Result<(), RepositoryError> {
    let keys: Vec<String> = resolution.candidates.keys().cloned().collect();
    let mut fetched = stream::iter(keys)
        .map(|key| {
            let repository = repository.clone();
            let candidate = resolution.candidates[&key].clone();
            async move {
                let hashes = repository.get_hashes(&candidate).await;
                (key, hashes)
            }
        })
        .buffer_unordered(HASH_FETCH_CONCURRENCY);

    let mut results = Vec::new();
    while let Some((key, hashes)) = fetched.next().await {
        match hashes {
            Ok(hashes) => results.push((key, hashes)),
            Err(error) => {
                // Hashes are best-effort enrichment for the lockfile; a
                // candidate we cannot hash is recorded without file hashes.
                tracing::warn!("failed to fetch hashes for {key}: {error}");
            }
        }
    }
    drop(fetched);
    for (key, hashes) in results {
        if let Some(candidate) = resolution.candidates.get_mut(&key) {
            candidate.hashes = hashes;
        }
    }
    Ok(())
}

/// Expands tracked names to their transitive dependency closure using the
/// locked graph, which is what makes `--eager` updates move transitive
/// dependencies too.
async fn expand_tracked(
    locked: &LockedRepository,
    tracked_names: &HashSet<String>,
) -> HashSet<String> {
    let all = locked.all_candidates();
    let mut closure: HashSet<String> = tracked_names.clone();
    let mut queue: Vec<String> = tracked_names.iter().cloned().collect();
    while let Some(key) = queue.pop() {
        let Some(candidate) = all.get(&key) else {
            continue;
        };
        let Ok(info) = locked.get_dependencies(candidate).await else {
            continue;
        };
        for requirement in info.requirements {
            let child = requirement.key();
            if closure.insert(child.clone()) {
                queue.push(child);
            }
        }
    }
    closure
}

fn into_resolve_error(
    error: ResolutionError,
    project_python: &PySpecSet,
    python_rejections: IndexMap<String, PySpecSet>,
) -> ResolveError {
    match error {
        ResolutionError::TooDeep(rounds) => ResolveError::TooDeep(rounds),
        ResolutionError::Inconsistent(message) => ResolveError::Inconsistent(message),
        ResolutionError::Fatal(error) => ResolveError::Repository(error),
        ResolutionError::Impossible(causes) => {
            let details = causes
                .iter()
                .map(|info| {
                    let origin = info
                        .parent
                        .as_ref()
                        .map(|parent| parent.key())
                        .unwrap_or_else(|| "the project".to_string());
                    format!("  {} (from {origin})", info.requirement)
                })
                .collect::<Vec<_>>()
                .join("\n");

            // When every cause is a python-range conflict, compute the
            // narrowed requires-python that would have admitted them.
            let all_python = !causes.is_empty()
                && causes
                    .iter()
                    .all(|info| python_rejections.contains_key(&info.requirement.key()));
            let requires_python_hint = if all_python {
                let mut narrowed = project_python.clone();
                for rejected in python_rejections.values() {
                    narrowed = narrowed.intersect(rejected);
                }
                (!narrowed.is_impossible()).then(|| {
                    format!("try setting `requires-python = \"{narrowed}\"` in the project")
                })
            } else {
                None
            };

            ResolveError::Impossible {
                details,
                requires_python_hint,
            }
        }
    }
}
