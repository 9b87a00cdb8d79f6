use indexmap::IndexMap;

use crate::index::RepositoryError;
use crate::types::{Candidate, Requirement};

use super::provider::{Identifier, Provider, ProviderError, RequirementInfo};

/// Upper bound on resolution rounds before giving up. Graphs that need more
/// are circular or pathologically large.
pub const DEFAULT_MAX_ROUNDS: usize = 10_000;

/// The state of one vertex during resolution.
#[derive(Debug, Clone)]
struct Criterion {
    /// Candidates still in play, best first.
    candidates: Vec<Candidate>,
    /// Every requirement edge pointing at this vertex.
    information: Vec<RequirementInfo>,
    /// Candidates ruled out by backtracking.
    incompatibilities: Vec<Candidate>,
}

impl Criterion {
    fn requirements(&self) -> Vec<Requirement> {
        self.information
            .iter()
            .map(|info| info.requirement.clone())
            .collect()
    }
}

/// One snapshot of the search: the pins made so far and the criteria they
/// imply. The resolver keeps a stack of these and pops on backtrack.
#[derive(Debug, Clone, Default)]
struct State {
    mapping: IndexMap<Identifier, Candidate>,
    criteria: IndexMap<Identifier, Criterion>,
    backtrack_causes: Vec<RequirementInfo>,
}

/// A finished resolution: every vertex has exactly one pinned candidate.
#[derive(Debug, Clone)]
pub struct ResolutionGraph {
    /// Vertex id to pinned candidate, in pin order.
    pub mapping: IndexMap<Identifier, Candidate>,
    /// Vertex id to the requirement edges that selected it.
    pub criteria: IndexMap<Identifier, Vec<RequirementInfo>>,
}

/// Why a resolution stopped without a solution.
#[derive(Debug)]
pub enum ResolutionError {
    /// The search space is exhausted for these requirement edges.
    Impossible(Vec<RequirementInfo>),
    /// The round budget ran out.
    TooDeep(usize),
    /// The provider produced a candidate that does not satisfy its own
    /// criterion; this is a provider bug, not a user error.
    Inconsistent(String),
    /// A repository failure that is not a backtracking signal.
    Fatal(RepositoryError),
}

struct Conflict(Vec<RequirementInfo>);

/// The backtracking resolver. Drives a [`Provider`] to a fixed point in a
/// bounded number of rounds.
pub struct Resolver<'a> {
    provider: &'a dyn Provider,
    states: Vec<State>,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver over the given provider.
    pub fn new(provider: &'a dyn Provider) -> Self {
        Resolver {
            provider,
            states: Vec::new(),
        }
    }

    fn state(&mut self) -> &mut State {
        self.states.last_mut().expect("resolver state stack is never empty")
    }

    /// Runs the resolution.
    pub fn resolve(
        &mut self,
        requirements: Vec<Requirement>,
        max_rounds: usize,
    ) -> Result<ResolutionGraph, ResolutionError> {
        self.states = vec![State::default()];
        for requirement in requirements {
            let mut criteria = std::mem::take(&mut self.state().criteria);
            match self.add_to_criteria(&mut criteria, requirement, None) {
                Ok(()) => self.state().criteria = criteria,
                Err(Conflict(causes)) => return Err(ResolutionError::Impossible(causes)),
            }
        }

        // Keep the root state as a sentinel so the very first pin has
        // something to backtrack to.
        self.push_state_clone();

        for round in 0..max_rounds {
            let unsatisfied = self.unsatisfied_names();
            if unsatisfied.is_empty() {
                tracing::debug!("resolution converged after {round} rounds");
                let state = self.states.pop().expect("state stack is never empty");
                return Ok(ResolutionGraph {
                    mapping: state.mapping,
                    criteria: state
                        .criteria
                        .into_iter()
                        .map(|(key, criterion)| (key, criterion.information))
                        .collect(),
                });
            }

            // Most-constrained vertex first.
            let (candidates, information) = {
                let state = self.states.last().expect("state stack is never empty");
                let candidates: IndexMap<Identifier, Vec<Candidate>> = state
                    .criteria
                    .iter()
                    .map(|(key, criterion)| (key.clone(), criterion.candidates.clone()))
                    .collect();
                let information: IndexMap<Identifier, Vec<RequirementInfo>> = state
                    .criteria
                    .iter()
                    .map(|(key, criterion)| (key.clone(), criterion.information.clone()))
                    .collect();
                (candidates, information)
            };
            let name = unsatisfied
                .into_iter()
                .min_by_key(|name| self.provider.get_preference(name, &candidates, &information))
                .expect("at least one unsatisfied name exists");
            tracing::debug!(round, vertex = %name, "attempting to pin");

            match self.attempt_to_pin(&name)? {
                None => self.push_state_clone(),
                Some(Conflict(causes)) => {
                    let backtracked = self.backtrack()?;
                    self.state().backtrack_causes = causes;
                    if !backtracked {
                        let causes = std::mem::take(&mut self.state().backtrack_causes);
                        return Err(ResolutionError::Impossible(causes));
                    }
                }
            }
        }

        Err(ResolutionError::TooDeep(max_rounds))
    }

    fn push_state_clone(&mut self) {
        let clone = self.states.last().expect("state stack is never empty").clone();
        self.states.push(clone);
    }

    /// Vertices whose current pin (if any) does not satisfy all their
    /// requirement edges.
    fn unsatisfied_names(&self) -> Vec<Identifier> {
        let state = self.states.last().expect("state stack is never empty");
        state
            .criteria
            .iter()
            .filter(|(name, criterion)| {
                match state.mapping.get(*name) {
                    None => true,
                    Some(pin) => !criterion
                        .information
                        .iter()
                        .all(|info| self.provider.is_satisfied_by(&info.requirement, pin)),
                }
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Tries each candidate of the vertex in order. On success the pin is
    /// recorded and `None` returned; otherwise the accumulated conflict
    /// causes come back.
    fn attempt_to_pin(&mut self, name: &str) -> Result<Option<Conflict>, ResolutionError> {
        let criterion = self
            .states
            .last()
            .expect("state stack is never empty")
            .criteria
            .get(name)
            .cloned()
            .expect("attempted to pin an unknown vertex");

        let mut causes = Vec::new();
        for candidate in &criterion.candidates {
            let updated = match self.criteria_with_dependencies(candidate) {
                Ok(updated) => updated,
                Err(PinFailure::Conflict(Conflict(conflict_causes))) => {
                    causes.extend(conflict_causes);
                    continue;
                }
                Err(PinFailure::Soft(reason)) => {
                    // The candidate's metadata is unobtainable; treat the
                    // branch as dead and move on.
                    tracing::debug!("skipping {}: {reason}", candidate.key());
                    causes.extend(criterion.information.clone());
                    continue;
                }
                Err(PinFailure::Fatal(error)) => return Err(error),
            };

            // The provider must agree the candidate satisfies the criterion
            // it was produced for.
            if !criterion
                .information
                .iter()
                .all(|info| self.provider.is_satisfied_by(&info.requirement, candidate))
            {
                return Err(ResolutionError::Inconsistent(format!(
                    "provider offered {} which does not satisfy its own criterion",
                    candidate.key()
                )));
            }

            let state = self.state();
            state.criteria = updated;
            state.mapping.shift_remove(name);
            state.mapping.insert(name.to_string(), candidate.clone());
            return Ok(None);
        }
        Ok(Some(Conflict(causes)))
    }

    /// Clones the current criteria and merges in the dependencies of a
    /// candidate about to be pinned.
    fn criteria_with_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<IndexMap<Identifier, Criterion>, PinFailure> {
        let dependencies = match self.provider.get_dependencies(candidate) {
            Ok(dependencies) => dependencies,
            Err(ProviderError::Backtrack(reason)) => return Err(PinFailure::Soft(reason)),
            Err(ProviderError::Fatal(error)) => {
                return Err(PinFailure::Fatal(ResolutionError::Fatal(error)))
            }
        };

        let mut criteria = self
            .states
            .last()
            .expect("state stack is never empty")
            .criteria
            .clone();
        for dependency in dependencies {
            self.add_to_criteria(&mut criteria, dependency, Some(candidate.clone()))
                .map_err(PinFailure::Conflict)?;
        }
        Ok(criteria)
    }

    /// Registers one requirement edge into `criteria`, re-querying the
    /// provider for the narrowed candidate list.
    fn add_to_criteria(
        &self,
        criteria: &mut IndexMap<Identifier, Criterion>,
        requirement: Requirement,
        parent: Option<Candidate>,
    ) -> Result<(), Conflict> {
        let identifier = self.provider.identify_requirement(&requirement);

        let mut requirements: IndexMap<Identifier, Vec<Requirement>> = criteria
            .iter()
            .map(|(key, criterion)| (key.clone(), criterion.requirements()))
            .collect();
        requirements
            .entry(identifier.clone())
            .or_default()
            .push(requirement.clone());

        let incompatibilities: IndexMap<Identifier, Vec<Candidate>> = criteria
            .iter()
            .map(|(key, criterion)| (key.clone(), criterion.incompatibilities.clone()))
            .collect();

        let mut information = criteria
            .get(&identifier)
            .map(|criterion| criterion.information.clone())
            .unwrap_or_default();
        information.push(RequirementInfo {
            requirement,
            parent,
        });

        let matches = match self
            .provider
            .find_matches(&identifier, &requirements, &incompatibilities)
        {
            Ok(matches) => matches,
            Err(ProviderError::Backtrack(reason)) => {
                tracing::debug!("no matches for {identifier}: {reason}");
                Vec::new()
            }
            // A fatal repository failure still surfaces as an exhausted
            // criterion here; the pin attempt layer turns it fatal.
            Err(ProviderError::Fatal(error)) => {
                tracing::error!("failed to find matches for {identifier}: {error}");
                Vec::new()
            }
        };

        if matches.is_empty() {
            return Err(Conflict(information));
        }
        let incompatibilities = incompatibilities
            .get(&identifier)
            .cloned()
            .unwrap_or_default();
        criteria.insert(
            identifier,
            Criterion {
                candidates: matches,
                information,
                incompatibilities,
            },
        );
        Ok(())
    }

    /// Unwinds the state stack: the most recent pin becomes an
    /// incompatibility and every criterion is re-derived without it.
    /// Returns false when there is nothing left to unwind.
    fn backtrack(&mut self) -> Result<bool, ResolutionError> {
        while self.states.len() >= 3 {
            // Drop the exploratory state, then take the state that made the
            // offending pin.
            self.states.pop();
            let mut broken = self.states.pop().expect("stack has at least three states");
            let Some((name, candidate)) = broken.mapping.pop() else {
                continue;
            };
            tracing::debug!(vertex = %name, "backtracking");

            let mut incompatibilities: Vec<(Identifier, Vec<Candidate>)> = broken
                .criteria
                .iter()
                .map(|(key, criterion)| (key.clone(), criterion.incompatibilities.clone()))
                .collect();
            incompatibilities.push((name, vec![candidate]));

            self.push_state_clone();
            if self.patch_criteria(incompatibilities)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-runs `find_matches` for each vertex with the enlarged
    /// incompatibility sets. Fails (returns false) when some vertex ends up
    /// with no candidates, meaning we must backtrack further.
    fn patch_criteria(
        &mut self,
        new_incompatibilities: Vec<(Identifier, Vec<Candidate>)>,
    ) -> Result<bool, ResolutionError> {
        for (name, extra) in new_incompatibilities {
            if extra.is_empty() {
                continue;
            }
            let state = self.states.last().expect("state stack is never empty");
            let Some(criterion) = state.criteria.get(&name).cloned() else {
                continue;
            };

            let mut incompatibilities = criterion.incompatibilities.clone();
            incompatibilities.extend(extra);

            let requirements: IndexMap<Identifier, Vec<Requirement>> = state
                .criteria
                .iter()
                .map(|(key, criterion)| (key.clone(), criterion.requirements()))
                .collect();
            let mut incompatibility_map: IndexMap<Identifier, Vec<Candidate>> = state
                .criteria
                .iter()
                .map(|(key, criterion)| (key.clone(), criterion.incompatibilities.clone()))
                .collect();
            incompatibility_map.insert(name.clone(), incompatibilities.clone());

            let matches = match self
                .provider
                .find_matches(&name, &requirements, &incompatibility_map)
            {
                Ok(matches) => matches,
                Err(ProviderError::Backtrack(_)) => Vec::new(),
                Err(ProviderError::Fatal(error)) => return Err(ResolutionError::Fatal(error)),
            };
            if matches.is_empty() {
                return Ok(false);
            }

            self.state().criteria.insert(
                name,
                Criterion {
                    candidates: matches,
                    information: criterion.information,
                    incompatibilities,
                },
            );
        }
        Ok(true)
    }
}

enum PinFailure {
    Conflict(Conflict),
    Soft(String),
    Fatal(ResolutionError),
}
