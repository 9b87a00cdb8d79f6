use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::lockfile::Lockfile;
use crate::types::{Candidate, GroupName, PySpecSet, Requirement, RequirementSource};

use super::{CandidateDependencies, Repository, RepositoryError};

/// A repository reconstituted from a lockfile.
///
/// Every vertex maps to exactly one candidate; dependencies and hashes come
/// from the stored document, so resolving against this repository touches no
/// index and yields exactly the locked pins.
pub struct LockedRepository {
    entries: IndexMap<String, LockedEntry>,
}

struct LockedEntry {
    candidate: Candidate,
    dependencies: Vec<Requirement>,
    sections: Vec<GroupName>,
}

impl LockedRepository {
    /// Builds the repository from a parsed lockfile. Entries that fail to
    /// reconstruct (malformed versions or requirement strings) are skipped
    /// with a warning rather than poisoning every operation.
    pub fn from_lockfile(lockfile: &Lockfile) -> Self {
        let mut entries = IndexMap::new();
        for package in &lockfile.packages {
            match Self::reconstruct(lockfile, package) {
                Ok(entry) => {
                    entries.insert(entry.candidate.key(), entry);
                }
                Err(reason) => {
                    tracing::warn!(
                        "skipping locked package {} {}: {reason}",
                        package.name,
                        package.version
                    );
                }
            }
        }
        LockedRepository { entries }
    }

    fn reconstruct(
        lockfile: &Lockfile,
        package: &crate::lockfile::LockedPackage,
    ) -> Result<LockedEntry, String> {
        let extras = if package.extras.is_empty() {
            String::new()
        } else {
            format!("[{}]", package.extras.join(","))
        };
        let line = if let Some(url) = &package.git {
            let revision = package
                .revision
                .as_ref()
                .map(|rev| format!("@{rev}"))
                .unwrap_or_default();
            let editable = if package.editable { "-e " } else { "" };
            format!("{editable}{}{extras} @ git+{url}{revision}", package.name)
        } else if let Some(path) = &package.path {
            let editable = if package.editable { "-e " } else { "" };
            format!("{editable}{path}")
        } else if let Some(url) = &package.url {
            format!("{}{extras} @ {url}", package.name)
        } else {
            format!("{}{extras}=={}", package.name, package.version)
        };
        let requirement = Requirement::from_str(&line).map_err(|e| e.to_string())?;

        let mut candidate = Candidate::new(requirement);
        if let Ok(version) = pep440_rs::Version::from_str(&package.version) {
            candidate.version = Some(version);
        }
        if candidate.name.is_none() {
            candidate.name = package.name.parse().ok();
        }
        candidate.summary = package.summary.clone();
        if !package.requires_python.is_empty() {
            candidate.requires_python = package
                .requires_python
                .parse()
                .map_err(|e: crate::types::ParsePySpecError| e.to_string())?;
        }
        for entry in lockfile.file_hashes(&package.name, &package.version) {
            let source = entry
                .file
                .clone()
                .or_else(|| entry.url.clone())
                .unwrap_or_default();
            if !source.is_empty() {
                candidate.hashes.insert(source, entry.hash.clone());
            }
        }

        let dependencies = package
            .dependencies
            .iter()
            .map(|line| Requirement::from_str(line).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let sections = package
            .sections
            .iter()
            .map(|section| GroupName::from_str(section).expect("group parsing is infallible"))
            .collect();

        Ok(LockedEntry {
            candidate,
            dependencies,
            sections,
        })
    }

    /// All locked candidates, keyed by vertex.
    pub fn all_candidates(&self) -> IndexMap<String, Candidate> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.candidate.clone()))
            .collect()
    }

    /// The candidates selected for any of the given groups, following the
    /// stored `sections` tags.
    pub fn candidates_for_groups(&self, groups: &[GroupName]) -> IndexMap<String, Candidate> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.sections.iter().any(|section| groups.contains(section)))
            .map(|(key, entry)| (key.clone(), entry.candidate.clone()))
            .collect()
    }

    /// Number of locked vertices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the lock holds no packages.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Repository for LockedRepository {
    async fn find_candidates(
        &self,
        requirement: &Requirement,
        _requires_python: &PySpecSet,
        _allow_prereleases: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        let Some(entry) = self.entries.get(&requirement.key()) else {
            return Ok(Vec::new());
        };
        // A pin that no longer satisfies the requirement is simply not a
        // match; the caller decides whether that is fatal.
        if let (RequirementSource::Named { specifier }, Some(version)) =
            (&requirement.source, &entry.candidate.version)
        {
            if !specifier.contains(version) {
                return Ok(Vec::new());
            }
        }
        Ok(vec![entry.candidate.clone()])
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateDependencies, RepositoryError> {
        let entry = self
            .entries
            .get(&candidate.key())
            .ok_or_else(|| RepositoryError::CandidateInfoNotFound(candidate.key()))?;
        Ok(CandidateDependencies {
            requirements: entry.dependencies.clone(),
            requires_python: entry.candidate.requires_python.clone(),
            summary: entry.candidate.summary.clone(),
        })
    }

    async fn get_hashes(
        &self,
        candidate: &Candidate,
    ) -> Result<BTreeMap<String, String>, RepositoryError> {
        Ok(self
            .entries
            .get(&candidate.key())
            .map(|entry| entry.candidate.hashes.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::{FileHash, LockMetadata, LockedPackage};

    fn sample() -> Lockfile {
        Lockfile {
            metadata: LockMetadata {
                lock_version: crate::lockfile::LOCK_VERSION.to_string(),
                content_hash: "sha256:abc".into(),
                files: BTreeMap::from([(
                    "requests 2.19.1".to_string(),
                    vec![FileHash {
                        file: Some("requests-2.19.1-py2.py3-none-any.whl".into()),
                        url: None,
                        hash: "sha256:feed".into(),
                    }],
                )]),
            },
            packages: vec![
                LockedPackage {
                    name: "requests".into(),
                    version: "2.19.1".into(),
                    requires_python: ">=2.7".into(),
                    dependencies: vec!["chardet<3.1.0,>=3.0.2".into()],
                    sections: vec!["default".into()],
                    ..Default::default()
                },
                LockedPackage {
                    name: "chardet".into(),
                    version: "3.0.4".into(),
                    sections: vec!["default".into()],
                    ..Default::default()
                },
                LockedPackage {
                    name: "pytest".into(),
                    version: "7.4.0".into(),
                    sections: vec!["dev".into()],
                    ..Default::default()
                },
            ],
        }
    }

    #[tokio::test]
    async fn lookup_by_vertex_key() {
        let repo = LockedRepository::from_lockfile(&sample());
        assert_eq!(repo.len(), 3);

        let requirement = Requirement::from_str("requests>=2.0").unwrap();
        let found = repo
            .find_candidates(&requirement, &PySpecSet::allow_all(), false)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version.as_ref().unwrap().to_string(), "2.19.1");
        assert!(found[0]
            .hashes
            .contains_key("requests-2.19.1-py2.py3-none-any.whl"));

        // A pin outside the requested range is not returned.
        let requirement = Requirement::from_str("requests>=3.0").unwrap();
        let found = repo
            .find_candidates(&requirement, &PySpecSet::allow_all(), false)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn dependencies_come_from_the_document() {
        let repo = LockedRepository::from_lockfile(&sample());
        let candidate = repo.all_candidates().get("requests").cloned().unwrap();
        let deps = repo.get_dependencies(&candidate).await.unwrap();
        assert_eq!(deps.requirements.len(), 1);
        assert_eq!(
            deps.requirements[0].name.as_ref().unwrap().as_str(),
            "chardet"
        );
    }

    #[test]
    fn group_selection() {
        let repo = LockedRepository::from_lockfile(&sample());
        let default = repo.candidates_for_groups(&[GroupName::Default]);
        assert_eq!(default.len(), 2);
        let dev = repo.candidates_for_groups(&[GroupName::Dev]);
        assert_eq!(dev.len(), 1);
        assert!(dev.contains_key("pytest"));
    }
}
