use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use url::Url;

use crate::types::{GroupName, PySpecSet, Requirement};
use crate::utils::normalize_index_url;

/// One configured package index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSource {
    /// The source name (`pypi` for the default index).
    pub name: String,
    /// The index url.
    pub url: String,
    /// Whether TLS certificates are verified when talking to it.
    pub verify_ssl: bool,
}

/// The parsed form of the project manifest the engine consumes. TOML parsing
/// happens in a collaborator; the engine never sees the raw document.
#[derive(Debug, Clone)]
pub struct ProjectManifest {
    /// `project.name`.
    pub name: String,
    /// `project.version`.
    pub version: String,
    /// `project.requires-python`.
    pub requires_python: PySpecSet,
    /// Declared requirements per dependency group, in declaration order.
    pub groups: BTreeMap<GroupName, Vec<Requirement>>,
    /// Configured indexes.
    pub sources: Vec<IndexSource>,
}

impl ProjectManifest {
    /// The requirements of the selected groups, each tagged with its group.
    pub fn requirements_for(&self, groups: &[GroupName]) -> Vec<Requirement> {
        groups
            .iter()
            .filter_map(|group| self.groups.get(group).map(|reqs| (group, reqs)))
            .flat_map(|(group, requirements)| {
                requirements
                    .iter()
                    .map(|requirement| requirement.clone().with_group(group.clone()))
            })
            .collect()
    }
}

/// Engine-wide configuration. All of it flows through constructors; there is
/// no process-wide mutable state.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// The package indexes to query, in priority order.
    pub index_urls: Vec<Url>,
    /// Whether prereleases may be selected without an explicit pin.
    pub allow_prereleases: bool,
    /// Whether installs from named indexes go through the shared package
    /// cache (`install.cache`).
    pub install_cache: bool,
    /// Whether cache-linked installs use symlinks; `.pth` files otherwise.
    pub cache_link_symlinks: bool,
    /// Whether install/uninstall tasks may run in parallel.
    pub parallel_install: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            index_urls: vec![Url::parse("https://pypi.org/simple/").expect("static url")],
            allow_prereleases: false,
            install_cache: false,
            cache_link_symlinks: true,
            parallel_install: true,
        }
    }
}

/// The explicit context threaded through long-lived components: the cache
/// directory layout, the shared HTTP client and configuration.
#[derive(Debug, Clone)]
pub struct Core {
    cache_dir: PathBuf,
    client: reqwest::Client,
    /// Engine configuration.
    pub config: CoreConfig,
}

impl Core {
    /// Creates a context rooted at the given cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>, config: CoreConfig) -> Self {
        Core {
            cache_dir: cache_dir.into(),
            client: reqwest::Client::new(),
            config,
        }
    }

    /// The root of all caches.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The shared HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The configured indexes, normalized to end with a slash.
    pub fn index_urls(&self) -> Vec<Url> {
        self.config
            .index_urls
            .iter()
            .cloned()
            .map(normalize_index_url)
            .collect()
    }

    /// `cache/http`: HTTP response cache.
    pub fn http_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("http")
    }

    /// `cache/metadata`: per-artifact metadata documents.
    pub fn metadata_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("metadata")
    }

    /// `cache/hashes`: artifact hashes keyed by link.
    pub fn hashes_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("hashes")
    }

    /// `cache/wheels`: wheels built from sdists.
    pub fn wheels_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("wheels")
    }

    /// `cache/packages`: the shared, content-addressed package store.
    pub fn packages_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("packages")
    }
}
