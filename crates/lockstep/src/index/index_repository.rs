use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use elsa::sync::FrozenMap;
use futures::{stream, StreamExt};
use http::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL};
use http::Method;
use indexmap::IndexMap;
use pep440_rs::Version;
use rattler_digest::Sha256;
use url::Url;

use crate::build::{BuildError, VcsCheckout, WheelBuilder, WheelSource};
use crate::core::Core;
use crate::types::{
    ArtifactName, Candidate, DirectUrl, DirectUrlSource, DistMetadata, NormalizedPackageName,
    PreparedCandidate, PySpecSet, Requirement, RequirementSource, SDistFilename,
};
use crate::utils::format_sha256;

use super::file_store::FileStore;
use super::http::{CacheMode, Http, HttpError};
use super::listing::{ArtifactListing, ProjectListing};
use super::{CandidateDependencies, Repository, RepositoryError};

/// Accept header for project pages: prefer the JSON API, fall back to HTML.
const SIMPLE_API_ACCEPT: &str =
    "application/vnd.pypi.simple.v1+json, application/vnd.pypi.simple.v1+html;q=0.2, text/html;q=0.1";

/// How many index queries run concurrently while fetching listings.
const LISTING_CONCURRENCY: usize = 10;

/// A repository backed by one or more package indexes.
///
/// Candidate metadata is acquired cheapest-first: the metadata cache, then a
/// PEP 658 sidecar, then the wheel itself, and only as a last resort a
/// PEP 517 build of an sdist.
pub struct IndexRepository {
    core: Core,
    http: Http,
    metadata_cache: FileStore,
    hashes_cache: FileStore,
    builder: Arc<WheelBuilder>,
    vcs: Option<Arc<dyn VcsCheckout>>,
    listings: FrozenMap<NormalizedPackageName, Box<ProjectListing>>,
}

impl IndexRepository {
    /// Creates a repository using the context's indexes and cache layout.
    pub fn new(core: &Core, builder: Arc<WheelBuilder>) -> std::io::Result<Self> {
        Ok(IndexRepository {
            http: Http::new(
                core.client().clone(),
                FileStore::new(&core.http_cache_dir())?,
            ),
            metadata_cache: FileStore::new(&core.metadata_cache_dir())?,
            hashes_cache: FileStore::new(&core.hashes_cache_dir())?,
            builder,
            vcs: None,
            listings: FrozenMap::new(),
            core: core.clone(),
        })
    }

    /// Installs the VCS collaborator used to materialize checkouts for VCS
    /// requirements. Without one, VCS candidates fail to prepare.
    pub fn with_vcs(mut self, vcs: Arc<dyn VcsCheckout>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Fetches and merges the project pages of all configured indexes.
    async fn project_listing(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<&ProjectListing, RepositoryError> {
        if let Some(cached) = self.listings.get(name) {
            return Ok(cached);
        }
        tracing::info!("collecting artifacts of {name}");

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(SIMPLE_API_ACCEPT));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let urls: Vec<Url> = self
            .core
            .index_urls()
            .iter()
            .filter_map(|index| index.join(&format!("{}/", name.as_str())).ok())
            .collect();
        let mut pages = stream::iter(urls)
            .map(|url| {
                let http = self.http.clone();
                let headers = headers.clone();
                async move {
                    let response = http
                        .request(url.clone(), Method::GET, headers, CacheMode::Default)
                        .await?;
                    if response.status == http::StatusCode::NOT_FOUND {
                        return Ok::<_, RepositoryError>(None);
                    }
                    let listing = ProjectListing::parse(
                        &response.final_url,
                        response.content_type(),
                        &response.body,
                    )
                    .map_err(|e| RepositoryError::Other(e.to_string()))?;
                    Ok(Some(listing))
                }
            })
            .buffer_unordered(LISTING_CONCURRENCY);

        let mut merged = ProjectListing::default();
        while let Some(page) = pages.next().await {
            if let Some(listing) = page? {
                merged.artifacts.extend(listing.artifacts);
            }
        }
        // A consistent order keeps resolution output stable across runs.
        merged
            .artifacts
            .sort_by(|a, b| a.filename.to_string().cmp(&b.filename.to_string()));

        Ok(self.listings.insert(name.clone(), Box::new(merged)))
    }

    /// Groups a listing's usable artifacts by version, with wheels ahead of
    /// sdists and more specific wheels ahead of universal ones.
    fn artifacts_by_version<'a>(
        listing: &'a ProjectListing,
        name: &NormalizedPackageName,
    ) -> IndexMap<Version, Vec<&'a ArtifactListing>> {
        let mut by_version: IndexMap<Version, Vec<&ArtifactListing>> = IndexMap::new();
        for artifact in &listing.artifacts {
            if &NormalizedPackageName::from(artifact.filename.distribution().clone()) != name {
                continue;
            }
            if let Some(sdist) = artifact.filename.as_sdist() {
                if !sdist.format.is_supported() {
                    continue;
                }
            }
            by_version
                .entry(artifact.filename.version().clone())
                .or_default()
                .push(artifact);
        }
        for artifacts in by_version.values_mut() {
            artifacts.sort_by_key(|artifact| {
                let wheel_rank = match artifact.filename.as_wheel() {
                    // Within a version wheels come first, most specific first.
                    Some(wheel) => 3 - wheel.specificity().min(3),
                    None => 8,
                };
                (wheel_rank, artifact.filename.to_string())
            });
        }
        by_version.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        by_version
    }

    async fn find_named_candidates(
        &self,
        requirement: &Requirement,
        requires_python: &PySpecSet,
        allow_prereleases: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        let name: NormalizedPackageName = requirement
            .name
            .clone()
            .expect("named requirements always carry a name")
            .into();
        let specifier = requirement
            .specifier()
            .cloned()
            .unwrap_or_else(|| pep440_rs::VersionSpecifiers::from_iter([]));
        let listing = self.project_listing(&name).await?;
        let by_version = Self::artifacts_by_version(listing, &name);

        // An exact `==` pin may select a prerelease or a yanked file.
        let allow_prereleases = allow_prereleases || specifier_has_prerelease(&specifier);

        let mut candidates = Vec::new();
        for (version, artifacts) in by_version.iter() {
            if !specifier.contains(version) {
                continue;
            }
            if !allow_prereleases && (version.pre.is_some() || version.dev.is_some()) {
                continue;
            }
            let pinned_exactly = pins_exactly(&specifier, version);

            let usable: Vec<&&ArtifactListing> = artifacts
                .iter()
                .filter(|artifact| !artifact.yanked.yanked || pinned_exactly)
                .filter(|artifact| {
                    artifact
                        .requires_python
                        .as_ref()
                        .map(|spec| !spec.intersect(requires_python).is_impossible())
                        .unwrap_or(true)
                })
                .collect();
            let Some(best) = usable.first() else {
                continue;
            };

            let mut candidate = Candidate::new(requirement.clone())
                .with_version(version.clone())
                .with_link(best.url.clone());
            candidate.requires_python = best
                .requires_python
                .clone()
                .unwrap_or_else(PySpecSet::allow_all);
            for artifact in &usable {
                if let Some(sha256) = &artifact.sha256 {
                    candidate
                        .hashes
                        .insert(artifact.filename.to_string(), format!("sha256:{sha256}"));
                }
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    /// Looks up the listing rows of the version a candidate was pinned to.
    async fn pinned_artifacts(
        &self,
        candidate: &Candidate,
    ) -> Result<Vec<ArtifactListing>, RepositoryError> {
        let Some(name) = candidate.name.clone() else {
            return Ok(Vec::new());
        };
        let Some(version) = candidate.version.clone() else {
            return Ok(Vec::new());
        };
        let name: NormalizedPackageName = name.into();
        let listing = self.project_listing(&name).await?;
        let by_version = Self::artifacts_by_version(listing, &name);
        Ok(by_version
            .get(&version)
            .map(|artifacts| artifacts.iter().map(|a| (*a).clone()).collect())
            .unwrap_or_default())
    }

    fn metadata_cache_key(name: &NormalizedPackageName, version: &Version) -> PathBuf {
        PathBuf::from(name.as_str()).join(format!("{version}.json"))
    }

    fn cached_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
    ) -> Option<DistMetadata> {
        let mut file = self
            .metadata_cache
            .get(&Self::metadata_cache_key(name, version))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn store_metadata(&self, metadata: &DistMetadata) {
        let key =
            Self::metadata_cache_key(&metadata.name.clone().into(), &metadata.version);
        let encoded = match serde_json::to_vec(metadata) {
            Ok(encoded) => encoded,
            Err(_) => return,
        };
        // Concurrent writers produce identical content, last writer wins.
        if let Err(e) = self
            .metadata_cache
            .get_or_set(&key, |writer| writer.write_all(&encoded))
        {
            tracing::debug!("failed to cache metadata: {e}");
        }
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, RepositoryError> {
        let response = self
            .http
            .request(
                url.clone(),
                Method::GET,
                HeaderMap::new(),
                CacheMode::Default,
            )
            .await?;
        if !response.status.is_success() {
            return Err(RepositoryError::Http(HttpError::Status(
                url.clone(),
                response.status,
            )));
        }
        Ok(response.body)
    }

    /// Fetches metadata for a pinned index candidate, trying artifacts
    /// cheapest-first. Failures of individual artifacts are logged and the
    /// next artifact is tried.
    async fn fetch_index_metadata(
        &self,
        candidate: &Candidate,
        artifacts: &[ArtifactListing],
    ) -> Result<DistMetadata, RepositoryError> {
        // Wheels first: their metadata is an open-and-read.
        for artifact in artifacts.iter().filter(|a| a.filename.is_wheel()) {
            if artifact.metadata_available {
                match self.fetch_pep658_metadata(artifact).await {
                    Ok(metadata) => return Ok(metadata),
                    Err(e) => {
                        tracing::warn!(
                            "failed to fetch metadata sidecar of {}: {e}",
                            artifact.filename
                        );
                    }
                }
            }
            match self.fetch_wheel_metadata(artifact).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    tracing::warn!("failed to read metadata of {}: {e}", artifact.filename);
                }
            }
        }

        // No luck with wheels, build sdists.
        for artifact in artifacts.iter().filter(|a| !a.filename.is_wheel()) {
            match self.fetch_sdist_metadata(artifact).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    tracing::warn!("failed to extract metadata of {}: {e}", artifact.filename);
                }
            }
        }

        Err(RepositoryError::CandidateInfoNotFound(candidate.key()))
    }

    async fn fetch_pep658_metadata(
        &self,
        artifact: &ArtifactListing,
    ) -> Result<DistMetadata, RepositoryError> {
        let mut url = artifact.url.clone();
        let sidecar_path = format!("{}.metadata", url.path());
        url.set_path(&sidecar_path);
        let body = self.download(&url).await?;
        let metadata = DistMetadata::try_from(body.as_slice())
            .map_err(|e| RepositoryError::Other(e.to_string()))?;
        self.store_metadata(&metadata);
        Ok(metadata)
    }

    async fn fetch_wheel_metadata(
        &self,
        artifact: &ArtifactListing,
    ) -> Result<DistMetadata, RepositoryError> {
        let body = self.download(&artifact.url).await?;
        let name = artifact
            .filename
            .as_wheel()
            .expect("caller filtered for wheels");
        let raw = wheel_metadata_bytes(&body, &name.distribution.clone().into())?;
        let metadata = DistMetadata::try_from(raw.as_slice())
            .map_err(|e| RepositoryError::Other(e.to_string()))?;
        self.store_metadata(&metadata);
        Ok(metadata)
    }

    async fn fetch_sdist_metadata(
        &self,
        artifact: &ArtifactListing,
    ) -> Result<DistMetadata, RepositoryError> {
        let filename = artifact
            .filename
            .as_sdist()
            .expect("caller filtered for sdists")
            .clone();
        let body = self.download(&artifact.url).await?;
        let source = self.materialize_sdist(&filename, &body)?;
        let metadata = self
            .builder
            .get_sdist_metadata(&source)
            .await
            .map_err(|e| build_error(&artifact.filename.to_string(), e))?;
        self.store_metadata(&metadata);
        Ok(metadata)
    }

    /// Writes downloaded sdist bytes to a scratch location the builder can
    /// unpack from.
    fn materialize_sdist(
        &self,
        filename: &SDistFilename,
        body: &[u8],
    ) -> Result<WheelSource, RepositoryError> {
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(body);
        let hex = data_encoding::HEXLOWER.encode(digest.as_slice());
        let dir = self
            .core
            .cache_dir()
            .join("sdists")
            .join(&hex[..2])
            .join(&hex[2..]);
        fs_err::create_dir_all(&dir)?;
        let path = dir.join(filename.to_string());
        if !path.exists() {
            crate::utils::atomic_replace(&path, body)?;
        }
        Ok(WheelSource::Archive {
            filename: filename.clone(),
            path,
        })
    }

    /// Prepares a direct (url/path/vcs) candidate: fetch or check out the
    /// source, obtain metadata, and remember provenance for `direct_url.json`.
    async fn prepare_direct(
        &self,
        candidate: &Candidate,
    ) -> Result<Arc<PreparedCandidate>, RepositoryError> {
        let builder = self.builder.clone();
        candidate
            .prepare_with(|| async move {
                match &candidate.req.source {
                    RequirementSource::Url { url } => {
                        let body = self.download(url).await?;
                        let digest = rattler_digest::compute_bytes_digest::<Sha256>(&body);
                        let sha256 = data_encoding::HEXLOWER.encode(digest.as_slice());
                        if url.path().ends_with(".whl") {
                            let file_name = url
                                .path_segments()
                                .and_then(|segments| segments.last())
                                .ok_or_else(|| {
                                    RepositoryError::Other(format!(
                                        "url {url} does not name a wheel file"
                                    ))
                                })?;
                            let wheel_name: crate::types::WheelFilename = file_name
                                .parse()
                                .map_err(|e| RepositoryError::Other(format!("{e}")))?;
                            let name: NormalizedPackageName =
                                wheel_name.distribution.clone().into();
                            let raw = wheel_metadata_bytes(&body, &name)?;
                            let metadata = DistMetadata::try_from(raw.as_slice())
                                .map_err(|e| RepositoryError::Other(e.to_string()))?;
                            let wheel = self.persist_wheel(&wheel_name.to_string(), &body)?;
                            Ok(PreparedCandidate {
                                metadata,
                                wheel: Some(wheel),
                                direct_url: Some(DirectUrl::for_archive(
                                    url.clone(),
                                    Some(sha256),
                                )),
                            })
                        } else {
                            let file_name = url
                                .path_segments()
                                .and_then(|segments| segments.last())
                                .unwrap_or("unnamed-0.0.0.tar.gz");
                            let filename = SDistFilename::from_str(file_name)
                                .map_err(|e| RepositoryError::Other(e.to_string()))?;
                            let source = self.materialize_sdist(&filename, &body)?;
                            let metadata = builder
                                .get_sdist_metadata(&source)
                                .await
                                .map_err(|e| build_error(&candidate.key(), e))?;
                            Ok(PreparedCandidate {
                                metadata,
                                wheel: None,
                                direct_url: Some(DirectUrl::for_archive(
                                    url.clone(),
                                    Some(sha256),
                                )),
                            })
                        }
                    }
                    RequirementSource::Path { path, editable } => {
                        let source = if path.is_dir() {
                            WheelSource::Tree { path: path.clone() }
                        } else {
                            let file_name = path
                                .file_name()
                                .and_then(|name| name.to_str())
                                .unwrap_or_default();
                            WheelSource::Archive {
                                filename: SDistFilename::from_str(file_name)
                                    .map_err(|e| RepositoryError::Other(e.to_string()))?,
                                path: path.clone(),
                            }
                        };
                        let metadata = builder
                            .get_sdist_metadata(&source)
                            .await
                            .map_err(|e| build_error(&candidate.key(), e))?;
                        let url = Url::from_file_path(
                            dunce::canonicalize(path).unwrap_or_else(|_| path.clone()),
                        )
                        .map_err(|_| {
                            RepositoryError::Other(format!(
                                "cannot express {} as a file url",
                                path.display()
                            ))
                        })?;
                        Ok(PreparedCandidate {
                            metadata,
                            wheel: None,
                            direct_url: Some(DirectUrl::for_directory(url, *editable)),
                        })
                    }
                    RequirementSource::Vcs {
                        kind,
                        url,
                        revision,
                        ..
                    } => {
                        let vcs = self.vcs.clone().ok_or_else(|| {
                            RepositoryError::Other(
                                "no VCS backend configured for this repository".into(),
                            )
                        })?;
                        let (checkout, commit) = vcs
                            .checkout(*kind, url, revision.as_deref())
                            .map_err(RepositoryError::Io)?;
                        let metadata = builder
                            .get_sdist_metadata(&WheelSource::Tree { path: checkout })
                            .await
                            .map_err(|e| build_error(&candidate.key(), e))?;
                        Ok(PreparedCandidate {
                            metadata,
                            wheel: None,
                            direct_url: Some(DirectUrl {
                                url: url.clone(),
                                source: DirectUrlSource::Vcs {
                                    vcs: *kind,
                                    requested_revision: revision.clone(),
                                    commit_id: commit,
                                },
                            }),
                        })
                    }
                    RequirementSource::Named { .. } => unreachable!("named candidates are prepared from the index"),
                }
            })
            .await
    }

    /// Stores wheel bytes in the content-addressed wheel cache and returns
    /// the on-disk path.
    fn persist_wheel(&self, filename: &str, body: &[u8]) -> Result<PathBuf, RepositoryError> {
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(body);
        let hex = data_encoding::HEXLOWER.encode(digest.as_slice());
        let dir = self
            .core
            .wheels_cache_dir()
            .join(&hex[..2])
            .join(&hex[2..]);
        fs_err::create_dir_all(&dir)?;
        let path = dir.join(filename);
        if !path.exists() {
            crate::utils::atomic_replace(&path, body)?;
        }
        Ok(path)
    }

    /// Produces an installable wheel for a resolved candidate: the matching
    /// wheel from the index, a wheel built from the best sdist, or the wheel
    /// prepared for a direct candidate.
    pub async fn fetch_wheel(&self, candidate: &Candidate) -> Result<PathBuf, RepositoryError> {
        if !candidate.is_from_index() {
            let prepared = self.prepare_direct(candidate).await?;
            if let Some(wheel) = &prepared.wheel {
                return Ok(wheel.clone());
            }
            // Prepared without a wheel; build one from the recorded source.
            let source = match &candidate.req.source {
                RequirementSource::Path { path, .. } if path.is_dir() => {
                    WheelSource::Tree { path: path.clone() }
                }
                RequirementSource::Path { path, .. } => {
                    let file_name = path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .unwrap_or_default();
                    WheelSource::Archive {
                        filename: SDistFilename::from_str(file_name)
                            .map_err(|e| RepositoryError::Other(e.to_string()))?,
                        path: path.clone(),
                    }
                }
                RequirementSource::Url { url } => {
                    let body = self.download(url).await?;
                    let file_name = url
                        .path_segments()
                        .and_then(|segments| segments.last())
                        .unwrap_or_default();
                    let filename = SDistFilename::from_str(file_name)
                        .map_err(|e| RepositoryError::Other(e.to_string()))?;
                    self.materialize_sdist(&filename, &body)?
                }
                RequirementSource::Vcs {
                    kind,
                    url,
                    revision,
                    ..
                } => {
                    let vcs = self.vcs.clone().ok_or_else(|| {
                        RepositoryError::Other(
                            "no VCS backend configured for this repository".into(),
                        )
                    })?;
                    let (checkout, _commit) = vcs
                        .checkout(*kind, url, revision.as_deref())
                        .map_err(RepositoryError::Io)?;
                    WheelSource::Tree { path: checkout }
                }
                RequirementSource::Named { .. } => {
                    unreachable!("index candidates take the branch below")
                }
            };
            let wheel = self
                .builder
                .build_wheel(&source)
                .await
                .map_err(|e| build_error(&candidate.key(), e))?;
            return Ok(wheel);
        }

        let artifacts = self.pinned_artifacts(candidate).await?;
        if let Some(wheel) = artifacts.iter().find(|a| a.filename.is_wheel()) {
            let body = self.download(&wheel.url).await?;
            return self.persist_wheel(&wheel.filename.to_string(), &body);
        }
        if let Some(sdist) = artifacts.iter().find(|a| !a.filename.is_wheel()) {
            let filename = sdist
                .filename
                .as_sdist()
                .expect("non-wheel artifacts are sdists")
                .clone();
            let body = self.download(&sdist.url).await?;
            let source = self.materialize_sdist(&filename, &body)?;
            return self
                .builder
                .build_wheel(&source)
                .await
                .map_err(|e| build_error(&sdist.filename.to_string(), e));
        }
        Err(RepositoryError::Other(format!(
            "no artifacts available for {}",
            candidate.key()
        )))
    }
}

#[async_trait]
impl Repository for IndexRepository {
    async fn find_candidates(
        &self,
        requirement: &Requirement,
        requires_python: &PySpecSet,
        allow_prereleases: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        match &requirement.source {
            RequirementSource::Named { .. } => {
                self.find_named_candidates(requirement, requires_python, allow_prereleases)
                    .await
            }
            RequirementSource::Url { url } => Ok(vec![
                Candidate::new(requirement.clone()).with_link(url.clone())
            ]),
            RequirementSource::Path { .. } | RequirementSource::Vcs { .. } => {
                Ok(vec![Candidate::new(requirement.clone())])
            }
        }
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateDependencies, RepositoryError> {
        let metadata = if candidate.is_from_index() {
            let name: NormalizedPackageName = candidate
                .name
                .clone()
                .expect("index candidates are always named")
                .into();
            let version = candidate
                .version
                .clone()
                .expect("index candidates are always pinned to a version");
            if let Some(metadata) = self.cached_metadata(&name, &version) {
                metadata
            } else {
                let artifacts = self.pinned_artifacts(candidate).await?;
                if artifacts.is_empty() {
                    return Err(RepositoryError::CandidateInfoNotFound(candidate.key()));
                }
                self.fetch_index_metadata(candidate, &artifacts).await?
            }
        } else {
            self.prepare_direct(candidate).await?.metadata.clone()
        };

        Ok(CandidateDependencies {
            requirements: metadata.requires_dist.clone(),
            requires_python: metadata.requires_python.clone(),
            summary: metadata.summary.clone(),
        })
    }

    async fn get_hashes(
        &self,
        candidate: &Candidate,
    ) -> Result<BTreeMap<String, String>, RepositoryError> {
        let mut hashes = candidate.hashes.clone();
        if candidate.is_from_index() {
            for artifact in self.pinned_artifacts(candidate).await? {
                let key = artifact.filename.to_string();
                if hashes.contains_key(&key) {
                    continue;
                }
                let value = match &artifact.sha256 {
                    Some(sha256) => format!("sha256:{sha256}"),
                    None => self.hash_link(&artifact.url).await?,
                };
                hashes.insert(key, value);
            }
        } else if let Some(link) = &candidate.link {
            hashes.insert(link.to_string(), self.hash_link(link).await?);
        }
        Ok(hashes)
    }
}

impl IndexRepository {
    /// Computes (and caches) the sha256 of the artifact behind a link, so a
    /// re-resolve does not re-download files just to hash them.
    async fn hash_link(&self, url: &Url) -> Result<String, RepositoryError> {
        let key = FileStore::key_for_bytes(url.as_str().as_bytes());
        if let Some(mut cached) = self.hashes_cache.get(&key) {
            let mut value = String::new();
            if cached.read_to_string(&mut value).is_ok() && !value.is_empty() {
                return Ok(value);
            }
        }
        let body = self.download(url).await?;
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(&body);
        let value = format_sha256(digest.as_slice());
        let stored = value.clone();
        self.hashes_cache
            .get_or_set(&key, move |writer| writer.write_all(stored.as_bytes()))?;
        Ok(value)
    }
}

/// Reads the `*.dist-info/METADATA` document out of wheel bytes.
fn wheel_metadata_bytes(
    body: &[u8],
    distribution: &NormalizedPackageName,
) -> Result<Vec<u8>, RepositoryError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(body))
        .map_err(|e| RepositoryError::Other(format!("invalid wheel archive: {e}")))?;
    let metadata_path = archive
        .file_names()
        .filter_map(|path| {
            let (dist_info, rest) = path.split_once('/')?;
            (rest == "METADATA").then_some(dist_info)?;
            let stem = dist_info.strip_suffix(".dist-info")?;
            let (name, _version) = stem.split_once('-')?;
            NormalizedPackageName::from_str(name)
                .ok()
                .filter(|parsed| parsed == distribution)
                .map(|_| path.to_string())
        })
        .next()
        .ok_or_else(|| {
            RepositoryError::Other(format!("wheel has no METADATA for {distribution}"))
        })?;
    let mut raw = Vec::new();
    archive
        .by_name(&metadata_path)
        .map_err(|e| RepositoryError::Other(e.to_string()))?
        .read_to_end(&mut raw)?;
    Ok(raw)
}

fn build_error(candidate: &str, error: BuildError) -> RepositoryError {
    RepositoryError::CandidateBuild {
        candidate: candidate.to_string(),
        message: error.to_string(),
    }
}

/// Whether any clause of the specifier names a prerelease, which opts the
/// requirement into prerelease candidates.
fn specifier_has_prerelease(specifier: &pep440_rs::VersionSpecifiers) -> bool {
    specifier
        .iter()
        .any(|spec| spec.version().pre.is_some() || spec.version().dev.is_some())
}

/// Whether the specifier pins this exact version with `==`/`===`, which is
/// the only way to select a yanked file.
fn pins_exactly(specifier: &pep440_rs::VersionSpecifiers, version: &Version) -> bool {
    let mut clauses = specifier.iter();
    let (Some(clause), None) = (clauses.next(), clauses.next()) else {
        return false;
    };
    matches!(
        clause.operator(),
        pep440_rs::Operator::Equal | pep440_rs::Operator::ExactEqual
    ) && clause.version() == version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pin_detection() {
        let version = Version::from_str("1.2.3").unwrap();
        let eq: pep440_rs::VersionSpecifiers = "==1.2.3".parse().unwrap();
        assert!(pins_exactly(&eq, &version));

        let range: pep440_rs::VersionSpecifiers = ">=1.0".parse().unwrap();
        assert!(!pins_exactly(&range, &version));

        let multi: pep440_rs::VersionSpecifiers = "==1.2.3,!=1.2.2".parse().unwrap();
        assert!(!pins_exactly(&multi, &version));
    }

    #[test]
    fn prerelease_specifiers_opt_in() {
        let pre: pep440_rs::VersionSpecifiers = "==1.0.0rc1".parse().unwrap();
        assert!(specifier_has_prerelease(&pre));
        let stable: pep440_rs::VersionSpecifiers = ">=1.0".parse().unwrap();
        assert!(!specifier_has_prerelease(&stable));
    }
}
