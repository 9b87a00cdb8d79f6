//! Turning source distributions and source trees into wheels and metadata.
//!
//! The PEP 517 hook execution itself is a collaborator hidden behind
//! [`BuildBackend`]: the engine hands it a source directory, an output
//! directory and the build requirements, and gets back a wheel path or a
//! structured error. [`WheelBuilder`] wraps that boundary with unpacking,
//! the PEP 643 `PKG-INFO` fast path and the content-addressed wheel cache.

mod backend;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use miette::Diagnostic;
use rattler_digest::Sha256;
use thiserror::Error;
use url::Url;

use crate::core::Core;
use crate::types::{DistMetadata, Requirement, SDistFilename, SDistFormat, VcsKind};

pub use backend::{BuildBackend, BuildBackendError, Pep517Backend};

/// The source a wheel can be built from: a source archive or an unpacked
/// source tree (local directory or VCS checkout).
#[derive(Debug, Clone)]
pub enum WheelSource {
    /// An sdist archive on disk.
    Archive {
        /// The parsed sdist filename.
        filename: SDistFilename,
        /// Location of the archive.
        path: PathBuf,
    },
    /// A source tree on disk.
    Tree {
        /// Root of the tree.
        path: PathBuf,
    },
}

/// Collaborator that materializes VCS checkouts. Clone mechanics live outside
/// the engine; the engine only consumes the resulting tree and commit id.
pub trait VcsCheckout: Send + Sync {
    /// Checks out `url` at `revision` (or the default branch) and returns the
    /// tree location plus the resolved commit id.
    fn checkout(
        &self,
        kind: VcsKind,
        url: &Url,
        revision: Option<&str>,
    ) -> std::io::Result<(PathBuf, String)>;
}

/// Error raised while obtaining a wheel or metadata from a source.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to unpack {0}: {1}")]
    Unpack(String, String),

    #[error("source tree at {0} has no pyproject.toml or setup.py")]
    NotAProject(PathBuf),

    #[error(transparent)]
    Backend(#[from] BuildBackendError),

    #[error("built wheel has invalid metadata: {0}")]
    InvalidMetadata(String),
}

/// Builds wheels out of sdists and source trees, caching the results under
/// `cache/wheels/<sha[:2]>/<sha>/<wheelname>`.
pub struct WheelBuilder {
    backend: Arc<dyn BuildBackend>,
    wheels_dir: PathBuf,
}

impl WheelBuilder {
    /// Creates a builder using the context's wheel cache and the given hook
    /// runner.
    pub fn new(core: &Core, backend: Arc<dyn BuildBackend>) -> Self {
        WheelBuilder {
            backend,
            wheels_dir: core.wheels_cache_dir(),
        }
    }

    /// Obtains distribution metadata for a source, avoiding a build when the
    /// sdist carries reliable PEP 643 metadata.
    pub async fn get_sdist_metadata(&self, source: &WheelSource) -> Result<DistMetadata, BuildError> {
        let staged = self.stage(source)?;

        // PKG-INFO at the tree root is authoritative for metadata 2.2+.
        let pkg_info = staged.source_dir().join("PKG-INFO");
        if let Ok(raw) = fs_err::read(&pkg_info) {
            if let Ok(metadata) = DistMetadata::try_from(raw.as_slice()) {
                if metadata.is_reliable() {
                    tracing::debug!(
                        "using PKG-INFO of {} without building",
                        metadata.name.as_str()
                    );
                    return Ok(metadata);
                }
            }
        }

        let wheel = self.build_staged(&staged).await?;
        read_wheel_metadata(&wheel)
    }

    /// Builds (or reuses a cached) wheel for a source and returns its path.
    pub async fn build_wheel(&self, source: &WheelSource) -> Result<PathBuf, BuildError> {
        let staged = self.stage(source)?;
        self.build_staged(&staged).await
    }

    async fn build_staged(&self, staged: &StagedSource) -> Result<PathBuf, BuildError> {
        if let Some(cache_dir) = staged.cache_dir(&self.wheels_dir) {
            if let Some(wheel) = find_cached_wheel(&cache_dir) {
                tracing::debug!("reusing cached wheel {}", wheel.display());
                return Ok(wheel);
            }
        }

        let source_dir = staged.source_dir();
        let (requires, backend_name) = read_build_system(source_dir)?;
        tracing::info!("building wheel from {}", source_dir.display());

        let output = tempfile::tempdir()?;
        let wheel = self
            .backend
            .build_wheel(source_dir, output.path(), &backend_name, &requires)
            .await?;

        // Move the result into the cache so the next resolve skips the build.
        let destination_dir = match staged.cache_dir(&self.wheels_dir) {
            Some(cache_dir) => cache_dir,
            None => self.wheels_dir.join("local"),
        };
        fs_err::create_dir_all(&destination_dir)?;
        let file_name = wheel
            .file_name()
            .ok_or_else(|| BuildError::InvalidMetadata("backend returned no wheel".into()))?;
        let destination = destination_dir.join(file_name);
        let bytes = fs_err::read(&wheel)?;
        crate::utils::atomic_replace(&destination, &bytes)?;
        Ok(destination)
    }

    /// Unpacks an archive source into a scratch directory; trees are used in
    /// place.
    fn stage(&self, source: &WheelSource) -> Result<StagedSource, BuildError> {
        match source {
            WheelSource::Tree { path } => {
                if !path.join("pyproject.toml").exists() && !path.join("setup.py").exists() {
                    return Err(BuildError::NotAProject(path.clone()));
                }
                Ok(StagedSource::Tree { path: path.clone() })
            }
            WheelSource::Archive { filename, path } => {
                let bytes = fs_err::read(path)?;
                let digest = rattler_digest::compute_bytes_digest::<Sha256>(&bytes);
                let content_hash = data_encoding::HEXLOWER.encode(digest.as_slice());

                let unpack_dir = tempfile::tempdir()?;
                unpack_archive(filename.format, &bytes, unpack_dir.path())
                    .map_err(|e| BuildError::Unpack(filename.to_string(), e))?;
                let root = locate_source_root(unpack_dir.path())?;
                Ok(StagedSource::Unpacked {
                    _scratch: unpack_dir,
                    root,
                    content_hash,
                })
            }
        }
    }
}

/// A source ready for building: either a caller-owned tree or an unpacked
/// archive in a scratch directory that lives as long as this value.
enum StagedSource {
    Tree {
        path: PathBuf,
    },
    Unpacked {
        _scratch: tempfile::TempDir,
        root: PathBuf,
        content_hash: String,
    },
}

impl StagedSource {
    fn source_dir(&self) -> &Path {
        match self {
            StagedSource::Tree { path } => path,
            StagedSource::Unpacked { root, .. } => root,
        }
    }

    /// Archive builds are cached by content hash; tree builds are not (the
    /// tree may change at any time).
    fn cache_dir(&self, wheels_dir: &Path) -> Option<PathBuf> {
        match self {
            StagedSource::Tree { .. } => None,
            StagedSource::Unpacked { content_hash, .. } => {
                Some(wheels_dir.join(&content_hash[..2]).join(&content_hash[2..]))
            }
        }
    }
}

fn find_cached_wheel(dir: &Path) -> Option<PathBuf> {
    let entries = dir.read_dir().ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "whl") {
            return Some(path);
        }
    }
    None
}

/// Reads `[build-system]` out of the source's pyproject.toml, defaulting to
/// the legacy setuptools backend when the table (or the whole file) is
/// missing.
fn read_build_system(source_dir: &Path) -> Result<(Vec<Requirement>, String), BuildError> {
    const DEFAULT_BACKEND: &str = "setuptools.build_meta:__legacy__";

    let default_requires = || -> Vec<Requirement> {
        ["setuptools", "wheel"]
            .iter()
            .map(|name| Requirement::from_str(name).expect("static requirement"))
            .collect()
    };

    let path = source_dir.join("pyproject.toml");
    let raw = match fs_err::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => return Ok((default_requires(), DEFAULT_BACKEND.to_string())),
    };
    let parsed: pyproject_toml::PyProjectToml = toml::from_str(&raw)
        .map_err(|e| BuildError::InvalidMetadata(format!("invalid pyproject.toml: {e}")))?;

    let Some(build_system) = parsed.build_system else {
        return Ok((default_requires(), DEFAULT_BACKEND.to_string()));
    };
    let requires = if build_system.requires.is_empty() {
        default_requires()
    } else {
        build_system
            .requires
            .into_iter()
            .filter_map(|requirement| match Requirement::from_pep508(requirement) {
                Ok(requirement) => Some(requirement),
                Err(e) => {
                    tracing::warn!("ignoring unparsable build requirement: {e}");
                    None
                }
            })
            .collect()
    };
    let backend = build_system
        .build_backend
        .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
    Ok((requires, backend))
}

fn unpack_archive(format: SDistFormat, bytes: &[u8], dest: &Path) -> Result<(), String> {
    match format {
        SDistFormat::TarGz => {
            let decoder = flate2::read::GzDecoder::new(bytes);
            tar::Archive::new(decoder)
                .unpack(dest)
                .map_err(|e| e.to_string())
        }
        SDistFormat::Tar => tar::Archive::new(bytes).unpack(dest).map_err(|e| e.to_string()),
        SDistFormat::Zip => zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .and_then(|mut archive| archive.extract(dest))
            .map_err(|e| e.to_string()),
        SDistFormat::TarBz2 => Err("bzip2 sdists are not supported".to_string()),
    }
}

/// Sdists unpack to a single `name-version/` directory; tolerate archives
/// that unpack flat.
fn locate_source_root(unpack_dir: &Path) -> Result<PathBuf, BuildError> {
    let entries: Vec<_> = fs_err::read_dir(unpack_dir)?
        .filter_map(|entry| entry.ok())
        .collect();
    if entries.len() == 1 && entries[0].path().is_dir() {
        return Ok(entries[0].path());
    }
    Ok(unpack_dir.to_path_buf())
}

/// Opens a built wheel and parses its METADATA document.
fn read_wheel_metadata(wheel: &Path) -> Result<DistMetadata, BuildError> {
    let file = fs_err::File::open(wheel)?;
    let mut archive = zip::ZipArchive::new(file.into_parts().0)
        .map_err(|e| BuildError::InvalidMetadata(e.to_string()))?;
    let metadata_path = archive
        .file_names()
        .find(|path| {
            path.ends_with(".dist-info/METADATA") && path.matches('/').count() == 1
        })
        .map(str::to_string)
        .ok_or_else(|| BuildError::InvalidMetadata("wheel has no METADATA".into()))?;
    let mut raw = Vec::new();
    use std::io::Read;
    archive
        .by_name(&metadata_path)
        .map_err(|e| BuildError::InvalidMetadata(e.to_string()))?
        .read_to_end(&mut raw)?;
    DistMetadata::try_from(raw.as_slice()).map_err(|e| BuildError::InvalidMetadata(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_sdist(dir: &Path, metadata_version: &str) -> PathBuf {
        let pkg_info = format!(
            "Metadata-Version: {metadata_version}\nName: demo\nVersion: 1.2.0\nRequires-Dist: click\nRequires-Python: >=3.8\n"
        );
        let archive_path = dir.join("demo-1.2.0.tar.gz");
        let file = fs_err::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut tar = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(pkg_info.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "demo-1.2.0/PKG-INFO", pkg_info.as_bytes())
            .unwrap();

        let pyproject = b"[build-system]\nrequires = [\"setuptools\"]\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(pyproject.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(
            &mut header,
            "demo-1.2.0/pyproject.toml",
            pyproject.as_slice(),
        )
        .unwrap();

        tar.into_inner().unwrap().finish().unwrap().flush().unwrap();
        archive_path
    }

    struct PanicBackend;

    #[async_trait::async_trait]
    impl BuildBackend for PanicBackend {
        async fn build_wheel(
            &self,
            _source_dir: &Path,
            _output_dir: &Path,
            _backend: &str,
            _requires: &[Requirement],
        ) -> Result<PathBuf, BuildBackendError> {
            panic!("reliable PKG-INFO must not trigger a build");
        }
    }

    #[tokio::test]
    async fn pep643_metadata_avoids_the_build() {
        let scratch = tempfile::tempdir().unwrap();
        let sdist = make_sdist(scratch.path(), "2.2");
        let core = Core::new(scratch.path().join("cache"), Default::default());
        let builder = WheelBuilder::new(&core, Arc::new(PanicBackend));

        let filename: SDistFilename = "demo-1.2.0.tar.gz".parse().unwrap();
        let metadata = builder
            .get_sdist_metadata(&WheelSource::Archive {
                filename,
                path: sdist,
            })
            .await
            .unwrap();
        assert_eq!(metadata.name.as_str(), "demo");
        assert_eq!(metadata.requires_python.to_string(), ">=3.8");
        assert_eq!(metadata.requires_dist.len(), 1);
    }

    #[test]
    fn build_system_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (requires, backend) = read_build_system(dir.path()).unwrap();
        assert_eq!(backend, "setuptools.build_meta:__legacy__");
        assert_eq!(requires.len(), 2);
    }
}
