//! The target environment: its install paths, its interpreter and the
//! working set of distributions currently installed into it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use itertools::Itertools;
use miette::Diagnostic;
use pep440_rs::Version;
use thiserror::Error;

use crate::install::InstallPaths;
use crate::types::{DirectUrl, NormalizedPackageName, PackageName, Record};

/// Error raised while inspecting an environment.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum EnvironmentError {
    #[error("no python interpreter found in {0}")]
    NoPythonVersion(PathBuf),

    #[error("cannot determine the python version of {0}")]
    UnknownPythonVersion(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local package directory (usually a virtualenv) with a known interpreter.
#[derive(Debug, Clone)]
pub struct Environment {
    root: PathBuf,
    interpreter: PathBuf,
    python_version: (u64, u64),
    paths: InstallPaths,
}

impl Environment {
    /// Creates an environment from explicit parts.
    pub fn new(root: impl Into<PathBuf>, interpreter: impl Into<PathBuf>, major: u64, minor: u64) -> Self {
        let windows = cfg!(windows);
        Environment {
            root: root.into(),
            interpreter: interpreter.into(),
            python_version: (major, minor),
            paths: InstallPaths::for_venv(major, minor, windows),
        }
    }

    /// Discovers the interpreter of a virtualenv rooted at `root`, reading
    /// the version out of `pyvenv.cfg`.
    pub fn discover(root: impl Into<PathBuf>) -> Result<Self, EnvironmentError> {
        let root = root.into();
        let interpreter = ["bin/python3", "bin/python", "Scripts/python.exe"]
            .iter()
            .map(|suffix| root.join(suffix))
            .find(|path| path.exists())
            .ok_or_else(|| EnvironmentError::NoPythonVersion(root.clone()))?;

        let config = fs_err::read_to_string(root.join("pyvenv.cfg"))
            .map_err(|_| EnvironmentError::UnknownPythonVersion(root.clone()))?;
        let version_line = config
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .find(|(key, _)| *key == "version" || *key == "version_info")
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| EnvironmentError::UnknownPythonVersion(root.clone()))?;
        let mut parts = version_line.split('.').map(|part| part.parse::<u64>());
        let (Some(Ok(major)), Some(Ok(minor))) = (parts.next(), parts.next()) else {
            return Err(EnvironmentError::UnknownPythonVersion(root));
        };

        Ok(Environment::new(root, interpreter, major, minor))
    }

    /// The environment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The interpreter executable.
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Major/minor python version.
    pub fn python_version(&self) -> (u64, u64) {
        self.python_version
    }

    /// The install scheme of this environment.
    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    /// Absolute path of the site-packages directory.
    pub fn site_packages(&self) -> PathBuf {
        self.root.join(self.paths.site_packages())
    }

    /// Absolute path of the scripts directory.
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(self.paths.scripts())
    }

    /// Scans the library directories for installed distributions.
    pub fn working_set(&self) -> Result<WorkingSet, EnvironmentError> {
        let locations = [self.paths.purelib(), self.paths.platlib()]
            .into_iter()
            .unique()
            .map(|relative| self.root.join(relative))
            .filter(|path| path.is_dir());

        let mut distributions = IndexMap::new();
        for location in locations {
            for entry in fs_err::read_dir(&location)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(dist) = analyze_dist_info(&entry.path()) {
                    distributions.insert(dist.name.clone(), dist);
                }
            }
        }
        distributions.sort_keys();
        Ok(WorkingSet {
            distributions,
        })
    }
}

/// What is currently installed at the environment's library paths, keyed by
/// normalized name.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    distributions: IndexMap<NormalizedPackageName, Distribution>,
}

impl WorkingSet {
    /// Looks up a distribution by normalized name.
    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(name)
    }

    /// Whether a distribution is installed.
    pub fn contains(&self, name: &str) -> bool {
        self.distributions.contains_key(name)
    }

    /// Iterates over `(name, distribution)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&NormalizedPackageName, &Distribution)> {
        self.distributions.iter()
    }

    /// Number of installed distributions.
    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    /// Whether nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }
}

/// One installed distribution, reconstructed from its `.dist-info` directory.
#[derive(Debug, Clone)]
pub struct Distribution {
    /// Normalized distribution name.
    pub name: NormalizedPackageName,
    /// Installed version.
    pub version: Version,
    /// Absolute path of the `.dist-info` directory.
    pub dist_info: PathBuf,
    /// Content of the `INSTALLER` file, if present.
    pub installer: Option<String>,
    /// Parsed `direct_url.json`, if present.
    pub direct_url: Option<DirectUrl>,
    /// The cached package this install links into, from `REFER_TO`.
    pub refer_to: Option<PathBuf>,
}

impl Distribution {
    /// Whether this distribution was installed in editable mode.
    pub fn is_editable(&self) -> bool {
        self.direct_url
            .as_ref()
            .map(DirectUrl::is_editable)
            .unwrap_or(false)
    }

    /// Reads the installed file list. Paths in the RECORD are relative to
    /// the directory containing `.dist-info`.
    pub fn record(&self) -> csv::Result<Record> {
        Record::from_path(&self.dist_info.join("RECORD"))
    }

    /// The directory RECORD paths are relative to.
    pub fn site_packages(&self) -> &Path {
        self.dist_info
            .parent()
            .expect("a dist-info directory always has a parent")
    }
}

/// Reads one `.dist-info` directory; anything unparsable is skipped rather
/// than failing the whole scan.
fn analyze_dist_info(dist_info: &Path) -> Option<Distribution> {
    let dir_name = dist_info.file_name()?.to_str()?;
    let stem = dir_name.strip_suffix(".dist-info")?;
    let (name, version) = stem.split_once('-')?;

    // METADATA is the only mandatory file; without it this is not a
    // distribution.
    if !dist_info.join("METADATA").is_file() {
        return None;
    }

    let name = PackageName::from_str(name).ok()?;
    let version = Version::from_str(version).ok()?;

    let installer = fs_err::read_to_string(dist_info.join("INSTALLER"))
        .map(|text| text.trim().to_string())
        .ok()
        .filter(|text| !text.is_empty());

    let direct_url = fs_err::read(dist_info.join("direct_url.json"))
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok());

    let refer_to = fs_err::read_to_string(dist_info.join("REFER_TO"))
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .map(PathBuf::from);

    Some(Distribution {
        name: name.into(),
        version,
        dist_info: dist_info.to_path_buf(),
        installer,
        direct_url,
        refer_to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_dist_info(site_packages: &Path, name: &str, version: &str) -> PathBuf {
        let dist_info = site_packages.join(format!("{name}-{version}.dist-info"));
        fs_err::create_dir_all(&dist_info).unwrap();
        let mut metadata = fs_err::File::create(dist_info.join("METADATA")).unwrap();
        writeln!(metadata, "Metadata-Version: 2.1").unwrap();
        writeln!(metadata, "Name: {name}").unwrap();
        writeln!(metadata, "Version: {version}").unwrap();
        dist_info
    }

    #[test]
    fn scans_installed_distributions() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path(), dir.path().join("bin/python"), 3, 10);
        let site_packages = env.site_packages();
        fs_err::create_dir_all(&site_packages).unwrap();

        make_dist_info(&site_packages, "requests", "2.19.1");
        let dist_info = make_dist_info(&site_packages, "demo", "1.0.0");
        fs_err::write(dist_info.join("INSTALLER"), "lockstep\n").unwrap();
        fs_err::write(
            dist_info.join("direct_url.json"),
            r#"{"url": "file:///src/demo", "dir_info": {"editable": true}}"#,
        )
        .unwrap();

        // A stray directory that is not a distribution.
        fs_err::create_dir_all(site_packages.join("not-a-dist-info")).unwrap();

        let working_set = env.working_set().unwrap();
        assert_eq!(working_set.len(), 2);
        assert!(working_set.contains("requests"));

        let demo = working_set.get("demo").unwrap();
        assert!(demo.is_editable());
        assert_eq!(demo.installer.as_deref(), Some("lockstep"));
    }

    #[test]
    fn discover_requires_an_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Environment::discover(dir.path()),
            Err(EnvironmentError::NoPythonVersion(_))
        ));

        fs_err::create_dir_all(dir.path().join("bin")).unwrap();
        fs_err::write(dir.path().join("bin/python"), "").unwrap();
        fs_err::write(dir.path().join("pyvenv.cfg"), "version = 3.11.4\n").unwrap();
        let env = Environment::discover(dir.path()).unwrap();
        assert_eq!(env.python_version(), (3, 11));
    }
}
