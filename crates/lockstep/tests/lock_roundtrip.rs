//! End-to-end law: resolving a project, writing the lockfile, reloading it
//! and synchronizing from the reloaded lock installs exactly the resolved
//! candidate set.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::BASE64URL_NOPAD;
use indexmap::IndexMap;
use lockstep::index::{
    CandidateDependencies, LockedRepository, Repository, RepositoryError,
};
use lockstep::sync::{SyncOptions, Synchronizer, WheelProvider};
use lockstep::types::{Candidate, GroupName, PySpecSet, Requirement};
use lockstep::{
    resolve, Core, Environment, Lockfile, MarkerEnvironment, ProjectManifest, ResolveOptions,
};
use rattler_digest::Sha256;
use zip::write::FileOptions;

/// A tiny in-memory index.
#[derive(Default)]
struct FakeIndex {
    releases: BTreeMap<String, Vec<(String, Vec<String>)>>,
}

impl FakeIndex {
    fn with(mut self, name: &str, version: &str, dependencies: &[&str]) -> Self {
        self.releases.entry(name.to_string()).or_default().push((
            version.to_string(),
            dependencies.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }
}

#[async_trait]
impl Repository for FakeIndex {
    async fn find_candidates(
        &self,
        requirement: &Requirement,
        _requires_python: &PySpecSet,
        _allow_prereleases: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        let Some(name) = &requirement.name else {
            return Ok(Vec::new());
        };
        let Some(releases) = self.releases.get(name.as_str()) else {
            return Ok(Vec::new());
        };
        let mut candidates: Vec<Candidate> = releases
            .iter()
            .filter(|(version, _)| {
                requirement
                    .specifier()
                    .map(|spec| spec.contains(&version.parse().unwrap()))
                    .unwrap_or(true)
            })
            .map(|(version, _)| {
                Candidate::new(requirement.clone()).with_version(version.parse().unwrap())
            })
            .collect();
        candidates.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(candidates)
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateDependencies, RepositoryError> {
        let name = candidate.name.as_ref().unwrap().as_str();
        let version = candidate.version.as_ref().unwrap().to_string();
        let (_, dependencies) = self
            .releases
            .get(name)
            .into_iter()
            .flatten()
            .find(|(candidate_version, _)| *candidate_version == version)
            .ok_or_else(|| RepositoryError::CandidateInfoNotFound(candidate.key()))?;
        Ok(CandidateDependencies {
            requirements: dependencies
                .iter()
                .map(|line| Requirement::from_str(line).unwrap())
                .collect(),
            requires_python: PySpecSet::allow_all(),
            summary: Some(format!("the {name} package")),
        })
    }

    async fn get_hashes(
        &self,
        candidate: &Candidate,
    ) -> Result<BTreeMap<String, String>, RepositoryError> {
        let name = candidate.name.as_ref().unwrap().as_str();
        let version = candidate.version.as_ref().unwrap();
        Ok(BTreeMap::from([(
            format!("{}-{version}-py3-none-any.whl", name.replace('-', "_")),
            format!("sha256:{:064x}", 0xfeed_u64),
        )]))
    }
}

/// Builds minimal installable wheels on demand.
struct FakeWheels {
    dir: PathBuf,
}

fn make_wheel(dir: &Path, name: &str, version: &str) -> PathBuf {
    let path = dir.join(format!("{name}-{version}-py3-none-any.whl"));
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options: FileOptions = FileOptions::default();

    let module = format!("{name}/__init__.py");
    let body = b"# generated\n";
    writer.start_file(&module, options).unwrap();
    writer.write_all(body).unwrap();

    let dist_info = format!("{name}-{version}.dist-info");
    writer
        .start_file(format!("{dist_info}/METADATA"), options)
        .unwrap();
    writer
        .write_all(format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n").as_bytes())
        .unwrap();
    writer
        .start_file(format!("{dist_info}/WHEEL"), options)
        .unwrap();
    writer
        .write_all(b"Wheel-Version: 1.0\nRoot-Is-Purelib: true\nTag: py3-none-any\n")
        .unwrap();

    let digest = rattler_digest::compute_bytes_digest::<Sha256>(body);
    let record = format!(
        "{module},sha256={},{}\n{dist_info}/METADATA,,\n{dist_info}/WHEEL,,\n{dist_info}/RECORD,,\n",
        BASE64URL_NOPAD.encode(&digest),
        body.len(),
    );
    writer
        .start_file(format!("{dist_info}/RECORD"), options)
        .unwrap();
    writer.write_all(record.as_bytes()).unwrap();
    writer.finish().unwrap();
    path
}

#[async_trait]
impl WheelProvider for FakeWheels {
    async fn fetch_wheel(&self, candidate: &Candidate) -> Result<PathBuf, RepositoryError> {
        let name = candidate.name.as_ref().unwrap().as_str().replace('-', "_");
        let version = candidate.version.as_ref().unwrap().to_string();
        Ok(make_wheel(&self.dir, &name, &version))
    }
}

fn manifest(requirements: &[&str]) -> ProjectManifest {
    let mut groups = BTreeMap::new();
    groups.insert(
        GroupName::Default,
        requirements
            .iter()
            .map(|line| Requirement::from_str(line).unwrap())
            .collect(),
    );
    ProjectManifest {
        name: "demo-project".into(),
        version: "0.1.0".into(),
        requires_python: ">=3.8".parse().unwrap(),
        groups,
        sources: Vec::new(),
    }
}

fn env_markers() -> MarkerEnvironment {
    MarkerEnvironment {
        implementation_name: "cpython".to_string(),
        implementation_version: "3.11.2".parse().unwrap(),
        os_name: "posix".to_string(),
        platform_machine: "x86_64".to_string(),
        platform_python_implementation: "CPython".to_string(),
        platform_release: "6.1".to_string(),
        platform_system: "Linux".to_string(),
        platform_version: "#1 SMP".to_string(),
        python_full_version: "3.11.2".parse().unwrap(),
        python_version: "3.11".parse().unwrap(),
        sys_platform: "linux".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_lock_reload_sync_roundtrip() {
    let index = Arc::new(
        FakeIndex::default()
            .with("requests", "2.19.1", &["chardet<3.1.0,>=3.0.2", "idna>=2.5"])
            .with("chardet", "3.0.4", &[])
            .with("idna", "2.7", &[]),
    );
    let manifest = manifest(&["requests>=2.19"]);
    let groups = [GroupName::Default];

    // Resolve against the index and write the lockfile.
    let resolution = resolve(
        index.clone(),
        &manifest,
        env_markers(),
        &groups,
        None,
        ResolveOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.candidates.len(), 3);

    let lockfile = Lockfile::from_resolution(
        &manifest,
        &resolution.candidates,
        &resolution.dependencies,
        &resolution.sections,
    );
    assert!(lockfile.is_up_to_date(&manifest));

    let scratch = tempfile::tempdir().unwrap();
    let lockfile_path = scratch.path().join("lockstep.lock");
    lockfile.write_to(&lockfile_path).unwrap();

    // Reload and re-resolve from the lock: identical pins, no index access.
    let reloaded = Lockfile::load(&lockfile_path).unwrap();
    assert_eq!(reloaded, lockfile);

    let locked_repo = Arc::new(LockedRepository::from_lockfile(&reloaded));
    let locked_resolution = resolve(
        locked_repo.clone(),
        &manifest,
        env_markers(),
        &groups,
        None,
        ResolveOptions {
            fetch_hashes: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for (key, candidate) in &resolution.candidates {
        let relocked = locked_resolution
            .candidates
            .get(key)
            .unwrap_or_else(|| panic!("{key} missing from the locked resolution"));
        assert_eq!(relocked.version, candidate.version, "pin moved for {key}");
    }

    // Writing the reloaded document reproduces the bytes exactly.
    assert_eq!(
        reloaded.to_toml_bytes().unwrap(),
        lockfile.to_toml_bytes().unwrap()
    );

    // Synchronize an empty environment from the locked candidates.
    let core = Core::new(scratch.path().join("cache"), Default::default());
    let environment = Environment::new(
        scratch.path().join("venv"),
        scratch.path().join("venv/bin/python"),
        3,
        11,
    );
    std::fs::create_dir_all(environment.site_packages()).unwrap();
    let wheels = Arc::new(FakeWheels {
        dir: scratch.path().join("wheelhouse"),
    });
    std::fs::create_dir_all(&wheels.dir).unwrap();

    let target: IndexMap<String, Candidate> = locked_repo.candidates_for_groups(&groups);
    let synchronizer = Synchronizer::new(
        core,
        environment.clone(),
        wheels,
        &target,
        &locked_repo.all_candidates(),
        env_markers(),
    )
    .unwrap();
    let result = synchronizer
        .synchronize(&SyncOptions::default())
        .await
        .unwrap();

    let mut added = result.added.clone();
    added.sort();
    assert_eq!(added, ["chardet", "idna", "requests"]);

    // The installed set equals the resolution.
    let working_set = environment.working_set().unwrap();
    assert_eq!(working_set.len(), 3);
    for (key, candidate) in &resolution.candidates {
        let installed = working_set
            .get(key)
            .unwrap_or_else(|| panic!("{key} was not installed"));
        assert_eq!(Some(&installed.version), candidate.version.as_ref());
    }

    // A second pass is a no-op.
    let second = synchronizer
        .synchronize(&SyncOptions::default())
        .await
        .unwrap();
    assert!(second.added.is_empty());
    assert!(second.updated.is_empty());
    assert!(second.removed.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_lockfile_is_detected() {
    let index = Arc::new(FakeIndex::default().with("pytz", "2019.3", &[]));
    let manifest_v1 = manifest(&["pytz"]);
    let resolution = resolve(
        index,
        &manifest_v1,
        env_markers(),
        &[GroupName::Default],
        None,
        ResolveOptions::default(),
    )
    .await
    .unwrap();
    let lockfile = Lockfile::from_resolution(
        &manifest_v1,
        &resolution.candidates,
        &resolution.dependencies,
        &resolution.sections,
    );

    assert!(lockfile.is_up_to_date(&manifest_v1));
    let manifest_v2 = manifest(&["pytz", "requests"]);
    assert!(!lockfile.is_up_to_date(&manifest_v2));
}
