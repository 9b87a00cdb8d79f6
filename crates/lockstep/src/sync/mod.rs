//! Synchronizing an environment with a resolved candidate set: diff against
//! the working set, then install, update and remove in parallel with
//! stash-and-commit safety.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use miette::Diagnostic;
use pep508_rs::MarkerEnvironment;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::Core;
use crate::environment::{Environment, EnvironmentError, WorkingSet};
use crate::index::{IndexRepository, RepositoryError};
use crate::install::{
    install_wheel, CacheLinkMode, CachedPackageStore, InstallError, InstallOptions,
    InstalledWheel, RemovePaths, UninstallError,
};
use crate::types::{Candidate, DirectUrl, Record, RecordEntry, RequirementSource, WheelFilename};

/// How often failed tasks are re-attempted before the failures are reported.
pub const RETRY_TIMES: usize = 1;

/// Foundational packages installed sequentially before anything else runs,
/// because other installs may shell out to them mid-flight.
const SEQUENTIAL_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

/// Packages never removed even when absent from the target set: the tooling
/// the environment itself depends on.
const SELF_HOSTED: &[&str] = &["lockstep", "pip", "setuptools", "wheel"];

/// Name written to `INSTALLER` files.
const INSTALLER_NAME: &str = "lockstep";

/// Upper bound on the worker pool.
const MAX_WORKERS: usize = 8;

/// The kind of a synchronization task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTaskKind {
    /// Install a missing distribution.
    Install,
    /// Replace an installed distribution with a different version.
    Update,
    /// Remove a distribution.
    Remove,
}

/// Receives structured progress events; rendering is the caller's concern.
pub trait ProgressSink: Send + Sync {
    /// A task started executing.
    fn task_started(&self, _kind: SyncTaskKind, _key: &str) {}
    /// A task finished successfully.
    fn task_succeeded(&self, _kind: SyncTaskKind, _key: &str) {}
    /// A task failed; it may still be retried.
    fn task_failed(&self, _kind: SyncTaskKind, _key: &str, _message: &str) {}
}

/// The default sink: silence.
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Options for one synchronization pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Remove packages that are no longer part of the target set.
    pub clean: bool,
    /// Compute and report the diff without touching the environment.
    pub dry_run: bool,
    /// Install editable candidates as regular distributions.
    pub no_editable: bool,
    /// Stop scheduling new tasks after the first failure.
    pub fail_fast: bool,
    /// Reinstall every matching distribution even when consistent.
    pub reinstall: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            clean: true,
            dry_run: false,
            no_editable: false,
            fail_fast: false,
            reinstall: false,
        }
    }
}

/// What a synchronization did (or, for a dry run, would do).
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Distributions that were (or would be) installed.
    pub added: Vec<String>,
    /// Distributions that were (or would be) updated.
    pub updated: Vec<String>,
    /// Distributions that were (or would be) removed.
    pub removed: Vec<String>,
}

/// Aggregated failure report of a synchronization.
#[derive(Debug, Diagnostic)]
pub struct InstallationError {
    /// Ids whose install or update failed persistently.
    pub install_failed: Vec<String>,
    /// Ids whose removal failed persistently.
    pub remove_failed: Vec<String>,
    /// The underlying error messages, for the debug log.
    pub errors: Vec<String>,
}

impl std::fmt::Display for InstallationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut lines = Vec::new();
        if !self.install_failed.is_empty() {
            lines.push(format!(
                "Installation failed: {}",
                self.install_failed.join(", ")
            ));
        }
        if !self.remove_failed.is_empty() {
            lines.push(format!("Removal failed: {}", self.remove_failed.join(", ")));
        }
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for InstallationError {}

/// Error raised by [`Synchronizer::synchronize`].
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum SyncError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Installation(#[from] InstallationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Supplies installable wheels for candidates. [`IndexRepository`] is the
/// production implementation; tests substitute their own.
#[async_trait]
pub trait WheelProvider: Send + Sync {
    /// Produces a wheel on disk for the candidate.
    async fn fetch_wheel(&self, candidate: &Candidate) -> Result<PathBuf, RepositoryError>;
}

#[async_trait]
impl WheelProvider for IndexRepository {
    async fn fetch_wheel(&self, candidate: &Candidate) -> Result<PathBuf, RepositoryError> {
        IndexRepository::fetch_wheel(self, candidate).await
    }
}

/// Compares a target candidate set against the working set and executes the
/// difference.
pub struct Synchronizer {
    inner: Arc<SyncContext>,
}

struct SyncContext {
    core: Core,
    environment: Environment,
    wheels: Arc<dyn WheelProvider>,
    /// The selected candidates, collapsed to one entry per base name.
    target: IndexMap<String, Candidate>,
    /// Base names of every candidate in the lock, across all groups; those
    /// are never removed just because their group was not selected.
    all_names: HashSet<String>,
    working_set: WorkingSet,
    env_markers: MarkerEnvironment,
    sink: Arc<dyn ProgressSink>,
    cancelled: AtomicBool,
}

/// Strips the `[extras]` suffix off a vertex key.
fn base_name(key: &str) -> &str {
    key.split('[').next().unwrap_or(key)
}

impl Synchronizer {
    /// Creates a synchronizer for the given target set.
    ///
    /// `candidates` is the resolution restricted to the selected groups;
    /// `all_candidates` covers every group in the lock and guards removal.
    /// The working set is read once, here.
    pub fn new(
        core: Core,
        environment: Environment,
        wheels: Arc<dyn WheelProvider>,
        candidates: &IndexMap<String, Candidate>,
        all_candidates: &IndexMap<String, Candidate>,
        env_markers: MarkerEnvironment,
    ) -> Result<Self, SyncError> {
        // Collapse extras vertices onto their base package: `foo[cli]` and
        // `foo` install the same artifact. Prefer the entry carrying extras
        // so entry-point filtering sees them.
        let mut target: IndexMap<String, Candidate> = IndexMap::new();
        for (key, candidate) in candidates {
            let name = base_name(key).to_string();
            match target.entry(name) {
                indexmap::map::Entry::Vacant(entry) => {
                    entry.insert(candidate.clone());
                }
                indexmap::map::Entry::Occupied(mut entry) => {
                    if !candidate.req.extras.is_empty() {
                        entry.insert(candidate.clone());
                    }
                }
            }
        }
        let all_names = all_candidates
            .keys()
            .map(|key| base_name(key).to_string())
            .collect();
        let working_set = environment.working_set()?;

        Ok(Synchronizer {
            inner: Arc::new(SyncContext {
                core,
                environment,
                wheels,
                target,
                all_names,
                working_set,
                env_markers,
                sink: Arc::new(NullSink),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    /// Replaces the progress sink.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_sink is called before synchronize")
            .sink = sink;
        self
    }

    /// Requests cancellation: in-flight tasks finish their current step,
    /// pending tasks are dropped. Wire this to SIGINT.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Computes the `(to_add, to_update, to_remove)` triple. The three sets
    /// are disjoint by construction.
    pub fn compare_with_working_set(
        &self,
        options: &SyncOptions,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let inner = &self.inner;
        let mut to_add = Vec::new();
        let mut to_update = Vec::new();
        let mut to_remove = Vec::new();

        for (name, dist) in inner.working_set.iter() {
            let name = name.as_str();
            if let Some(candidate) = inner.target.get(name) {
                if !candidate.req.marker_matches(&inner.env_markers) {
                    // Locked for some other environment, not this one.
                    to_remove.push(name.to_string());
                } else if options.reinstall {
                    to_update.push(name.to_string());
                } else if !dist.is_editable()
                    && candidate.version.as_ref() != Some(&dist.version)
                {
                    // An editable install is considered consistent whatever
                    // its version says.
                    to_update.push(name.to_string());
                }
            } else if !inner.all_names.contains(name) && !SELF_HOSTED.contains(&name) {
                to_remove.push(name.to_string());
            }
        }

        for (key, candidate) in &inner.target {
            if !candidate.req.marker_matches(&inner.env_markers) {
                continue;
            }
            if !inner.working_set.contains(key) {
                to_add.push(key.clone());
            }
        }

        (to_add, to_update, to_remove)
    }

    /// Runs the synchronization.
    pub async fn synchronize(&self, options: &SyncOptions) -> Result<SyncResult, SyncError> {
        let (to_add, to_update, mut to_remove) = self.compare_with_working_set(options);
        if !options.clean {
            to_remove.clear();
        }

        if options.dry_run {
            return Ok(SyncResult {
                added: to_add,
                updated: to_update,
                removed: to_remove,
            });
        }

        // Ordering within a pass: update, then remove, then add.
        let mut tasks: Vec<(SyncTaskKind, String)> = Vec::new();
        tasks.extend(to_update.into_iter().map(|n| (SyncTaskKind::Update, n)));
        tasks.extend(to_remove.into_iter().map(|n| (SyncTaskKind::Remove, n)));
        tasks.extend(to_add.into_iter().map(|n| (SyncTaskKind::Install, n)));

        let mut result = SyncResult::default();
        let mut failed = self.run_pass(&tasks, options, &mut result).await;

        for attempt in 0..RETRY_TIMES {
            if failed.is_empty() || self.inner.cancelled.load(Ordering::SeqCst) {
                break;
            }
            tracing::info!(
                "retrying {} failed task(s) ({}/{RETRY_TIMES})",
                failed.len(),
                attempt + 1
            );
            let retry: Vec<(SyncTaskKind, String)> =
                failed.iter().map(|(kind, name, _)| (*kind, name.clone())).collect();
            failed = self.run_pass(&retry, options, &mut result).await;
        }

        if failed.is_empty() {
            return Ok(result);
        }
        let mut install_failed = Vec::new();
        let mut remove_failed = Vec::new();
        let mut errors = Vec::new();
        for (kind, name, message) in failed {
            match kind {
                SyncTaskKind::Install | SyncTaskKind::Update => install_failed.push(name),
                SyncTaskKind::Remove => remove_failed.push(name),
            }
            errors.push(message);
        }
        Err(InstallationError {
            install_failed,
            remove_failed,
            errors,
        }
        .into())
    }

    /// Runs one pass over the given tasks: the sequential bootstrap packages
    /// inline first, then everything else on the worker pool. Returns the
    /// tasks that failed.
    async fn run_pass(
        &self,
        tasks: &[(SyncTaskKind, String)],
        options: &SyncOptions,
        result: &mut SyncResult,
    ) -> Vec<(SyncTaskKind, String, String)> {
        let inner = self.inner.clone();
        let mut failed = Vec::new();

        let (sequential, parallel): (Vec<_>, Vec<_>) = tasks
            .iter()
            .cloned()
            .partition(|(_, name)| SEQUENTIAL_PACKAGES.contains(&base_name(name)));

        for (kind, name) in sequential {
            if inner.cancelled.load(Ordering::SeqCst) {
                return failed;
            }
            match inner.run_task(kind, &name, options).await {
                Ok(()) => record_success(result, kind, &name),
                Err(message) => {
                    if options.fail_fast {
                        inner.cancelled.store(true, Ordering::SeqCst);
                    }
                    failed.push((kind, name, message));
                }
            }
        }

        let workers = if inner.core.config.parallel_install {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_WORKERS)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pool: JoinSet<
            Result<Option<(SyncTaskKind, String)>, (SyncTaskKind, String, String)>,
        > = JoinSet::new();
        let fail_fast = options.fail_fast;
        for (kind, name) in parallel {
            let inner = inner.clone();
            let options = options.clone();
            let semaphore = semaphore.clone();
            pool.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                if inner.cancelled.load(Ordering::SeqCst) {
                    // Pending work is dropped on cancellation; not a failure.
                    return Ok(None);
                }
                match inner.run_task(kind, &name, &options).await {
                    Ok(()) => Ok(Some((kind, name))),
                    Err(message) => {
                        if fail_fast {
                            inner.cancelled.store(true, Ordering::SeqCst);
                        }
                        Err((kind, name, message))
                    }
                }
            });
        }
        while let Some(joined) = pool.join_next().await {
            match joined.expect("sync tasks do not panic") {
                Ok(Some((kind, name))) => record_success(result, kind, &name),
                Ok(None) => {}
                Err(failure) => failed.push(failure),
            }
        }
        failed
    }
}

fn record_success(result: &mut SyncResult, kind: SyncTaskKind, name: &str) {
    match kind {
        SyncTaskKind::Install => result.added.push(name.to_string()),
        SyncTaskKind::Update => result.updated.push(name.to_string()),
        SyncTaskKind::Remove => result.removed.push(name.to_string()),
    }
}

impl SyncContext {
    async fn run_task(
        &self,
        kind: SyncTaskKind,
        name: &str,
        options: &SyncOptions,
    ) -> Result<(), String> {
        self.sink.task_started(kind, name);
        let outcome = match kind {
            SyncTaskKind::Install => self.install_one(name, options).await.map(|_| ()),
            SyncTaskKind::Update => self.update_one(name, options).await,
            SyncTaskKind::Remove => self.remove_one(name).await,
        };
        match outcome {
            Ok(()) => {
                self.sink.task_succeeded(kind, name);
                Ok(())
            }
            Err(message) => {
                tracing::debug!("task {kind:?} {name} failed: {message}");
                self.sink.task_failed(kind, name, &message);
                Err(message)
            }
        }
    }

    async fn install_one(
        &self,
        name: &str,
        options: &SyncOptions,
    ) -> Result<InstalledWheel, String> {
        let candidate = self
            .target
            .get(name)
            .cloned()
            .ok_or_else(|| format!("{name} is not part of the target set"))?;

        if candidate.req.is_editable() && !options.no_editable {
            return self.install_editable(&candidate).await;
        }

        let wheel_path = self
            .wheels
            .fetch_wheel(&candidate)
            .await
            .map_err(|e| e.to_string())?;
        let file_name = wheel_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("no wheel filename for {name}"))?;
        let wheel_name: WheelFilename = file_name.parse().map_err(|e| format!("{e}"))?;

        let direct_url = candidate
            .prepared()
            .and_then(|prepared| prepared.direct_url.clone());
        let install_options = InstallOptions {
            installer: Some(INSTALLER_NAME.to_string()),
            extras: Some(candidate.req.extras.iter().cloned().collect()),
            direct_url,
            requested: candidate.req.group == crate::types::GroupName::Default,
        };

        // Cache-linked install for index wheels without scripts or data.
        if self.core.config.install_cache
            && candidate.is_from_index()
            && wheel_is_cacheable(&wheel_path).unwrap_or(false)
        {
            let store = CachedPackageStore::new(self.core.packages_cache_dir())
                .map_err(|e| e.to_string())?;
            let site_packages = self.environment.site_packages();
            let mode = if self.core.config.cache_link_symlinks {
                CacheLinkMode::Symlink
            } else {
                CacheLinkMode::Pth
            };
            return tokio::task::spawn_blocking(move || {
                let package = store.get_or_create(&wheel_path, &wheel_name)?;
                fs_err::create_dir_all(&site_packages)?;
                package.link_into(&site_packages, mode, Some(INSTALLER_NAME))
            })
            .await
            .expect("install tasks do not panic")
            .map_err(|e: InstallError| e.to_string());
        }

        let environment = self.environment.clone();
        tokio::task::spawn_blocking(move || {
            install_wheel(
                &wheel_path,
                &wheel_name,
                environment.root(),
                environment.paths(),
                environment.interpreter(),
                &install_options,
            )
        })
        .await
        .expect("install tasks do not panic")
        .map_err(|e| e.to_string())
    }

    /// Installs an editable candidate as an import-redirect layout: a `.pth`
    /// file pointing at the source tree plus a lightweight dist-info.
    async fn install_editable(&self, candidate: &Candidate) -> Result<InstalledWheel, String> {
        let RequirementSource::Path { path, .. } = &candidate.req.source else {
            return Err(format!(
                "{} is editable but not a local directory",
                candidate.key()
            ));
        };
        let source_dir = dunce::canonicalize(path).map_err(|e| e.to_string())?;
        let name = candidate
            .name
            .clone()
            .ok_or_else(|| "editable candidate has no name".to_string())?;
        let version = candidate
            .version
            .clone()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "0.0.0".to_string());

        let site_packages = self.environment.site_packages();
        fs_err::create_dir_all(&site_packages).map_err(|e| e.to_string())?;
        let dist_info_name = format!("{}-{version}.dist-info", name.as_str().replace('-', "_"));
        let dist_info = site_packages.join(&dist_info_name);
        fs_err::create_dir_all(&dist_info).map_err(|e| e.to_string())?;

        let mut records = Vec::new();
        let mut write = |relative: String, content: &[u8]| -> Result<(), String> {
            crate::utils::atomic_replace(&site_packages.join(&relative), content)
                .map_err(|e| e.to_string())?;
            records.push(RecordEntry {
                path: relative,
                hash: None,
                size: Some(content.len() as u64),
            });
            Ok(())
        };

        let metadata = format!(
            "Metadata-Version: 2.1\nName: {}\nVersion: {version}\n",
            name.as_source_str()
        );
        write(format!("{dist_info_name}/METADATA"), metadata.as_bytes())?;
        write(
            format!("{dist_info_name}/INSTALLER"),
            format!("{INSTALLER_NAME}\n").as_bytes(),
        )?;

        let url = url::Url::from_file_path(&source_dir)
            .map_err(|_| format!("cannot express {} as a file url", source_dir.display()))?;
        let direct_url = DirectUrl::for_directory(url, true);
        let direct_url_json =
            serde_json::to_vec(&direct_url).map_err(|e| e.to_string())?;
        write(format!("{dist_info_name}/direct_url.json"), &direct_url_json)?;

        let pth_name = format!("__editable__.{}.pth", name.as_str().replace('-', "_"));
        write(pth_name, format!("{}\n", source_dir.display()).as_bytes())?;

        records.push(RecordEntry {
            path: format!("{dist_info_name}/RECORD"),
            hash: None,
            size: None,
        });
        let record = Record::from_iter(records);
        record
            .write_to_path(&dist_info.join("RECORD"))
            .map_err(|e| e.to_string())?;

        Ok(InstalledWheel { dist_info, record })
    }

    /// Upgrades in place: install the new version first, then remove only
    /// `old − new`, so files shared between versions survive untouched.
    async fn update_one(&self, name: &str, options: &SyncOptions) -> Result<(), String> {
        let dist = self
            .working_set
            .get(name)
            .cloned()
            .ok_or_else(|| format!("{name} is not installed"))?;
        let old_record = dist.record().map_err(|e| e.to_string())?;
        let site_packages = dist.site_packages().to_path_buf();
        let old_paths: BTreeSet<PathBuf> = old_record
            .iter()
            .map(|entry| site_packages.join(&entry.path))
            .collect();

        let installed = self.install_one(name, options).await?;
        let new_site_packages = self.environment.site_packages();
        let new_paths: BTreeSet<PathBuf> = installed
            .record
            .iter()
            .map(|entry| new_site_packages.join(&entry.path))
            .collect();

        let stale: BTreeSet<PathBuf> = old_paths.difference(&new_paths).cloned().collect();
        let mut removal = RemovePaths::from_paths(stale, &self.environment);
        if let Some(refer_to) = &dist.refer_to {
            removal.set_referrer(refer_to.clone(), dist.dist_info.clone());
        }
        // A failure mid-removal rolls back through the RAII guard.
        removal.remove().map_err(|e| e.to_string())?;
        removal.commit().map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn remove_one(&self, name: &str) -> Result<(), String> {
        let dist = self
            .working_set
            .get(name)
            .cloned()
            .ok_or_else(|| format!("{name} is not installed"))?;
        let environment = self.environment.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UninstallError> {
            let mut removal = RemovePaths::from_dist(&dist, &environment)?;
            removal.remove()?;
            removal.commit()
        })
        .await
        .expect("remove tasks do not panic")
        .map_err(|e| e.to_string())
    }
}

/// Whether a wheel can live in the shared package cache: no scripts, no data
/// directories, nothing that must be materialized per environment.
fn wheel_is_cacheable(wheel_path: &std::path::Path) -> std::io::Result<bool> {
    let file = fs_err::File::open(wheel_path)?;
    let archive = zip::ZipArchive::new(file.into_parts().0)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let cacheable = !archive
        .file_names()
        .any(|name| name.contains(".data/") || name.ends_with("entry_points.txt"));
    Ok(cacheable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreConfig;
    use crate::install::tests::make_test_wheel;
    use crate::types::Requirement;
    use std::str::FromStr;

    /// Serves wheels built on the fly into a scratch directory.
    struct FakeWheels {
        dir: PathBuf,
    }

    #[async_trait]
    impl WheelProvider for FakeWheels {
        async fn fetch_wheel(&self, candidate: &Candidate) -> Result<PathBuf, RepositoryError> {
            let name = candidate.name.as_ref().unwrap().as_str().replace('-', "_");
            let version = candidate.version.as_ref().unwrap().to_string();
            Ok(make_test_wheel(&self.dir, &name, &version, None))
        }
    }

    fn env_markers() -> MarkerEnvironment {
        MarkerEnvironment {
            implementation_name: "cpython".to_string(),
            implementation_version: "3.11.2".parse().unwrap(),
            os_name: "posix".to_string(),
            platform_machine: "arm64".to_string(),
            platform_python_implementation: "CPython".to_string(),
            platform_release: "22.0".to_string(),
            platform_system: "Darwin".to_string(),
            platform_version: "22.0".to_string(),
            python_full_version: "3.11.2".parse().unwrap(),
            python_version: "3.11".parse().unwrap(),
            sys_platform: "darwin".to_string(),
        }
    }

    fn candidate(line: &str, version: &str) -> Candidate {
        Candidate::new(Requirement::from_str(line).unwrap())
            .with_version(version.parse().unwrap())
    }

    struct Fixture {
        _scratch: tempfile::TempDir,
        core: Core,
        environment: Environment,
        wheels: Arc<FakeWheels>,
    }

    fn fixture() -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let core = Core::new(scratch.path().join("cache"), CoreConfig::default());
        let environment = Environment::new(
            scratch.path().join("venv"),
            scratch.path().join("venv/bin/python"),
            3,
            11,
        );
        fs_err::create_dir_all(environment.site_packages()).unwrap();
        let wheels = Arc::new(FakeWheels {
            dir: scratch.path().join("wheels"),
        });
        fs_err::create_dir_all(&wheels.dir).unwrap();
        Fixture {
            _scratch: scratch,
            core,
            environment,
            wheels,
        }
    }

    fn synchronizer(fixture: &Fixture, target: &IndexMap<String, Candidate>) -> Synchronizer {
        Synchronizer::new(
            fixture.core.clone(),
            fixture.environment.clone(),
            fixture.wheels.clone(),
            target,
            target,
            env_markers(),
        )
        .unwrap()
    }

    fn target(entries: &[(&str, &str)]) -> IndexMap<String, Candidate> {
        entries
            .iter()
            .map(|(line, version)| {
                let can = candidate(line, version);
                (can.key(), can)
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn installs_missing_packages() {
        let fixture = fixture();
        let target = target(&[("demo==1.0", "1.0")]);
        let sync = synchronizer(&fixture, &target);

        let result = sync.synchronize(&SyncOptions::default()).await.unwrap();
        assert_eq!(result.added, ["demo"]);

        let working_set = fixture.environment.working_set().unwrap();
        assert!(working_set.contains("demo"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn diff_sets_are_disjoint_and_marker_aware() {
        let fixture = fixture();

        // Pre-install demo 1.0 and stale 0.1.
        let first = target(&[("demo==1.0", "1.0"), ("stale==0.1", "0.1")]);
        synchronizer(&fixture, &first)
            .synchronize(&SyncOptions::default())
            .await
            .unwrap();

        // New target: demo moves to 2.0, pytz is marker-excluded on darwin,
        // fresh is new; stale disappears.
        let second = target(&[
            ("demo==2.0", "2.0"),
            ("pytz ; platform_system != 'Darwin'", "2019.3"),
            ("fresh==1.0", "1.0"),
        ]);
        let sync = synchronizer(&fixture, &second);
        let (to_add, to_update, to_remove) =
            sync.compare_with_working_set(&SyncOptions::default());

        assert_eq!(to_add, ["fresh"]);
        assert_eq!(to_update, ["demo"]);
        assert_eq!(to_remove, ["stale"]);

        let add: HashSet<_> = to_add.iter().collect();
        let update: HashSet<_> = to_update.iter().collect();
        let remove: HashSet<_> = to_remove.iter().collect();
        assert!(add.is_disjoint(&update));
        assert!(add.is_disjoint(&remove));
        assert!(update.is_disjoint(&remove));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn marker_excluded_packages_are_not_installed() {
        let fixture = fixture();
        let target = target(&[("pytz ; platform_system != 'Darwin'", "2019.3")]);
        let sync = synchronizer(&fixture, &target);
        let result = sync.synchronize(&SyncOptions::default()).await.unwrap();
        assert!(result.added.is_empty());
        assert!(!fixture.environment.working_set().unwrap().contains("pytz"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dry_run_reports_without_side_effects() {
        let fixture = fixture();
        let target = target(&[("demo==1.0", "1.0")]);
        let sync = synchronizer(&fixture, &target);
        let result = sync
            .synchronize(&SyncOptions {
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.added, ["demo"]);
        assert!(fixture.environment.working_set().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_replaces_and_removes_stale_files() {
        let fixture = fixture();
        let v1 = target(&[("demo==1.0", "1.0")]);
        synchronizer(&fixture, &v1)
            .synchronize(&SyncOptions::default())
            .await
            .unwrap();
        let old_dist_info = fixture
            .environment
            .site_packages()
            .join("demo-1.0.dist-info");
        assert!(old_dist_info.exists());

        let v2 = target(&[("demo==2.0", "2.0")]);
        let result = synchronizer(&fixture, &v2)
            .synchronize(&SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.updated, ["demo"]);
        assert!(!old_dist_info.exists());

        let working_set = fixture.environment.working_set().unwrap();
        assert_eq!(
            working_set.get("demo").unwrap().version.to_string(),
            "2.0"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_false_keeps_strays() {
        let fixture = fixture();
        let first = target(&[("stale==0.1", "0.1")]);
        synchronizer(&fixture, &first)
            .synchronize(&SyncOptions::default())
            .await
            .unwrap();

        let second = target(&[("demo==1.0", "1.0")]);
        let result = synchronizer(&fixture, &second)
            .synchronize(&SyncOptions {
                clean: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.added, ["demo"]);
        assert!(result.removed.is_empty());
        assert!(fixture.environment.working_set().unwrap().contains("stale"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editable_installs_use_a_pth_redirect() {
        let fixture = fixture();
        let source = fixture._scratch.path().join("src/mypkg");
        fs_err::create_dir_all(&source).unwrap();
        fs_err::write(source.join("pyproject.toml"), "[project]\nname='mypkg'\n").unwrap();

        let mut can = Candidate::new(
            Requirement::from_str(&format!("-e {}", source.display())).unwrap(),
        )
        .with_version("0.1.0".parse().unwrap());
        can.name = Some("mypkg".parse().unwrap());
        let target = IndexMap::from([(can.key(), can)]);

        let sync = synchronizer(&fixture, &target);
        sync.synchronize(&SyncOptions::default()).await.unwrap();

        let site_packages = fixture.environment.site_packages();
        let pth = site_packages.join("__editable__.mypkg.pth");
        assert!(pth.is_file());
        let working_set = fixture.environment.working_set().unwrap();
        assert!(working_set.get("mypkg").unwrap().is_editable());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editable_distributions_are_never_updated() {
        let fixture = fixture();
        let source = fixture._scratch.path().join("src/mypkg");
        fs_err::create_dir_all(&source).unwrap();

        let mut editable = Candidate::new(
            Requirement::from_str(&format!("-e {}", source.display())).unwrap(),
        )
        .with_version("0.1.0".parse().unwrap());
        editable.name = Some("mypkg".parse().unwrap());
        let first = IndexMap::from([(editable.key(), editable)]);
        synchronizer(&fixture, &first)
            .synchronize(&SyncOptions::default())
            .await
            .unwrap();

        // A new target pins a different version; the editable install still
        // counts as consistent.
        let mut newer = candidate("mypkg==9.9", "9.9");
        newer.name = Some("mypkg".parse().unwrap());
        let second = IndexMap::from([("mypkg".to_string(), newer)]);
        let sync = synchronizer(&fixture, &second);
        let (_, to_update, _) = sync.compare_with_working_set(&SyncOptions::default());
        assert!(to_update.is_empty());
    }
}
