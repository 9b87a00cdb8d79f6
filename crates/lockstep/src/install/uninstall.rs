use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::environment::{Distribution, Environment};

use super::cached_package::CachedPackage;

/// The registry file whose entries legacy editable installs splice into.
const PTH_REGISTRY: &str = "easy-install.pth";

/// Error raised during uninstallation. Any failure after the remove phase
/// triggers a rollback before it propagates.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum UninstallError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read RECORD of {0}: {1}")]
    Record(String, #[source] csv::Error),

    #[error("entry '{0}' not found in {PTH_REGISTRY}")]
    PthEntryMissing(String),
}

/// A pending removal: the collected path set of one distribution, with
/// two-phase stash/commit semantics.
///
/// `remove` renames everything into a stash directory next to the
/// environment (cheap and reversible), `commit` deletes the stash, and
/// `rollback` renames everything back. Dropping the value without calling
/// either rolls back, so a panic mid-uninstall leaves the environment
/// intact.
pub struct RemovePaths {
    paths: BTreeSet<PathBuf>,
    pth_entries: BTreeSet<String>,
    pth_file: PathBuf,
    /// `(cache entry, project dist-info)` for cache-linked installs.
    referrer: Option<(PathBuf, PathBuf)>,
    environment_root: PathBuf,
    saved_pth: Option<Vec<u8>>,
    stashed: Vec<(PathBuf, PathBuf)>,
    stash_dir: Option<tempfile::TempDir>,
    finished: bool,
}

impl RemovePaths {
    /// Collects every path belonging to an installed distribution: the
    /// RECORD list, byte-code shadows of its python modules, its entry-point
    /// launchers and the cache pointer.
    pub fn from_dist(
        dist: &Distribution,
        environment: &Environment,
    ) -> Result<Self, UninstallError> {
        let record = dist
            .record()
            .map_err(|e| UninstallError::Record(dist.name.to_string(), e))?;
        let site_packages = dist.site_packages().to_path_buf();

        let mut instance = Self::from_paths(
            record
                .iter()
                .map(|entry| site_packages.join(&entry.path))
                .collect(),
            environment,
        );

        // Launchers that predate our RECORD writing, from entry_points.txt.
        if let Ok(raw) = fs_err::read_to_string(dist.dist_info.join("entry_points.txt")) {
            if let Ok(mut sections) = configparser::ini::Ini::new_cs().read(raw) {
                let scripts_dir = environment.scripts_dir();
                for section in ["console_scripts", "gui_scripts"] {
                    for script_name in sections.remove(section).into_iter().flatten().map(|kv| kv.0)
                    {
                        instance.add_path(scripts_dir.join(&script_name));
                        if environment.paths().is_windows() {
                            instance.add_path(scripts_dir.join(format!("{script_name}.exe")));
                            instance
                                .add_path(scripts_dir.join(format!("{script_name}-script.py")));
                        }
                    }
                }
            }
        }

        if let Some(refer_to) = &dist.refer_to {
            instance.referrer = Some((refer_to.clone(), dist.dist_info.clone()));
        }
        Ok(instance)
    }

    /// Builds a removal for an explicit path set, used by overwrite-style
    /// updates to drop `old − new`.
    pub fn from_paths(paths: BTreeSet<PathBuf>, environment: &Environment) -> Self {
        let mut instance = RemovePaths {
            paths: BTreeSet::new(),
            pth_entries: BTreeSet::new(),
            pth_file: environment.site_packages().join(PTH_REGISTRY),
            referrer: None,
            environment_root: environment.root().to_path_buf(),
            saved_pth: None,
            stashed: Vec::new(),
            stash_dir: None,
            finished: false,
        };
        for path in paths {
            instance.add_path(path);
        }
        instance
    }

    /// Adds a single path, plus the byte-code shadows of a `.py` file.
    /// Paths are normalized lexically so RECORD rows like
    /// `../../../bin/celery` stash and restore cleanly.
    pub fn add_path(&mut self, path: PathBuf) {
        let path = normalize_path(&path);
        if path.extension().is_some_and(|ext| ext == "py") {
            self.paths.insert(path.with_extension("pyc"));
            if let (Some(parent), Some(stem)) = (path.parent(), path.file_stem()) {
                let pycache = parent.join("__pycache__");
                let prefix = format!("{}.", stem.to_string_lossy());
                if let Ok(entries) = fs_err::read_dir(&pycache) {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if name.starts_with(&prefix) && name.ends_with(".pyc") {
                            self.paths.insert(pycache.join(name));
                        }
                    }
                }
            }
        }
        self.paths.insert(path);
    }

    /// Registers an `easy-install.pth` entry to splice out.
    pub fn add_pth_entry(&mut self, line: impl Into<String>) {
        self.pth_entries.insert(line.into());
    }

    /// Registers the cached package to unlink from on commit.
    pub fn set_referrer(&mut self, cache_path: PathBuf, dist_info: PathBuf) {
        self.referrer = Some((cache_path, dist_info));
    }

    /// Whether anything would actually be removed.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.pth_entries.is_empty()
    }

    /// The remove phase: splice pth entries and stash the files. Reversible
    /// until [`commit`](Self::commit).
    pub fn remove(&mut self) -> Result<(), UninstallError> {
        self.remove_pth_entries()?;
        self.stash_files()
    }

    fn remove_pth_entries(&mut self) -> Result<(), UninstallError> {
        if self.pth_entries.is_empty() {
            return Ok(());
        }
        let original = fs_err::read(&self.pth_file)?;
        let text = String::from_utf8_lossy(&original);
        let line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let mut lines: Vec<&str> = text.lines().collect();
        for entry in &self.pth_entries {
            tracing::debug!("removing pth entry: {entry}");
            let position = lines
                .iter()
                .position(|line| line == entry)
                .ok_or_else(|| UninstallError::PthEntryMissing(entry.clone()))?;
            lines.remove(position);
        }
        let mut updated = lines.join(line_ending);
        updated.push_str(line_ending);
        crate::utils::atomic_replace(&self.pth_file, updated.as_bytes())?;
        self.saved_pth = Some(original);
        Ok(())
    }

    fn stash_files(&mut self) -> Result<(), UninstallError> {
        let to_rename = compress_for_rename(&self.paths);
        if to_rename.is_empty() {
            return Ok(());
        }
        let stash_dir = tempfile::Builder::new()
            .prefix(".lockstep-uninstall-")
            .tempdir_in(&self.environment_root)?;

        for old_path in to_rename {
            let Ok(metadata) = old_path.symlink_metadata() else {
                continue;
            };
            let is_dir = metadata.is_dir() && !metadata.is_symlink();
            tracing::debug!(
                "stashing {} {}",
                if is_dir { "directory" } else { "file" },
                old_path.display()
            );
            if old_path.extension().is_some_and(|ext| ext == "pyc") {
                // Cache files are regenerated anyway; no need to stash.
                fs_err::remove_file(&old_path)?;
                continue;
            }
            let Ok(relative) = old_path.strip_prefix(&self.environment_root) else {
                tracing::debug!(
                    "{} is outside the environment root, skipping",
                    old_path.display()
                );
                continue;
            };
            let new_path = stash_dir.path().join(relative);
            if let Some(parent) = new_path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            if is_dir && new_path.is_dir() {
                fs_err::remove_dir(&new_path)?;
            }
            fs_err::rename(&old_path, &new_path)?;
            self.stashed.push((old_path, new_path));
        }
        self.stash_dir = Some(stash_dir);
        Ok(())
    }

    /// The commit phase: the stash is deleted and cached-package referrers
    /// are decremented. After this the removal is final.
    pub fn commit(mut self) -> Result<(), UninstallError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), UninstallError> {
        if let Some(stash_dir) = self.stash_dir.take() {
            stash_dir.close()?;
        }
        self.stashed.clear();
        self.saved_pth = None;
        if let Some((cache_path, dist_info)) = self.referrer.take() {
            tracing::info!("unlinking from cached package {}", cache_path.display());
            if let Err(e) = CachedPackage::new(&cache_path).remove_referrer(&dist_info) {
                tracing::warn!("failed to update {}/.referrers: {e}", cache_path.display());
            }
        }
        self.finished = true;
        Ok(())
    }

    /// Restores everything the remove phase touched: the pth registry byte
    /// for byte, and every stashed path.
    pub fn rollback(mut self) -> Result<(), UninstallError> {
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<(), UninstallError> {
        if self.stashed.is_empty() && self.saved_pth.is_none() {
            self.finished = true;
            return Ok(());
        }
        if let Some(saved) = self.saved_pth.take() {
            crate::utils::atomic_replace(&self.pth_file, &saved)?;
        }
        for (old_path, new_path) in std::mem::take(&mut self.stashed) {
            tracing::debug!("restoring {}", old_path.display());
            if let Ok(metadata) = old_path.symlink_metadata() {
                if metadata.is_dir() && !metadata.is_symlink() {
                    fs_err::remove_dir_all(&old_path)?;
                } else {
                    fs_err::remove_file(&old_path)?;
                }
            }
            if let Some(parent) = old_path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::rename(&new_path, &old_path)?;
        }
        if let Some(stash_dir) = self.stash_dir.take() {
            stash_dir.close()?;
        }
        // Rollback must not decrement referrers: the link still exists.
        self.referrer = None;
        self.finished = true;
        Ok(())
    }
}

impl Drop for RemovePaths {
    fn drop(&mut self) {
        if !self.finished && (!self.stashed.is_empty() || self.saved_pth.is_some()) {
            tracing::warn!("uninstall neither committed nor rolled back, rolling back");
            if let Err(e) = self.rollback_in_place() {
                tracing::error!("rollback failed: {e}");
            }
        }
    }
}

/// Shrinks a path set for renaming: when every file under a directory is
/// being removed the directory itself is substituted, and paths nested under
/// another selected path are dropped.
pub fn compress_for_rename(paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let existing: BTreeSet<PathBuf> = paths
        .iter()
        .filter(|path| path.symlink_metadata().is_ok())
        .cloned()
        .collect();
    let mut remaining = existing.clone();
    let mut wildcards: BTreeSet<PathBuf> = BTreeSet::new();

    let mut roots: Vec<PathBuf> = existing
        .iter()
        .filter_map(|path| path.parent().map(Path::to_path_buf))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    roots.sort_by_key(|path| path.as_os_str().len());

    for root in roots {
        if wildcards.iter().any(|wildcard| root.starts_with(wildcard)) {
            // A parent already covers this directory.
            continue;
        }
        let mut all_files = BTreeSet::new();
        collect_files(&root, &mut all_files);
        if !all_files.is_empty() && all_files.is_subset(&remaining) {
            for file in &all_files {
                remaining.remove(file);
            }
            wildcards.insert(root);
        }
    }

    let mut collected: Vec<PathBuf> = remaining.into_iter().chain(wildcards).collect();
    collected.sort_by_key(|path| path.as_os_str().len());
    let mut shortened: BTreeSet<PathBuf> = BTreeSet::new();
    for path in collected {
        if !shortened
            .iter()
            .any(|kept| path != *kept && path.starts_with(kept))
        {
            shortened.insert(path);
        }
    }
    shortened
}

/// Resolves `.` and `..` components lexically without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// Collects all files under `root`; symlinked directories count as files
/// (they are renamed, not descended into).
fn collect_files(root: &Path, into: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = path.symlink_metadata() else {
            continue;
        };
        if metadata.is_dir() && !metadata.is_symlink() {
            collect_files(&path, into);
        } else {
            into.insert(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    fn fixture_env() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path(), dir.path().join("bin/python"), 3, 11);
        fs_err::create_dir_all(env.site_packages()).unwrap();
        fs_err::create_dir_all(env.scripts_dir()).unwrap();
        (dir, env)
    }

    fn install_fixture_dist(env: &Environment) -> Distribution {
        let site_packages = env.site_packages();
        let dist_info = site_packages.join("celery-5.0.0.dist-info");
        fs_err::create_dir_all(&dist_info).unwrap();
        fs_err::write(
            dist_info.join("METADATA"),
            "Metadata-Version: 2.1\nName: celery\nVersion: 5.0.0\n",
        )
        .unwrap();
        fs_err::create_dir_all(site_packages.join("celery/app")).unwrap();
        fs_err::write(site_packages.join("celery/__init__.py"), "init\n").unwrap();
        fs_err::write(site_packages.join("celery/app/__init__.py"), "app\n").unwrap();
        fs_err::write(env.scripts_dir().join("celery"), "#!python\nrun()\n").unwrap();

        let record = "\
celery/__init__.py,,\n\
celery/app/__init__.py,,\n\
../../../bin/celery,,\n\
celery-5.0.0.dist-info/METADATA,,\n\
celery-5.0.0.dist-info/RECORD,,\n";
        // The fixture layout uses lib/python3.11/site-packages, so scripts
        // live three levels up.
        fs_err::write(dist_info.join("RECORD"), record).unwrap();

        env.working_set().unwrap().get("celery").cloned().unwrap()
    }

    #[test]
    fn remove_then_commit_deletes_everything() {
        let (_dir, env) = fixture_env();
        let dist = install_fixture_dist(&env);

        let mut removal = RemovePaths::from_dist(&dist, &env).unwrap();
        removal.remove().unwrap();
        // Stashed, not destroyed.
        assert!(!env.site_packages().join("celery/__init__.py").exists());
        removal.commit().unwrap();

        assert!(!env.site_packages().join("celery").exists());
        assert!(!env.site_packages().join("celery-5.0.0.dist-info").exists());
        assert!(!env.scripts_dir().join("celery").exists());
    }

    #[test]
    fn rollback_restores_launcher_byte_identical() {
        let (_dir, env) = fixture_env();
        let dist = install_fixture_dist(&env);
        let launcher = env.scripts_dir().join("celery");
        let original = fs_err::read(&launcher).unwrap();

        let mut removal = RemovePaths::from_dist(&dist, &env).unwrap();
        removal.remove().unwrap();
        assert!(!launcher.exists());
        removal.rollback().unwrap();

        assert_eq!(fs_err::read(&launcher).unwrap(), original);
        assert!(env.site_packages().join("celery/app/__init__.py").exists());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let (_dir, env) = fixture_env();
        let dist = install_fixture_dist(&env);

        {
            let mut removal = RemovePaths::from_dist(&dist, &env).unwrap();
            removal.remove().unwrap();
            assert!(!env.site_packages().join("celery/__init__.py").exists());
            // Dropped here without commit or rollback.
        }
        assert!(env.site_packages().join("celery/__init__.py").exists());
    }

    #[test]
    fn pth_entries_are_spliced_and_restored() {
        let (_dir, env) = fixture_env();
        let pth = env.site_packages().join(PTH_REGISTRY);
        fs_err::write(&pth, "/src/one\n/src/two\n/src/three\n").unwrap();

        let mut removal = RemovePaths::from_paths(BTreeSet::new(), &env);
        removal.add_pth_entry("/src/two");
        removal.remove().unwrap();
        assert_eq!(
            fs_err::read_to_string(&pth).unwrap(),
            "/src/one\n/src/three\n"
        );
        removal.rollback().unwrap();
        assert_eq!(
            fs_err::read_to_string(&pth).unwrap(),
            "/src/one\n/src/two\n/src/three\n"
        );
    }

    #[test]
    fn compress_substitutes_whole_directories() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg");
        fs_err::create_dir_all(package.join("sub")).unwrap();
        fs_err::write(package.join("a.py"), "").unwrap();
        fs_err::write(package.join("sub/b.py"), "").unwrap();
        fs_err::write(dir.path().join("keep.py"), "").unwrap();

        let paths: BTreeSet<PathBuf> =
            [package.join("a.py"), package.join("sub/b.py")].into();
        let compressed = compress_for_rename(&paths);
        assert_eq!(compressed, BTreeSet::from([package.clone()]));

        // With one file kept, the directory cannot be substituted.
        let partial: BTreeSet<PathBuf> = [package.join("sub/b.py")].into();
        let compressed = compress_for_rename(&partial);
        assert_eq!(compressed, BTreeSet::from([package.join("sub")]));
    }

    #[test]
    fn pyc_shadows_are_collected() {
        let (_dir, env) = fixture_env();
        let site_packages = env.site_packages();
        fs_err::create_dir_all(site_packages.join("demo/__pycache__")).unwrap();
        fs_err::write(site_packages.join("demo/mod.py"), "").unwrap();
        fs_err::write(
            site_packages.join("demo/__pycache__/mod.cpython-311.pyc"),
            "",
        )
        .unwrap();

        let mut removal =
            RemovePaths::from_paths([site_packages.join("demo/mod.py")].into(), &env);
        removal.remove().unwrap();
        removal.commit().unwrap();
        assert!(!site_packages.join("demo/mod.py").exists());
        assert!(!site_packages
            .join("demo/__pycache__/mod.cpython-311.pyc")
            .exists());
    }
}
