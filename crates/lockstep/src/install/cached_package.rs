use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use rattler_digest::Sha256;

use crate::types::{Record, RecordEntry, WheelFilename};
use crate::utils::{atomic_replace, retry_interrupted};

use super::{InstallError, InstalledWheel};

/// Files storing cache bookkeeping; never part of the package itself.
const CACHE_FILES: &[&str] = &[".lock", ".checksum", ".referrers"];

/// How a cached package is materialized into a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLinkMode {
    /// Symlink every file into the project's lib directory.
    Symlink,
    /// Drop a single `.pth` file naming the cache directory.
    Pth,
}

/// The shared, content-addressed package store,
/// `cache/packages/<sha[:2]>/<dist>-<ver>-<tag>/`.
///
/// Entries are shared across projects and processes; a `.lock` file inside
/// each entry serializes install/uninstall, and `.referrers` lists the
/// dist-info directories currently linking to the entry.
#[derive(Debug, Clone)]
pub struct CachedPackageStore {
    root: PathBuf,
}

impl CachedPackageStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs_err::create_dir_all(&root)?;
        Ok(CachedPackageStore { root })
    }

    /// Returns the cache entry for a wheel, unpacking it on first use.
    pub fn get_or_create(
        &self,
        wheel_path: &Path,
        wheel_name: &WheelFilename,
    ) -> Result<CachedPackage, InstallError> {
        let bytes = fs_err::read(wheel_path)?;
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(&bytes);
        let checksum = format!("sha256:{}", data_encoding::HEXLOWER.encode(digest.as_slice()));
        let hex = &checksum["sha256:".len()..];

        let entry_dir = self.root.join(&hex[..2]).join(wheel_name.cache_key());
        fs_err::create_dir_all(&entry_dir)?;
        let package = CachedPackage::new(entry_dir);
        let _lock = package.lock()?;

        if package.checksum().as_deref() == Some(&checksum) {
            tracing::debug!("reusing cached package {}", package.path().display());
            return Ok(package);
        }

        // First use (or a stale/partial entry): unpack the wheel flat into
        // the entry directory.
        let file = fs_err::File::open(wheel_path)?;
        let mut archive = zip::ZipArchive::new(file.into_parts().0)
            .map_err(|e| InstallError::Zip(wheel_path.display().to_string(), e))?;
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| InstallError::Zip(format!("<entry {index}>"), e))?;
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                continue;
            };
            let destination = package.path().join(relative);
            if entry.is_dir() {
                fs_err::create_dir_all(&destination)?;
                continue;
            }
            if let Some(parent) = destination.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| InstallError::IoAt(destination.display().to_string(), e))?;
            atomic_replace(&destination, &content)?;
        }
        atomic_replace(&package.path().join(".checksum"), checksum.as_bytes())?;
        Ok(package)
    }

    /// Iterates over every entry in the store.
    pub fn packages(&self) -> std::io::Result<Vec<CachedPackage>> {
        let mut result = Vec::new();
        for shard in fs_err::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs_err::read_dir(&shard.path())? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    result.push(CachedPackage::new(entry.path()));
                }
            }
        }
        Ok(result)
    }

    /// Removes every entry that no project links to anymore; the
    /// `cache clear packages` operation. Returns the removed paths.
    pub fn clear_unreferenced(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for package in self.packages()? {
            let _lock = package.lock()?;
            if package.referrers().is_empty() {
                let path = package.path().to_path_buf();
                package.cleanup()?;
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

/// One entry in the [`CachedPackageStore`].
#[derive(Debug, Clone)]
pub struct CachedPackage {
    path: PathBuf,
}

impl CachedPackage {
    /// Wraps an existing entry directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CachedPackage { path: path.into() }
    }

    /// The entry directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the entry's file lock for the duration of an install or
    /// uninstall. Multiple processes may race here, hence a file lock and
    /// not an in-process mutex.
    pub fn lock(&self) -> std::io::Result<std::fs::File> {
        let lock = fs_err::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.path.join(".lock"))?
            .into_parts()
            .0;
        retry_interrupted(|| lock.lock_exclusive())?;
        Ok(lock)
    }

    /// The recorded wheel checksum, if the entry is complete.
    pub fn checksum(&self) -> Option<String> {
        fs_err::read_to_string(self.path.join(".checksum"))
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// The `.dist-info` directory inside the entry.
    pub fn dist_info(&self) -> Result<PathBuf, InstallError> {
        for entry in fs_err::read_dir(&self.path)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .ends_with(".dist-info")
            {
                return Ok(entry.path());
            }
        }
        Err(InstallError::InvalidWheelMetadata(format!(
            "cached package {} has no dist-info",
            self.path.display()
        )))
    }

    /// The projects currently linking to this entry. Entries whose paths no
    /// longer exist are pruned on read.
    pub fn referrers(&self) -> BTreeSet<String> {
        fs_err::read_to_string(self.path.join(".referrers"))
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && Path::new(line).exists())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a project dist-info as a referrer.
    pub fn add_referrer(&self, referrer: &Path) -> std::io::Result<()> {
        let mut referrers = self.referrers();
        referrers.insert(referrer.display().to_string());
        self.write_referrers(&referrers)
    }

    /// Unregisters a project dist-info.
    pub fn remove_referrer(&self, referrer: &Path) -> std::io::Result<()> {
        let mut referrers = self.referrers();
        referrers.remove(&referrer.display().to_string());
        self.write_referrers(&referrers)
    }

    fn write_referrers(&self, referrers: &BTreeSet<String>) -> std::io::Result<()> {
        let mut content = referrers.iter().cloned().collect::<Vec<_>>().join("\n");
        content.push('\n');
        atomic_replace(&self.path.join(".referrers"), content.as_bytes())
    }

    /// Deletes the entry directory.
    pub fn cleanup(self) -> std::io::Result<()> {
        tracing::info!("removing cached package {}", self.path.display());
        fs_err::remove_dir_all(&self.path)
    }

    /// Materializes the cached package into a project's site-packages.
    ///
    /// The project gets a real copy of the dist-info (plus a `REFER_TO` file
    /// pointing back here), while the package files arrive as symlinks or as
    /// a single `.pth` naming this directory. The rewritten RECORD covers
    /// exactly what landed in the project, so a later uninstall collects it
    /// all.
    pub fn link_into(
        &self,
        site_packages: &Path,
        mode: CacheLinkMode,
        installer: Option<&str>,
    ) -> Result<InstalledWheel, InstallError> {
        let _lock = self.lock()?;
        let source_dist_info = self.dist_info()?;
        let dist_info_name = source_dist_info
            .file_name()
            .expect("dist-info paths have a final component")
            .to_string_lossy()
            .into_owned();
        let target_dist_info = site_packages.join(&dist_info_name);
        fs_err::create_dir_all(&target_dist_info)?;

        let mut records: Vec<RecordEntry> = Vec::new();

        // Real copies of the metadata files.
        for entry in fs_err::read_dir(&source_dist_info)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == "RECORD" {
                continue;
            }
            let content = fs_err::read(entry.path())?;
            atomic_replace(&target_dist_info.join(&file_name), &content)?;
            records.push(RecordEntry {
                path: format!("{dist_info_name}/{file_name}"),
                hash: None,
                size: Some(content.len() as u64),
            });
        }

        match mode {
            CacheLinkMode::Symlink => {
                for relative in self.package_files()? {
                    let target = self.path.join(&relative);
                    let destination = site_packages.join(&relative);
                    if let Some(parent) = destination.parent() {
                        fs_err::create_dir_all(parent)?;
                    }
                    if destination.symlink_metadata().is_ok() {
                        fs_err::remove_file(&destination)?;
                    }
                    make_symlink(&target, &destination)?;
                    records.push(RecordEntry {
                        path: relative.display().to_string().replace('\\', "/"),
                        hash: None,
                        size: None,
                    });
                }
            }
            CacheLinkMode::Pth => {
                let pth_name = format!(
                    "{}-cached.pth",
                    dist_info_name.trim_end_matches(".dist-info")
                );
                let content = format!("{}\n", self.path.display());
                atomic_replace(&site_packages.join(&pth_name), content.as_bytes())?;
                records.push(RecordEntry {
                    path: pth_name,
                    hash: None,
                    size: Some(content.len() as u64),
                });
            }
        }

        if let Some(installer) = installer {
            let content = format!("{}\n", installer.trim());
            atomic_replace(&target_dist_info.join("INSTALLER"), content.as_bytes())?;
            records.push(RecordEntry {
                path: format!("{dist_info_name}/INSTALLER"),
                hash: None,
                size: Some(content.len() as u64),
            });
        }

        // The pointer back to this entry, used by uninstall to decrement the
        // referrer count.
        let refer_to = format!("{}\n", self.path.display());
        atomic_replace(&target_dist_info.join("REFER_TO"), refer_to.as_bytes())?;
        records.push(RecordEntry {
            path: format!("{dist_info_name}/REFER_TO"),
            hash: None,
            size: Some(refer_to.len() as u64),
        });

        records.push(RecordEntry {
            path: format!("{dist_info_name}/RECORD"),
            hash: None,
            size: None,
        });
        let record = Record::from_iter(records);
        record.write_to_path(&target_dist_info.join("RECORD"))?;

        self.add_referrer(&target_dist_info)?;

        Ok(InstalledWheel {
            dist_info: target_dist_info,
            record,
        })
    }

    /// The package's files, relative to the entry directory, excluding the
    /// bookkeeping files and the dist-info.
    fn package_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack = vec![self.path.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs_err::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if dir == self.path
                    && (CACHE_FILES.contains(&name.as_str()) || name.ends_with(".dist-info"))
                {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    stack.push(entry.path());
                } else {
                    let relative = entry
                        .path()
                        .strip_prefix(&self.path)
                        .expect("walked paths stay under the entry root")
                        .to_path_buf();
                    files.push(relative);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, destination: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, destination)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, destination: &Path) -> std::io::Result<()> {
    // Symlinks need privileges on windows; fall back to a copy.
    fs_err::copy(target, destination).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::tests::make_test_wheel;

    fn wheel_name(name: &str, version: &str) -> WheelFilename {
        format!("{name}-{version}-py3-none-any.whl").parse().unwrap()
    }

    #[test]
    fn cache_entry_created_once_and_reused() {
        let scratch = tempfile::tempdir().unwrap();
        let wheel = make_test_wheel(scratch.path(), "future_fstrings", "1.2.0", None);
        let store = CachedPackageStore::new(scratch.path().join("packages")).unwrap();

        let name = wheel_name("future_fstrings", "1.2.0");
        let first = store.get_or_create(&wheel, &name).unwrap();
        assert!(first.path().join("future_fstrings/__init__.py").is_file());
        assert!(first.checksum().is_some());

        let second = store.get_or_create(&wheel, &name).unwrap();
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn symlink_install_and_referrer_lifecycle() {
        let scratch = tempfile::tempdir().unwrap();
        let wheel = make_test_wheel(scratch.path(), "demo", "1.0", None);
        let store = CachedPackageStore::new(scratch.path().join("packages")).unwrap();
        let package = store
            .get_or_create(&wheel, &wheel_name("demo", "1.0"))
            .unwrap();

        let site_packages = scratch.path().join("venv/lib/site-packages");
        fs_err::create_dir_all(&site_packages).unwrap();
        let installed = package
            .link_into(&site_packages, CacheLinkMode::Symlink, Some("lockstep"))
            .unwrap();

        // The module file in the project is a link into the cache.
        let module = site_packages.join("demo/__init__.py");
        assert!(module.symlink_metadata().unwrap().file_type().is_symlink());
        // The dist-info is real and points back at the cache.
        let refer_to =
            fs_err::read_to_string(installed.dist_info.join("REFER_TO")).unwrap();
        assert_eq!(refer_to.trim(), package.path().display().to_string());
        assert_eq!(package.referrers().len(), 1);

        // Dropping the referrer makes the entry collectable.
        package.remove_referrer(&installed.dist_info).unwrap();
        assert!(package.referrers().is_empty());
        let removed = store.clear_unreferenced().unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!removed[0].exists());
    }

    #[test]
    fn pth_install_writes_a_single_pointer() {
        let scratch = tempfile::tempdir().unwrap();
        let wheel = make_test_wheel(scratch.path(), "demo", "1.0", None);
        let store = CachedPackageStore::new(scratch.path().join("packages")).unwrap();
        let package = store
            .get_or_create(&wheel, &wheel_name("demo", "1.0"))
            .unwrap();

        let site_packages = scratch.path().join("venv/lib/site-packages");
        fs_err::create_dir_all(&site_packages).unwrap();
        package
            .link_into(&site_packages, CacheLinkMode::Pth, None)
            .unwrap();

        let pth = site_packages.join("demo-1.0-cached.pth");
        let content = fs_err::read_to_string(&pth).unwrap();
        assert_eq!(content.trim(), package.path().display().to_string());
        assert!(!site_packages.join("demo/__init__.py").exists());
    }

    #[test]
    fn referrers_prune_dead_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let entry = scratch.path().join("aa/demo-1.0-py3-none-any");
        fs_err::create_dir_all(&entry).unwrap();
        let package = CachedPackage::new(&entry);

        let live = scratch.path().join("live.dist-info");
        fs_err::create_dir_all(&live).unwrap();
        package.add_referrer(&live).unwrap();
        package
            .add_referrer(Path::new("/nonexistent/gone.dist-info"))
            .unwrap();

        // Only the live referrer survives the read-side pruning.
        assert_eq!(package.referrers().len(), 1);
    }
}
