use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// The sysconfig-like install scheme of an environment: where each wheel
/// file category lands, relative to the environment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    purelib: PathBuf,
    platlib: PathBuf,
    scripts: PathBuf,
    data: PathBuf,
    include: PathBuf,
    windows: bool,
}

impl InstallPaths {
    /// The scheme of a virtualenv for the given interpreter version. Windows
    /// venvs use `Lib`/`Scripts`, posix venvs `lib/pythonX.Y` and `bin`.
    pub fn for_venv(major: u64, minor: u64, windows: bool) -> Self {
        let site_packages = if windows {
            Path::new("Lib").join("site-packages")
        } else {
            Path::new("lib").join(format!("python{major}.{minor}/site-packages"))
        };
        InstallPaths {
            // In a venv purelib and platlib coincide.
            purelib: site_packages.clone(),
            platlib: site_packages,
            scripts: PathBuf::from(if windows { "Scripts" } else { "bin" }),
            // The data category unpacks relative to the environment root.
            data: PathBuf::from(""),
            include: PathBuf::from(if windows { "Include" } else { "include" }),
            windows,
        }
    }

    /// Whether this is a windows scheme.
    pub fn is_windows(&self) -> bool {
        self.windows
    }

    /// The site-packages directory (the purelib location).
    pub fn site_packages(&self) -> &Path {
        &self.purelib
    }

    /// Pure python library location.
    pub fn purelib(&self) -> &Path {
        &self.purelib
    }

    /// Platform specific library location.
    pub fn platlib(&self) -> &Path {
        &self.platlib
    }

    /// Launcher scripts location.
    pub fn scripts(&self) -> &Path {
        &self.scripts
    }

    /// The data root.
    pub fn data(&self) -> &Path {
        &self.data
    }

    /// Header files location for a distribution.
    pub fn headers(&self, distribution: &str) -> PathBuf {
        self.include.join(distribution)
    }

    /// Maps a wheel data-directory category to its install location.
    pub fn match_category(&self, category: &str, distribution: &str) -> Option<Cow<'_, Path>> {
        match category {
            "purelib" => Some(self.purelib().into()),
            "platlib" => Some(self.platlib().into()),
            "scripts" => Some(self.scripts().into()),
            "data" => Some(self.data().into()),
            "headers" => Some(Cow::Owned(self.headers(distribution))),
            _ => None,
        }
    }
}
