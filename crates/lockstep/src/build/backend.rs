use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::types::Requirement;

/// The python driver handed to the interpreter: imports the named PEP 517
/// backend, runs its `build_wheel` hook and prints the produced wheel path.
const HOOK_DRIVER: &str = r#"
import importlib
import os
import sys

source_dir, output_dir, backend_spec = sys.argv[1:4]
os.chdir(source_dir)
sys.path.insert(0, source_dir)

module_name, _, attribute = backend_spec.partition(":")
backend = importlib.import_module(module_name)
for part in filter(None, attribute.split(".")):
    backend = getattr(backend, part)

wheel_name = backend.build_wheel(output_dir)
print(os.path.join(output_dir, wheel_name))
"#;

/// Error raised by the build hook collaborator.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum BuildBackendError {
    #[error("io error while running the build hook: {0}")]
    Io(#[from] std::io::Error),

    #[error("no python interpreter found to run build hooks")]
    PythonNotFound,

    #[error("build hook exited with {status:?}:\n{stderr}")]
    HookFailed {
        status: Option<i32>,
        stderr: String,
    },

    #[error("build hook reported no wheel")]
    NoWheelProduced,
}

/// Runs PEP 517 build hooks.
///
/// Implementations are subprocess-shaped collaborators: the engine passes a
/// source directory, an output directory, the backend name and the build
/// requirements, and receives the path of the wheel that was produced.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Builds a wheel from `source_dir` into `output_dir` using the named
    /// backend.
    async fn build_wheel(
        &self,
        source_dir: &Path,
        output_dir: &Path,
        backend: &str,
        requires: &[Requirement],
    ) -> Result<PathBuf, BuildBackendError>;
}

/// The default hook runner: invokes a python interpreter in an isolated
/// subprocess. The interpreter's environment must already be able to import
/// the requested backend; provisioning build requirements into that
/// environment is the caller's concern.
#[derive(Debug, Clone)]
pub struct Pep517Backend {
    python: PathBuf,
}

impl Pep517Backend {
    /// Uses the given interpreter.
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Pep517Backend {
            python: python.into(),
        }
    }

    /// Locates an interpreter on `PATH`.
    pub fn from_path() -> Result<Self, BuildBackendError> {
        let python = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| BuildBackendError::PythonNotFound)?;
        Ok(Pep517Backend { python })
    }
}

#[async_trait]
impl BuildBackend for Pep517Backend {
    async fn build_wheel(
        &self,
        source_dir: &Path,
        output_dir: &Path,
        backend: &str,
        requires: &[Requirement],
    ) -> Result<PathBuf, BuildBackendError> {
        tracing::debug!(
            backend,
            requires = %requires.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "running build_wheel hook in {}",
            source_dir.display()
        );

        let output = tokio::process::Command::new(&self.python)
            .arg("-c")
            .arg(HOOK_DRIVER)
            .arg(source_dir)
            .arg(output_dir)
            .arg(backend)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BuildBackendError::HookFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let wheel = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or(BuildBackendError::NoWheelProduced)?;
        Ok(PathBuf::from(wheel))
    }
}
