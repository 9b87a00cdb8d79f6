//! Lockstep is the engine core of a Python package manager. Given the declared
//! dependency groups of a project it resolves a consistent set of pinned
//! candidates, records the result in a content-hashed lockfile and brings a
//! target environment in lockstep with that lockfile by installing, updating
//! and removing distributions.
//!
//! The crate deliberately stops at the library boundary: argument parsing,
//! terminal rendering, pyproject TOML parsing and the PEP 517 build hook
//! internals are collaborators that consume the interfaces exposed here.

#![deny(missing_docs)]

pub mod types;

pub mod index;
pub mod resolver;

pub mod lockfile;
pub mod sync;

pub mod build;
pub mod environment;
pub mod install;

mod core;
mod utils;

pub use crate::core::{Core, CoreConfig, IndexSource, ProjectManifest};
pub use environment::{Distribution, Environment, WorkingSet};
pub use lockfile::Lockfile;
pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::MarkerEnvironment;
pub use resolver::{resolve, Resolution, ResolveError, ResolveOptions, UpdateStrategy};
pub use sync::{SyncOptions, SyncResult, Synchronizer};
pub use types::{
    Candidate, GroupName, NormalizedPackageName, PackageName, PySpecSet, Requirement,
};
pub use utils::normalize_index_url;
