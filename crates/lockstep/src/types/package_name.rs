use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// A python project name as it appears in metadata or a manifest.
///
/// Keeps the spelling it was created from next to the PEP 503 normalized form.
/// Comparison, ordering and hashing all go through the normalized form, so two
/// spellings of the same project compare equal.
#[derive(Debug, Clone, Eq, DeserializeFromStr)]
pub struct PackageName {
    source: Box<str>,
    normalized: Box<str>,
}

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    // https://packaging.python.org/specifications/core-metadata/#name
    Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
});

/// Lowercase and collapse runs of `-`, `_` and `.` into a single `-`.
///
/// See [PEP 503](https://peps.python.org/pep-0503/#normalized-names).
pub(crate) fn normalize(name: &str) -> String {
    static SEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]+").unwrap());
    SEP_RE.replace_all(name, "-").to_lowercase()
}

impl PackageName {
    /// The spelling this instance was created from.
    pub fn as_source_str(&self) -> &str {
        &self.source
    }

    /// The normalized name.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }
}

/// Error returned when a string is not a valid project name.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid package name '{0}'")]
pub struct ParsePackageNameError(pub String);

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !NAME_RE.is_match(s) {
            return Err(ParsePackageNameError(s.into()));
        }
        Ok(PackageName {
            source: s.into(),
            normalized: normalize(s).into_boxed_str(),
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Serialize for PackageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.source.serialize(serializer)
    }
}

/// A name that is guaranteed to be in PEP 503 normalized form.
///
/// This is the vertex key type used throughout the resolver, the lockfile and
/// the working set.
#[repr(transparent)]
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct NormalizedPackageName(Box<str>);

impl NormalizedPackageName {
    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<PackageName> for NormalizedPackageName {
    fn from(value: PackageName) -> Self {
        Self(value.normalized)
    }
}

impl From<NormalizedPackageName> for PackageName {
    fn from(value: NormalizedPackageName) -> Self {
        Self {
            source: value.0.clone(),
            normalized: value.0,
        }
    }
}

impl FromStr for NormalizedPackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Display for NormalizedPackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for NormalizedPackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        let a: PackageName = "Flask-SQLAlchemy".parse().unwrap();
        assert_eq!(a.as_source_str(), "Flask-SQLAlchemy");
        assert_eq!(a.as_str(), "flask-sqlalchemy");

        let b: PackageName = "flask_sqlalchemy".parse().unwrap();
        assert_eq!(a, b);

        let c: PackageName = "flask.sqlalchemy".parse().unwrap();
        assert_eq!(a, c);

        assert!("".parse::<PackageName>().is_err());
        assert!("-leading-dash".parse::<PackageName>().is_err());
        assert!("has space".parse::<PackageName>().is_err());
    }

    #[test]
    fn collapsed_separators() {
        let name: NormalizedPackageName = "foo__bar..baz".parse().unwrap();
        assert_eq!(name.as_str(), "foo-bar-baz");
    }
}
