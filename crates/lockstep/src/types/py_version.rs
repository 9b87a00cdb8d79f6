use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use miette::Diagnostic;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

/// A single part of a [`PyVersion`]: either a number or the `*` wildcard.
///
/// Numbers are signed so the `MIN` sentinel can sort below every released
/// version; a wildcard orders like `-1` which puts `3.7.*` just below `3.7.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionBit {
    /// A numeric release part.
    Num(i64),
    /// The `*` wildcard, matching any value of this part and everything after.
    Wildcard,
}

impl VersionBit {
    fn ord_key(self) -> i64 {
        match self {
            VersionBit::Num(n) => n,
            VersionBit::Wildcard => -1,
        }
    }
}

impl Display for VersionBit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionBit::Num(n) => write!(f, "{n}"),
            VersionBit::Wildcard => write!(f, "*"),
        }
    }
}

/// A loose, release-only python version that admits a trailing `*` wildcard.
///
/// This type exists purely for the python-requires algebra in
/// [`PySpecSet`](super::PySpecSet): at most three parts are kept and
/// pre/post/dev segments are rejected. It is *not* a general PEP 440 version,
/// that is what [`pep440_rs::Version`] is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PyVersion(SmallVec<[VersionBit; 3]>);

/// Error produced when parsing a [`PyVersion`] from a string.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid python version '{0}': only numeric release parts and a trailing '*' are supported")]
pub struct ParsePyVersionError(pub String);

impl PyVersion {
    /// The sentinel below every real version.
    pub const MIN: PyVersion = PyVersion(SmallVec::from_const([
        VersionBit::Num(-1),
        VersionBit::Num(-1),
        VersionBit::Num(-1),
    ]));

    /// The sentinel above every real version.
    pub const MAX: PyVersion = PyVersion(SmallVec::from_const([
        VersionBit::Num(99),
        VersionBit::Num(99),
        VersionBit::Num(99),
    ]));

    /// Builds a version from numeric release parts, keeping at most three.
    pub fn from_release(parts: &[u64]) -> Self {
        PyVersion(
            parts
                .iter()
                .take(3)
                .map(|&p| VersionBit::Num(p as i64))
                .collect(),
        )
    }

    /// Builds a version from raw bits.
    pub fn from_bits(bits: impl IntoIterator<Item = VersionBit>) -> Self {
        PyVersion(bits.into_iter().take(3).collect())
    }

    /// Number of parts present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parts. Only constructible through `truncate(0)`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The part at `idx`, if present.
    pub fn bit(&self, idx: usize) -> Option<VersionBit> {
        self.0.get(idx).copied()
    }

    /// Returns a copy limited to the first `len` parts.
    pub fn truncate(&self, len: usize) -> PyVersion {
        PyVersion(self.0.iter().copied().take(len).collect())
    }

    /// Pads the version to three parts with `fill`.
    pub fn complete(&self, fill: VersionBit) -> PyVersion {
        let mut bits = self.0.clone();
        while bits.len() < 3 {
            bits.push(fill);
        }
        PyVersion(bits)
    }

    /// Replaces the last part.
    pub fn with_last(&self, bit: VersionBit) -> PyVersion {
        let mut bits = self.0.clone();
        if let Some(last) = bits.last_mut() {
            *last = bit;
        }
        PyVersion(bits)
    }

    /// Increments the part at `idx` (negative indexes count from the back),
    /// drops everything after it and pads with zeroes.
    ///
    /// `bump(-1)` turns `3.8.1` into `3.8.2`, `bump(-2)` turns `3.8.*` into
    /// `3.9.0` and `bump(0)` turns `3.8.1` into `4.0.0`.
    pub fn bump(&self, idx: isize) -> PyVersion {
        let len = self.0.len() as isize;
        let idx = if idx < 0 { len + idx } else { idx };
        debug_assert!((0..len).contains(&idx), "bump index out of range");
        let idx = idx as usize;

        let value = self.0[idx].ord_key();
        let mut bits: SmallVec<[VersionBit; 3]> = self.0.iter().copied().take(idx).collect();
        bits.push(VersionBit::Num(value + 1));
        PyVersion(bits).complete(VersionBit::Num(0))
    }

    /// Whether this version starts with all the parts of `prefix`.
    pub fn startswith(&self, prefix: &PyVersion) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Whether the last part is the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.0.last(), Some(VersionBit::Wildcard))
    }

    /// Whether this is a python 2 version.
    pub fn is_py2(&self) -> bool {
        matches!(self.0.first(), Some(VersionBit::Num(2)))
    }
}

impl PartialOrd for PyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.0.iter().map(|b| b.ord_key());
        let rhs = other.0.iter().map(|b| b.ord_key());
        lhs.cmp(rhs)
    }
}

impl FromStr for PyVersion {
    type Err = ParsePyVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParsePyVersionError(s.into()));
        }
        let mut bits: SmallVec<[VersionBit; 3]> = smallvec![];
        for part in s.split('.').take(3) {
            if part == "*" {
                bits.push(VersionBit::Wildcard);
                // Anything after a wildcard is meaningless.
                break;
            }
            let num: i64 = part
                .parse()
                .map_err(|_| ParsePyVersionError(s.to_string()))?;
            bits.push(VersionBit::Num(num));
        }
        Ok(PyVersion(bits))
    }
}

impl From<&pep440_rs::Version> for PyVersion {
    fn from(value: &pep440_rs::Version) -> Self {
        PyVersion(
            value
                .release
                .iter()
                .take(3)
                .map(|&p| VersionBit::Num(p as i64))
                .collect(),
        )
    }
}

impl Display for PyVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for bit in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{bit}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(s: &str) -> PyVersion {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("3", "3")]
    #[case("3.8", "3.8")]
    #[case("3.8.1", "3.8.1")]
    #[case("3.8.*", "3.8.*")]
    fn parse_roundtrip(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(v(input).to_string(), expected);
    }

    #[test]
    fn rejects_prereleases() {
        assert!("3.8.0a1".parse::<PyVersion>().is_err());
        assert!("".parse::<PyVersion>().is_err());
    }

    #[test]
    fn wildcard_orders_below_zero() {
        assert!(v("3.7.*") < v("3.7.0"));
        assert!(v("3.7.*") > v("3.6.99"));
        assert!(PyVersion::MIN < v("0.0.0"));
        assert!(PyVersion::MAX > v("99.99.98"));
    }

    #[test]
    fn bump_semantics() {
        assert_eq!(v("3.8.1").bump(-1), v("3.8.2"));
        assert_eq!(v("3.8.*").bump(-2), v("3.9.0"));
        assert_eq!(v("3.8.1").bump(0), v("4.0.0"));
        assert_eq!(v("3.8").bump(-1), v("3.9.0"));
    }

    #[test]
    fn complete_and_truncate() {
        assert_eq!(v("3.8").complete(VersionBit::Num(0)), v("3.8.0"));
        assert_eq!(v("3.8").complete(VersionBit::Wildcard), v("3.8.*"));
        assert_eq!(v("3.8.1").truncate(2), v("3.8"));
    }

    #[test]
    fn startswith() {
        assert!(v("3.8.1").startswith(&v("3.8")));
        assert!(v("3.8.1").startswith(&v("3")));
        assert!(!v("3.8.1").startswith(&v("3.9")));
        assert!(!v("3").startswith(&v("3.8")));
    }
}
