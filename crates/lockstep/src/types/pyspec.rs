use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use miette::Diagnostic;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use super::py_version::{ParsePyVersionError, PyVersion, VersionBit};

/// A specifier set restricted to python-language versions.
///
/// Internally a `(lower, upper, excludes)` triple: the set contains `v` iff
/// `lower <= v < upper` and `v` matches no exclude. Excludes are kept sorted
/// and may be wildcards (`3.10.*`). Unlike a general PEP 440 specifier set,
/// intersection, union and subset tests are decidable in closed form, which is
/// what the resolver needs to merge `requires-python` constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PySpecSet {
    lower: PyVersion,
    upper: PyVersion,
    excludes: Vec<PyVersion>,
}

/// Error produced when parsing a [`PySpecSet`] from a specifier string.
#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParsePySpecError {
    #[error("invalid python version specifier clause '{0}'")]
    InvalidClause(String),

    #[error("unsupported operator '{op}' for wildcard version in '{clause}'")]
    UnsupportedWildcard { op: String, clause: String },

    #[error(transparent)]
    InvalidVersion(#[from] ParsePyVersionError),
}

/// The highest patch release that was ever published for a `major.minor`
/// series, and the highest minor for a major series. Used to enumerate the
/// gap between two disjoint ranges compactly (`union`).
fn max_release(prefix: &PyVersion) -> i64 {
    let major = match prefix.bit(0) {
        Some(VersionBit::Num(n)) => n,
        _ => return 99,
    };
    let Some(minor) = prefix.bit(1) else {
        return match major {
            2 => 7,
            3 => 13,
            _ => 99,
        };
    };
    let VersionBit::Num(minor) = minor else {
        return 99;
    };
    match (major, minor) {
        (2, 0) => 1,
        (2, 1) => 3,
        (2, 2) => 3,
        (2, 3) => 7,
        (2, 4) => 6,
        (2, 5) => 6,
        (2, 6) => 9,
        (2, 7) => 18,
        (3, 0) => 1,
        (3, 1) => 5,
        (3, 2) => 6,
        (3, 3) => 7,
        (3, 4) => 10,
        (3, 5) => 10,
        (3, 6) => 15,
        (3, 7) => 17,
        (3, 8) => 19,
        (3, 9) => 18,
        (3, 10) => 14,
        (3, 11) => 9,
        (3, 12) => 4,
        (3, 13) => 1,
        _ => 24,
    }
}

/// One past the newest known major series. Upper bounds at or above this are
/// treated as unbounded when deciding subset/superset relations, so that
/// `>=3.6,<4.0` counts as a superset of `>=3.7`.
fn max_major_version() -> PyVersion {
    PyVersion::from_release(&[4, 0, 0])
}

/// A single parsed clause, normalized so wildcards only survive on `!=`.
fn normalize_clause(op: &str, version: PyVersion, clause: &str) -> Result<(ClauseOp, PyVersion), ParsePySpecError> {
    let wildcard = version.is_wildcard();
    let unsupported = || ParsePySpecError::UnsupportedWildcard {
        op: op.to_string(),
        clause: clause.to_string(),
    };
    let (op, version) = if wildcard {
        match op {
            // ==3.8.* behaves exactly like ~=3.8.0
            "==" => (ClauseOp::Compatible, version.with_last(VersionBit::Num(0))),
            "!=" => (ClauseOp::NotEqual, version),
            // Legacy forms: >X.Y.* and >=X.Y.* mean >=X.Y.0, <X.Y.* and
            // <=X.Y.* mean <X.Y.0.
            ">" | ">=" => (ClauseOp::GreaterEqual, version.with_last(VersionBit::Num(0))),
            "<" | "<=" => (ClauseOp::Less, version.with_last(VersionBit::Num(0))),
            _ => return Err(unsupported()),
        }
    } else {
        let op = match op {
            "==" | "===" => ClauseOp::Equal,
            "!=" => ClauseOp::NotEqual,
            ">" => ClauseOp::Greater,
            ">=" => ClauseOp::GreaterEqual,
            "<" => ClauseOp::Less,
            "<=" => ClauseOp::LessEqual,
            "~=" => {
                if version.len() < 2 {
                    return Err(ParsePySpecError::InvalidClause(clause.to_string()));
                }
                ClauseOp::Compatible
            }
            _ => return Err(ParsePySpecError::InvalidClause(clause.to_string())),
        };
        (op, version)
    };

    // Pad to three parts except where the shorter form is significant.
    let version = match op {
        ClauseOp::Compatible => version,
        ClauseOp::NotEqual if version.is_wildcard() => version,
        _ => version.complete(VersionBit::Num(0)),
    };
    Ok((op, version))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Compatible,
}

impl Default for PySpecSet {
    fn default() -> Self {
        PySpecSet::allow_all()
    }
}

impl PySpecSet {
    /// The set that accepts every python version.
    pub fn allow_all() -> Self {
        PySpecSet {
            lower: PyVersion::MIN,
            upper: PyVersion::MAX,
            excludes: Vec::new(),
        }
    }

    /// The empty set.
    pub fn impossible() -> Self {
        PySpecSet {
            lower: PyVersion::MAX,
            upper: PyVersion::MIN,
            excludes: Vec::new(),
        }
    }

    /// True when no version satisfies this set.
    pub fn is_impossible(&self) -> bool {
        if self.lower == PyVersion::MIN || self.upper == PyVersion::MAX {
            return false;
        }
        self.lower >= self.upper
    }

    /// True when every version satisfies this set.
    pub fn is_allow_all(&self) -> bool {
        !self.is_impossible()
            && self.lower == PyVersion::MIN
            && self.upper == PyVersion::MAX
            && self.excludes.is_empty()
    }

    /// Whether `version` is a member of the set. Versions shorter than three
    /// parts are zero-padded first, mirroring how `3.8` means `3.8.0` in a
    /// python-requires comparison.
    pub fn contains(&self, version: &PyVersion) -> bool {
        if self.is_impossible() {
            return false;
        }
        let version = version.complete(VersionBit::Num(0));
        if version < self.lower || version >= self.upper {
            return false;
        }
        !self.excludes.iter().any(|exclude| {
            if exclude.is_wildcard() {
                version.startswith(&exclude.truncate(exclude.len() - 1))
            } else {
                version == *exclude
            }
        })
    }

    /// Whether a full PEP 440 interpreter version is a member; only the
    /// release segment participates.
    pub fn contains_version(&self, version: &pep440_rs::Version) -> bool {
        self.contains(&PyVersion::from(version))
    }

    /// The greatest lower bound of the two sets.
    pub fn intersect(&self, other: &PySpecSet) -> PySpecSet {
        if self.is_impossible() || other.is_impossible() {
            return PySpecSet::impossible();
        }
        if self.is_allow_all() {
            return other.clone();
        }
        if other.is_allow_all() {
            return self.clone();
        }
        let lower = self.lower.clone().max(other.lower.clone());
        let upper = self.upper.clone().min(other.upper.clone());
        let excludes = self
            .excludes
            .iter()
            .chain(other.excludes.iter())
            .cloned()
            .collect::<Vec<_>>();
        PySpecSet::rearranged(lower, upper, excludes)
    }

    /// The least upper bound of the two sets. When the ranges are disjoint
    /// the gap between them is encoded as wildcard excludes, using the known
    /// maximum releases per series to keep the encoding compact.
    pub fn union(&self, other: &PySpecSet) -> PySpecSet {
        if self.is_impossible() {
            return other.clone();
        }
        if other.is_impossible() {
            return self.clone();
        }
        if self.is_allow_all() || other.is_allow_all() {
            return PySpecSet::allow_all();
        }
        let (left, right) = if self.lower <= other.lower {
            (self, other)
        } else {
            (other, self)
        };
        let left_excludes: BTreeSet<_> = left.excludes.iter().cloned().collect();
        let right_excludes: BTreeSet<_> = right.excludes.iter().cloned().collect();
        let mut excludes: Vec<PyVersion> =
            left_excludes.intersection(&right_excludes).cloned().collect();
        let lower = left.lower.clone();
        let upper = left.upper.clone().max(right.upper.clone());
        if right.lower > left.upper {
            excludes.extend(populate_version_range(&left.upper, &right.lower));
        }
        PySpecSet::rearranged(lower, upper, excludes)
    }

    /// Whether every member of `other` is also a member of `self`.
    pub fn is_superset(&self, other: &PySpecSet) -> bool {
        if self.is_impossible() {
            return false;
        }
        if self.is_allow_all() {
            return true;
        }
        let mut other = other.clone();
        if other.upper >= max_major_version() {
            // Narrow the other upper bound to one-past-the-newest-major so
            // that `>=3.6,<4.0` is recognised as a superset of `>=3.7`.
            other.upper = max_major_version();
        }
        let (lower, upper, excludes) = merge_bounds_and_excludes(
            other.lower.clone(),
            other.upper.clone(),
            self.excludes.clone(),
        );
        if self.lower > other.lower || self.upper < other.upper {
            return false;
        }
        let ours: BTreeSet<_> = excludes.into_iter().collect();
        let theirs: BTreeSet<_> = other.excludes.iter().cloned().collect();
        lower <= other.lower && upper >= other.upper && ours.is_subset(&theirs)
    }

    /// Whether every member of `self` is also a member of `other`.
    pub fn is_subset(&self, other: &PySpecSet) -> bool {
        if self.is_impossible() {
            return false;
        }
        let mut other = other.clone();
        if other.upper >= max_major_version() {
            // Treat an upper bound past the newest major as unbounded.
            other.upper = PyVersion::MAX;
        }
        if other.is_allow_all() {
            return true;
        }
        let (lower, upper, excludes) = merge_bounds_and_excludes(
            self.lower.clone(),
            self.upper.clone(),
            other.excludes.clone(),
        );
        if self.lower < other.lower || self.upper > other.upper {
            return false;
        }
        let ours: BTreeSet<_> = self.excludes.iter().cloned().collect();
        let theirs: BTreeSet<_> = excludes.into_iter().collect();
        lower <= self.lower && upper >= self.upper && ours.is_superset(&theirs)
    }

    /// Renders the set as a PEP 508 marker expression, or an empty string for
    /// the unconstrained set.
    pub fn as_marker_string(&self) -> String {
        if self.is_allow_all() {
            return String::new();
        }
        let mut clauses = self.clauses();
        clauses.sort_by(|a, b| a.1.cmp(&b.1));

        let mut result: Vec<String> = Vec::new();
        let mut excludes: Vec<String> = Vec::new();
        let mut full_excludes: Vec<String> = Vec::new();
        for (op, version) in clauses {
            let (key, version) = if version.split('.').count() < 3 {
                ("python_version", version)
            } else if let Some(stripped) = version.strip_suffix(".*") {
                ("python_version", stripped.to_string())
            } else {
                ("python_full_version", version)
            };
            if op == "!=" {
                if key == "python_version" {
                    excludes.push(version);
                } else {
                    full_excludes.push(version);
                }
            } else {
                result.push(format!("{key}{op}'{version}'"));
            }
        }
        if !excludes.is_empty() {
            excludes.sort();
            result.push(format!("python_version not in '{}'", excludes.join(", ")));
        }
        if !full_excludes.is_empty() {
            full_excludes.sort();
            result.push(format!(
                "python_full_version not in '{}'",
                full_excludes.join(", ")
            ));
        }
        result.join(" and ")
    }

    /// Whether the set admits any python 2 interpreter.
    pub fn supports_py2(&self) -> bool {
        self.lower.is_py2()
    }

    /// The canonical clause list `(operator, version-string)` making up the
    /// string form.
    fn clauses(&self) -> Vec<(&'static str, String)> {
        let mut clauses = Vec::new();
        if self.lower != PyVersion::MIN {
            clauses.push((">=", trim_trailing_zero(&self.lower).to_string()));
        }
        if self.upper != PyVersion::MAX {
            clauses.push(("<", trim_trailing_zero(&self.upper).to_string()));
        }
        for exclude in &self.excludes {
            clauses.push(("!=", exclude.to_string()));
        }
        clauses
    }

    fn rearranged(lower: PyVersion, upper: PyVersion, excludes: Vec<PyVersion>) -> PySpecSet {
        let (lower, upper, excludes) = merge_bounds_and_excludes(lower, upper, excludes);
        PySpecSet {
            lower,
            upper,
            excludes,
        }
    }
}

/// Drops a trailing `.0` part, once: `3.8.0` renders as `3.8`.
fn trim_trailing_zero(version: &PyVersion) -> PyVersion {
    if version.len() > 1 && version.bit(version.len() - 1) == Some(VersionBit::Num(0)) {
        version.truncate(version.len() - 1)
    } else {
        version.clone()
    }
}

/// Re-normalizes a bounds/excludes triple:
///
/// - excludes subsumed by an exclude wildcard or outside the range are
///   dropped,
/// - an exclude touching the lower bound bumps the bound upwards,
/// - an exclude wildcard covering the upper bound (or adjacent to it) narrows
///   the bound down to the start of the excluded series.
fn merge_bounds_and_excludes(
    mut lower: PyVersion,
    mut upper: PyVersion,
    excludes: Vec<PyVersion>,
) -> (PyVersion, PyVersion, Vec<PyVersion>) {
    let mut sorted: Vec<PyVersion> = excludes;
    sorted.sort();
    sorted.dedup();

    // Drop plain excludes that some wildcard exclude already covers.
    let wildcard_prefixes: Vec<PyVersion> = sorted
        .iter()
        .filter(|v| v.is_wildcard())
        .map(|v| v.truncate(v.len() - 1))
        .collect();
    sorted.retain(|v| {
        v.is_wildcard() || !wildcard_prefixes.iter().any(|prefix| v.startswith(prefix))
    });

    if lower == PyVersion::MIN && upper == PyVersion::MAX {
        // A non-constraint, nothing further to fold.
        return (lower, upper, sorted);
    }

    fn remove(list: &mut Vec<PyVersion>, version: &PyVersion) {
        if let Some(pos) = list.iter().position(|v| v == version) {
            list.remove(pos);
        }
    }

    // Walk from low to high: excludes below the range are useless, an
    // exclude sitting exactly on the lower bound moves the bound up.
    for version in sorted.clone() {
        if version >= upper {
            sorted.clear();
            break;
        }
        if version.is_wildcard() {
            let valid_len = version.len() - 1;
            let valid = version.truncate(valid_len);
            if valid < lower.truncate(valid_len) {
                remove(&mut sorted, &version);
            } else if lower.startswith(&valid) {
                // e.g. >=3.7.3,!=3.7.* collapses to >=3.8
                lower = version.bump(-2);
                remove(&mut sorted, &version);
            } else {
                break;
            }
        } else if version < lower {
            remove(&mut sorted, &version);
        } else if version == lower {
            lower = version.bump(-1);
            remove(&mut sorted, &version);
        } else {
            break;
        }
    }

    // Walk from high to low: a wildcard covering or adjacent to the upper
    // bound narrows the bound to the start of the excluded series.
    for version in sorted.clone().iter().rev() {
        if *version >= upper {
            remove(&mut sorted, version);
            continue;
        }
        if !version.is_wildcard() {
            break;
        }
        let valid = version.truncate(version.len() - 1);
        if upper.startswith(&valid) || version.bump(-2) == upper {
            // <3.7.3,!=3.7.* collapses to <3.7, and <3.7,!=3.6.* to <3.6
            upper = valid.complete(VersionBit::Num(0));
            remove(&mut sorted, version);
        } else {
            break;
        }
    }

    (lower, upper, sorted)
}

/// Enumerates `[lower, upper)` as a set of excluded versions, preferring
/// whole-series wildcards (`3.*`, `3.7.*`) where the range allows.
fn populate_version_range(lower: &PyVersion, upper: &PyVersion) -> Vec<PyVersion> {
    debug_assert!(lower < upper);
    let mut result = Vec::new();
    let mut prev = lower.clone();
    while &prev < upper {
        let minor_is_zero = prev.bit(1) == Some(VersionBit::Num(0));
        let micro_is_zero = prev.bit(2) == Some(VersionBit::Num(0));
        if minor_is_zero && micro_is_zero {
            // X.0.0: try to exclude the entire major series at once.
            let next_major = prev.bump(0);
            if &next_major <= upper {
                let major = prev.bit(0).unwrap_or(VersionBit::Num(0));
                result.push(PyVersion::from_bits([major, VersionBit::Wildcard]));
                prev = next_major;
                continue;
            }
        }
        if micro_is_zero {
            // X.Y.0: try to exclude the whole X.Y series.
            let next_minor = prev.bump(1);
            if &next_minor <= upper {
                result.push(prev.truncate(2).complete(VersionBit::Wildcard));
                prev = advance_series(next_minor);
                continue;
            }
            while &prev < upper {
                result.push(prev.clone());
                prev = prev.bump(-1);
            }
            break;
        }
        // Mid-series start: enumerate the series' remaining patch releases.
        let next_minor = prev.bump(1);
        if &next_minor <= upper {
            let series = prev.truncate(2);
            let start = match prev.bit(2) {
                Some(VersionBit::Num(n)) => n,
                _ => 0,
            };
            for patch in start..=max_release(&series) {
                result.push(series.complete(VersionBit::Num(patch)));
            }
            prev = advance_series(next_minor);
        } else {
            while &prev < upper {
                result.push(prev.clone());
                prev = prev.bump(-1);
            }
            break;
        }
    }
    result
}

/// Steps over the 2.8..3.0 hole: after the last python 2 minor the next
/// series is 3.0.
fn advance_series(next: PyVersion) -> PyVersion {
    if next.is_py2() {
        if let Some(VersionBit::Num(minor)) = next.bit(1) {
            if minor > max_release(&next.truncate(1)) {
                return next.bump(0);
            }
        }
    }
    next
}

impl FromStr for PySpecSet {
    type Err = ParsePySpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(PySpecSet::allow_all());
        }

        let mut lower = PyVersion::MIN;
        let mut upper = PyVersion::MAX;
        let mut excludes: Vec<PyVersion> = Vec::new();

        for raw_clause in s.split(',') {
            let clause = raw_clause.trim();
            if clause.is_empty() {
                return Err(ParsePySpecError::InvalidClause(raw_clause.to_string()));
            }
            let op_len = clause
                .find(|c: char| !matches!(c, '=' | '!' | '<' | '>' | '~'))
                .ok_or_else(|| ParsePySpecError::InvalidClause(clause.to_string()))?;
            let (op, version_str) = clause.split_at(op_len);
            if op.is_empty() {
                return Err(ParsePySpecError::InvalidClause(clause.to_string()));
            }
            let version: PyVersion = version_str.trim().parse()?;
            let (op, version) = normalize_clause(op, version, clause)?;

            match op {
                ClauseOp::Equal => {
                    lower = version.clone();
                    upper = version.bump(-1);
                    break;
                }
                ClauseOp::NotEqual => excludes.push(version),
                ClauseOp::Greater => lower = lower.max(version.bump(-1)),
                ClauseOp::GreaterEqual => lower = lower.max(version),
                ClauseOp::Less => upper = upper.min(version),
                ClauseOp::LessEqual => upper = upper.min(version.bump(-1)),
                ClauseOp::Compatible => {
                    let new_lower = version.complete(VersionBit::Num(0));
                    let new_upper = version.bump(-2);
                    if new_upper < upper {
                        upper = new_upper;
                    }
                    if new_lower > lower {
                        lower = new_lower;
                    }
                }
            }
        }

        Ok(PySpecSet::rearranged(lower, upper, excludes))
    }
}

impl Display for PySpecSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_impossible() {
            return write!(f, "impossible");
        }
        if self.is_allow_all() {
            return Ok(());
        }
        let clauses: Vec<String> = self
            .clauses()
            .into_iter()
            .map(|(op, version)| format!("{op}{version}"))
            .collect();
        write!(f, "{}", clauses.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spec(s: &str) -> PySpecSet {
        s.parse().unwrap()
    }

    #[rstest]
    #[case(">=3.6", ">=3.6")]
    #[case(">=3.6.0", ">=3.6")]
    #[case("<3.8", "<3.8")]
    #[case("<=3.8", "<3.8.1")]
    #[case(">3.8", ">=3.8.1")]
    #[case("~=3.7", ">=3.7,<4.0")]
    #[case("~=3.7.2", ">=3.7.2,<3.8")]
    #[case("==3.8.*", ">=3.8,<3.9")]
    #[case("==3.8", ">=3.8,<3.8.1")]
    #[case(">=3.6,<4.0", ">=3.6,<4.0")]
    #[case(">=3.6,!=3.8.*", ">=3.6,!=3.8.*")]
    #[case(">=3.7.3,!=3.7.*", ">=3.8")]
    #[case("<3.7.3,!=3.7.*", "<3.7")]
    #[case("<3.7,!=3.6.*", "<3.6")]
    #[case(">=2.7,!=3.0.*,!=3.1.*", ">=2.7,!=3.0.*,!=3.1.*")]
    #[case("*", "")]
    #[case("", "")]
    fn parse_and_canonicalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(spec(input).to_string(), expected);
    }

    #[test]
    fn excludes_subsumed_by_wildcards() {
        assert_eq!(
            spec(">=3.6,!=3.8.2,!=3.8.*").to_string(),
            ">=3.6,!=3.8.*"
        );
    }

    #[test]
    fn impossible_and_allow_all() {
        let impossible = spec(">=3.8").intersect(&spec("<3.7"));
        assert!(impossible.is_impossible());
        assert_eq!(impossible.to_string(), "impossible");
        assert!(!impossible.contains(&"3.7.5".parse().unwrap()));

        assert!(spec("*").is_allow_all());
        assert!(PySpecSet::allow_all().contains(&"2.6.0".parse().unwrap()));
    }

    #[rstest]
    #[case(">=3.6", "3.6.0", true)]
    #[case(">=3.6", "3.5.9", false)]
    #[case(">=3.6,<3.10", "3.10.0", false)]
    #[case(">=3.6,!=3.8.*", "3.8.5", false)]
    #[case(">=3.6,!=3.8.*", "3.9.1", true)]
    #[case(">=3.6,!=3.7.2", "3.7.2", false)]
    #[case(">=3.6,!=3.7.2", "3.7.3", true)]
    fn membership(#[case] set: &str, #[case] version: &str, #[case] expected: bool) {
        assert_eq!(spec(set).contains(&version.parse().unwrap()), expected);
    }

    #[test]
    fn intersection_laws() {
        let a = spec(">=3.6");
        let b = spec("<3.9");
        let both = a.intersect(&b);
        assert_eq!(both.to_string(), ">=3.6,<3.9");
        for candidate in ["3.5.0", "3.6.0", "3.8.9", "3.9.0", "3.11.1"] {
            let version: PyVersion = candidate.parse().unwrap();
            assert_eq!(
                both.contains(&version),
                a.contains(&version) && b.contains(&version),
                "intersection law failed for {candidate}"
            );
        }
    }

    #[test]
    fn union_laws() {
        let a = spec(">=3.6,<3.8");
        let b = spec(">=3.7,<3.10");
        let either = a.union(&b);
        for candidate in ["3.5.0", "3.6.2", "3.7.0", "3.9.9", "3.10.0"] {
            let version: PyVersion = candidate.parse().unwrap();
            assert_eq!(
                either.contains(&version),
                a.contains(&version) || b.contains(&version),
                "union law failed for {candidate}"
            );
        }
    }

    #[test]
    fn union_of_disjoint_ranges_encodes_gap_as_wildcards() {
        let merged = spec(">=3.6,<3.10").union(&spec(">=3.12"));
        assert_eq!(merged.to_string(), ">=3.6,!=3.10.*,!=3.11.*");
    }

    #[test]
    fn union_of_py2_and_py3() {
        // The gap walker steps over the 2.8..3.0 hole.
        let merged = spec(">=2.7,<2.8").union(&spec(">=3.4"));
        assert_eq!(
            merged.to_string(),
            ">=2.7,!=2.8.*,!=3.0.*,!=3.1.*,!=3.2.*,!=3.3.*"
        );
    }

    #[test]
    fn subset_and_superset() {
        assert!(spec(">=3.6").is_superset(&spec(">=3.7")));
        assert!(spec(">=3.7").is_subset(&spec(">=3.6")));
        assert!(!spec(">=3.7").is_superset(&spec(">=3.6")));

        // The upper bound <4.0 does not disqualify the superset relation.
        assert!(spec(">=3.6,<4.0").is_superset(&spec(">=3.7")));
        assert!(spec(">=3.7").is_subset(&spec(">=3.6,<4.0")));

        assert!(spec(">=3.6,!=3.8.*").is_subset(&spec(">=3.6")));
        assert!(!spec(">=3.6").is_subset(&spec(">=3.6,!=3.8.*")));
    }

    #[test]
    fn marker_rendering() {
        assert_eq!(spec("*").as_marker_string(), "");
        assert_eq!(
            spec(">=3.6,<4.0").as_marker_string(),
            "python_version>='3.6' and python_version<'4.0'"
        );
        assert_eq!(
            spec(">=3.7.2").as_marker_string(),
            "python_full_version>='3.7.2'"
        );
        assert_eq!(
            spec(">=3.6,!=3.8.*").as_marker_string(),
            "python_version>='3.6' and python_version not in '3.8'"
        );
    }

    #[test]
    fn py2_support() {
        assert!(spec(">=2.7").supports_py2());
        assert!(!spec(">=3.6").supports_py2());
    }
}
