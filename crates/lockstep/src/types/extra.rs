use std::fmt::{Display, Formatter};
use std::str::FromStr;

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use super::package_name::normalize;

/// A normalized extra name, e.g. the `socks` in `requests[socks]`.
///
/// Extras follow the same normalization rules as package names.
#[repr(transparent)]
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct Extra(Box<str>);

impl Extra {
    /// Returns the normalized extra name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Error returned when a string is not a valid extra name.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid extra name '{0}'")]
pub struct ParseExtraError(pub String);

impl FromStr for Extra {
    type Err = ParseExtraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static EXTRA_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap());
        if !EXTRA_RE.is_match(s) {
            return Err(ParseExtraError(s.into()));
        }
        Ok(Extra(normalize(s).into_boxed_str()))
    }
}

impl Display for Extra {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extras_are_normalized() {
        let extra: Extra = "Socks_V2".parse().unwrap();
        assert_eq!(extra.as_str(), "socks-v2");
        assert!("".parse::<Extra>().is_err());
    }
}
