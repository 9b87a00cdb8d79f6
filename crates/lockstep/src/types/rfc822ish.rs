use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

/// A parsed `METADATA`/`PKG-INFO` style document.
///
/// The format is nominally RFC 822 but in practice it is "whatever the python
/// stdlib `email.parser` accepts": header lines with continuations, then an
/// optional blank-line-separated body. Field names are case-insensitive; we
/// lowercase them on parse.
#[derive(Debug, Clone)]
pub struct Rfc822ish {
    fields: HashMap<String, Vec<String>>,
    /// The message body, used for the long description in modern metadata.
    pub body: Option<String>,
}

/// Error produced when the metadata text cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid metadata: {0}")]
pub struct ParseRfc822ishError(String);

peg::parser! {
    grammar metadata_parser() for str {
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"} / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)} / expected!("field name")

        // email.parser drops spaces and tabs right after the colon but keeps
        // any further whitespace in the value.
        rule field_separator()
            = ":" [' ' | '\t']*

        rule field_value_piece()
            = [^ '\r' | '\n']*

        rule continuation_line_ending()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        // Continuation lines keep their embedded newlines, matching
        // email.parser rather than real RFC 822 folding.
        rule field_value() -> &'input str
            = $(field_value_piece() ** continuation_line_ending())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        pub rule document() -> (Vec<(String, String)>, Option<String>)
            = f:fields() body:(trailing_body()?) line_ending()?
                { (f, body) }
    }
}

impl FromStr for Rfc822ish {
    type Err = ParseRfc822ishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (parsed_fields, body) =
            metadata_parser::document(s).map_err(|e| ParseRfc822ishError(e.to_string()))?;
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in parsed_fields {
            fields.entry(name).or_default().push(value);
        }
        Ok(Rfc822ish { fields, body })
    }
}

impl Rfc822ish {
    /// Removes and returns all values of `key`.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields.remove(&key.to_ascii_lowercase()).unwrap_or_default()
    }

    /// Removes a key that may appear at most once.
    pub fn maybe_take(&mut self, key: &str) -> Result<Option<String>, ParseRfc822ishError> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Err(ParseRfc822ishError(format!(
                "multiple values for singleton key {key}"
            ))),
        }
    }

    /// Removes a key that must appear exactly once.
    pub fn take(&mut self, key: &str) -> Result<String, ParseRfc822ishError> {
        self.maybe_take(key)?
            .ok_or_else(|| ParseRfc822ishError(format!("missing required key {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_body() {
        let text = "Metadata-Version: 2.1\nName: demo\nVersion: 1.0\nRequires-Dist: requests>=2.0\nRequires-Dist: click\n\nThe long description.\n";
        let mut parsed: Rfc822ish = text.parse().unwrap();
        assert_eq!(parsed.take("Name").unwrap(), "demo");
        assert_eq!(parsed.take_all("Requires-Dist").len(), 2);
        assert_eq!(parsed.body.as_deref(), Some("The long description.\n"));
    }

    #[test]
    fn continuation_lines_keep_newlines() {
        let text = "Summary: first line\n and a second\nName: demo\nVersion: 1.0\n";
        let mut parsed: Rfc822ish = text.parse().unwrap();
        assert_eq!(parsed.take("Summary").unwrap(), "first line\n and a second");
    }

    #[test]
    fn duplicate_singleton_is_an_error() {
        let text = "Name: a\nName: b\n";
        let mut parsed: Rfc822ish = text.parse().unwrap();
        assert!(parsed.maybe_take("Name").is_err());
    }
}
