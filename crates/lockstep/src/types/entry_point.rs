use std::collections::HashSet;
use std::str::FromStr;

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::extra::Extra;

/// A console or gui script entry point: `name = module:attr [extra1,extra2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// The name of the generated script.
    pub script_name: String,
    /// The dotted module path.
    pub module: String,
    /// The attribute inside the module to call, if any.
    pub attribute: Option<String>,
}

/// Error produced when an entry point value cannot be parsed.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid entry point '{0}'")]
pub struct ParseEntryPointError(pub String);

static ENTRY_POINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        \s*(?P<module>[\w.]+)\s*
        (:\s*(?P<attribute>[\w.]+)\s*)?
        (?P<extras>\[.*\])?\s*$",
    )
    .unwrap()
});

impl EntryPoint {
    /// Parses an entry point definition.
    ///
    /// When `active_extras` is `Some`, an entry point gated behind extras
    /// that are not all active yields `Ok(None)`; passing `None` disables
    /// the filtering entirely.
    pub fn parse(
        script_name: String,
        value: &str,
        active_extras: Option<&HashSet<Extra>>,
    ) -> Result<Option<Self>, ParseEntryPointError> {
        let captures = ENTRY_POINT_RE
            .captures(value)
            .ok_or_else(|| ParseEntryPointError(value.to_string()))?;

        if let (Some(active), Some(gate)) = (active_extras, captures.name("extras")) {
            let gate = gate.as_str().trim_start_matches('[').trim_end_matches(']');
            for extra in gate.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let extra =
                    Extra::from_str(extra).map_err(|_| ParseEntryPointError(value.to_string()))?;
                if !active.contains(&extra) {
                    return Ok(None);
                }
            }
        }

        Ok(Some(EntryPoint {
            script_name,
            module: captures["module"].to_string(),
            attribute: captures.name("attribute").map(|m| m.as_str().to_string()),
        }))
    }

    /// The python stub a launcher runs to invoke this entry point.
    pub fn launch_script(&self) -> String {
        let import = match &self.attribute {
            Some(attribute) => {
                let object = attribute.split('.').next().unwrap_or(attribute);
                format!("from {} import {object}\n", self.module)
            }
            None => format!("import {}\n", self.module),
        };
        let call = match &self.attribute {
            Some(attribute) => attribute.clone(),
            None => format!("{}.main", self.module),
        };
        format!(
            "# -*- coding: utf-8 -*-\n\
             import re\n\
             import sys\n\
             {import}\
             if __name__ == \"__main__\":\n\
             \x20   sys.argv[0] = re.sub(r\"(-script\\.pyw?|\\.exe)?$\", \"\", sys.argv[0])\n\
             \x20   sys.exit({call}())\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_module_and_attribute() {
        let ep = EntryPoint::parse("celery".into(), "celery.__main__:main", None)
            .unwrap()
            .unwrap();
        assert_eq!(ep.module, "celery.__main__");
        assert_eq!(ep.attribute.as_deref(), Some("main"));
    }

    #[test]
    fn extras_gate_entry_points() {
        let active: HashSet<Extra> = ["cli".parse().unwrap()].into();
        let kept = EntryPoint::parse("tool".into(), "tool.cli:run [cli]", Some(&active)).unwrap();
        assert!(kept.is_some());

        let dropped =
            EntryPoint::parse("tool".into(), "tool.gui:run [gui]", Some(&active)).unwrap();
        assert!(dropped.is_none());

        // Without an active set, gating is ignored.
        let unfiltered = EntryPoint::parse("tool".into(), "tool.gui:run [gui]", None).unwrap();
        assert!(unfiltered.is_some());
    }

    #[test]
    fn launch_script_references_the_attribute() {
        let ep = EntryPoint::parse("black".into(), "black:patched_main", None)
            .unwrap()
            .unwrap();
        let script = ep.launch_script();
        assert!(script.contains("from black import patched_main"));
        assert!(script.contains("sys.exit(patched_main())"));
    }
}
