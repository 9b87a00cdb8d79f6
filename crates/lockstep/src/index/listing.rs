use std::str::FromStr;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::types::{ArtifactName, PySpecSet};

/// The artifacts an index lists for one project, parsed from either the
/// PEP 503 HTML page or the PEP 691 JSON document.
#[derive(Debug, Clone, Default)]
pub struct ProjectListing {
    /// The listed artifacts. Files whose names don't parse are skipped.
    pub artifacts: Vec<ArtifactListing>,
}

/// One artifact row of a project page.
#[derive(Debug, Clone)]
pub struct ArtifactListing {
    /// The parsed artifact filename.
    pub filename: ArtifactName,
    /// The absolute download url.
    pub url: Url,
    /// The hex sha256 digest advertised by the index, if any.
    pub sha256: Option<String>,
    /// The python range from `data-requires-python`, if present and sane.
    pub requires_python: Option<PySpecSet>,
    /// Yank status.
    pub yanked: Yanked,
    /// Whether a PEP 658 metadata sidecar (`<url>.metadata`) is available.
    pub metadata_available: bool,
}

/// Whether a release file was yanked, and why.
#[derive(Debug, Clone, Default)]
pub struct Yanked {
    /// True when the file was yanked.
    pub yanked: bool,
    /// The reason given, if any.
    pub reason: Option<String>,
}

/// Error raised while parsing a project page.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ListingError {
    #[error("failed to parse project page html: {0}")]
    Html(String),

    #[error("failed to parse project page json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported content type '{0}' for a project page")]
    UnsupportedContentType(String),
}

impl ProjectListing {
    /// Parses a project page based on its content type.
    pub fn parse(
        base: &Url,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Self, ListingError> {
        let mime: mime::Mime = content_type
            .unwrap_or("text/html")
            .parse()
            .map_err(|_| ListingError::UnsupportedContentType(content_type.unwrap_or("").into()))?;
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("text", "html") => Self::parse_html(base, &String::from_utf8_lossy(body)),
            // application/vnd.pypi.simple.v1+json
            ("application", _) if mime.suffix().map(|s| s.as_str()) == Some("json") => {
                Self::parse_json(body)
            }
            ("application", "json") => Self::parse_json(body),
            _ => Err(ListingError::UnsupportedContentType(mime.to_string())),
        }
    }

    /// Parses a PEP 503 simple-index HTML page.
    pub fn parse_html(base: &Url, text: &str) -> Result<Self, ListingError> {
        let dom = tl::parse(text, tl::ParserOptions::default())
            .map_err(|e| ListingError::Html(e.to_string()))?;
        let parser = dom.parser();

        let mut artifacts = Vec::new();
        for anchor in dom
            .query_selector("a")
            .into_iter()
            .flatten()
            .filter_map(|handle| handle.get(parser))
            .filter_map(|node| node.as_tag())
        {
            let attribute = |name: &str| {
                anchor
                    .attributes()
                    .get(name)
                    .flatten()
                    .map(|value| html_escape::decode_html_entities(&value.as_utf8_str()).to_string())
            };

            let Some(href) = attribute("href") else {
                continue;
            };
            let Ok(url) = base.join(&href) else {
                tracing::warn!("skipping unparsable artifact url '{href}'");
                continue;
            };

            let file_name = anchor.inner_text(parser);
            let Ok(filename) = ArtifactName::from_str(file_name.trim()) else {
                tracing::debug!("skipping unrecognized artifact '{}'", file_name.trim());
                continue;
            };

            let sha256 = url
                .fragment()
                .and_then(|fragment| fragment.strip_prefix("sha256="))
                .map(str::to_string);
            let mut url = url;
            url.set_fragment(None);

            let requires_python = attribute("data-requires-python")
                .as_deref()
                .and_then(parse_requires_python);

            let yanked = match attribute("data-yanked") {
                Some(reason) => Yanked {
                    yanked: true,
                    reason: (!reason.is_empty()).then_some(reason),
                },
                None => Yanked::default(),
            };

            // PEP 714 renamed data-dist-info-metadata to data-core-metadata;
            // accept both spellings.
            let metadata_available = attribute("data-core-metadata")
                .or_else(|| attribute("data-dist-info-metadata"))
                .map(|value| value != "false")
                .unwrap_or(false);

            artifacts.push(ArtifactListing {
                filename,
                url,
                sha256,
                requires_python,
                yanked,
                metadata_available,
            });
        }
        Ok(ProjectListing { artifacts })
    }

    /// Parses a PEP 691 JSON project document.
    pub fn parse_json(body: &[u8]) -> Result<Self, ListingError> {
        #[derive(Deserialize)]
        struct Document {
            files: Vec<FileEntry>,
        }

        #[derive(Deserialize)]
        struct FileEntry {
            filename: String,
            url: String,
            #[serde(default)]
            hashes: std::collections::HashMap<String, String>,
            #[serde(rename = "requires-python")]
            requires_python: Option<String>,
            #[serde(default)]
            yanked: YankedField,
            #[serde(rename = "core-metadata", alias = "dist-info-metadata", default)]
            core_metadata: MetadataField,
        }

        #[derive(Deserialize, Default)]
        #[serde(untagged)]
        enum YankedField {
            #[default]
            #[serde(skip)]
            No,
            Flag(bool),
            Reason(String),
        }

        #[derive(Deserialize, Default)]
        #[serde(untagged)]
        enum MetadataField {
            #[default]
            #[serde(skip)]
            Absent,
            Flag(bool),
            Hashes(std::collections::HashMap<String, String>),
        }

        let document: Document = serde_json::from_slice(body)?;
        let mut artifacts = Vec::new();
        for file in document.files {
            let Ok(filename) = ArtifactName::from_str(&file.filename) else {
                tracing::debug!("skipping unrecognized artifact '{}'", file.filename);
                continue;
            };
            let Ok(url) = Url::parse(&file.url) else {
                tracing::warn!("skipping unparsable artifact url '{}'", file.url);
                continue;
            };
            let yanked = match file.yanked {
                YankedField::No | YankedField::Flag(false) => Yanked::default(),
                YankedField::Flag(true) => Yanked {
                    yanked: true,
                    reason: None,
                },
                YankedField::Reason(reason) => Yanked {
                    yanked: true,
                    reason: Some(reason),
                },
            };
            artifacts.push(ArtifactListing {
                filename,
                url,
                sha256: file.hashes.get("sha256").cloned(),
                requires_python: file
                    .requires_python
                    .as_deref()
                    .and_then(parse_requires_python),
                yanked,
                metadata_available: !matches!(
                    file.core_metadata,
                    MetadataField::Absent | MetadataField::Flag(false)
                ),
            });
        }
        Ok(ProjectListing { artifacts })
    }
}

/// Indexes occasionally carry garbage in `data-requires-python`; a range we
/// cannot parse is treated as unconstrained rather than fatal.
fn parse_requires_python(value: &str) -> Option<PySpecSet> {
    match value.trim() {
        "" => None,
        trimmed => match trimmed.parse() {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!("ignoring unparsable requires-python '{trimmed}': {e}");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML_PAGE: &str = r#"
    <!DOCTYPE html>
    <html><body>
        <a href="/packages/demo-1.0.tar.gz#sha256=00aa">demo-1.0.tar.gz</a>
        <a href="https://files.example/demo-1.1-py3-none-any.whl#sha256=11bb"
           data-requires-python="&gt;=3.8" data-core-metadata="sha256=ccdd">demo-1.1-py3-none-any.whl</a>
        <a href="/packages/demo-0.9-py3-none-any.whl" data-yanked="broken upload">demo-0.9-py3-none-any.whl</a>
        <a href="/packages/demo-1.2.unknown">demo-1.2.unknown</a>
    </body></html>
    "#;

    #[test]
    fn parses_html_listing() {
        let base = Url::parse("https://pypi.org/simple/demo/").unwrap();
        let listing = ProjectListing::parse_html(&base, HTML_PAGE).unwrap();
        assert_eq!(listing.artifacts.len(), 3);

        let sdist = &listing.artifacts[0];
        assert_eq!(sdist.sha256.as_deref(), Some("00aa"));
        assert_eq!(
            sdist.url.as_str(),
            "https://pypi.org/packages/demo-1.0.tar.gz"
        );

        let wheel = &listing.artifacts[1];
        assert!(wheel.filename.is_wheel());
        assert_eq!(
            wheel.requires_python.as_ref().unwrap().to_string(),
            ">=3.8"
        );
        assert!(wheel.metadata_available);

        let yanked = &listing.artifacts[2];
        assert!(yanked.yanked.yanked);
        assert_eq!(yanked.yanked.reason.as_deref(), Some("broken upload"));
    }

    #[test]
    fn parses_json_listing() {
        let body = serde_json::json!({
            "files": [
                {
                    "filename": "demo-1.0-py3-none-any.whl",
                    "url": "https://files.example/demo-1.0-py3-none-any.whl",
                    "hashes": {"sha256": "aabb"},
                    "requires-python": ">=3.7",
                    "core-metadata": {"sha256": "eeff"}
                },
                {
                    "filename": "demo-0.5.tar.gz",
                    "url": "https://files.example/demo-0.5.tar.gz",
                    "yanked": "yanked for a reason"
                }
            ]
        });
        let listing = ProjectListing::parse_json(body.to_string().as_bytes()).unwrap();
        assert_eq!(listing.artifacts.len(), 2);
        assert!(listing.artifacts[0].metadata_available);
        assert_eq!(listing.artifacts[0].sha256.as_deref(), Some("aabb"));
        assert!(listing.artifacts[1].yanked.yanked);
    }

    #[test]
    fn content_type_dispatch() {
        let base = Url::parse("https://pypi.org/simple/demo/").unwrap();
        assert!(ProjectListing::parse(
            &base,
            Some("application/vnd.pypi.simple.v1+json"),
            br#"{"files": []}"#
        )
        .is_ok());
        assert!(ProjectListing::parse(&base, Some("image/png"), b"").is_err());
    }
}
