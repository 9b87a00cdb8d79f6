use std::io::Write;
use std::path::Path;

use url::Url;

/// Keep retrying an IO operation while it fails with
/// [`std::io::ErrorKind::Interrupted`].
pub(crate) fn retry_interrupted<F, T>(mut f: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    loop {
        match f() {
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

/// Normalizes an index url the way pip does: the path always ends in a slash
/// so joining a project name never clobbers the last segment.
pub fn normalize_index_url(mut url: Url) -> Url {
    let path = url.path();
    if !path.ends_with('/') {
        url.set_path(&format!("{path}/"));
    }
    url
}

/// Replaces the file at `path` atomically: the content goes to a sibling
/// temporary file which is fsynced and then renamed over the target, so a
/// reader never observes a torn file.
pub(crate) fn atomic_replace(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(directory)?;
    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    temp.write_all(content)?;
    temp.as_file().sync_data()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Hex-encodes a digest with its algorithm prefix, `sha256:<hex>`.
pub(crate) fn format_sha256(digest: &[u8]) -> String {
    format!("sha256:{}", data_encoding::HEXLOWER.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_urls_end_with_a_slash() {
        let url = Url::parse("https://pypi.org/simple").unwrap();
        assert_eq!(normalize_index_url(url).as_str(), "https://pypi.org/simple/");

        let url = Url::parse("https://pypi.org/simple/").unwrap();
        assert_eq!(normalize_index_url(url).as_str(), "https://pypi.org/simple/");
    }

    #[test]
    fn atomic_replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.txt");
        atomic_replace(&target, b"one").unwrap();
        atomic_replace(&target, b"two").unwrap();
        assert_eq!(fs_err::read(&target).unwrap(), b"two");
    }
}
