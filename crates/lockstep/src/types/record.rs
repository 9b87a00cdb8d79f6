use std::io::Read;
use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// The `RECORD` file of an installed distribution or a wheel archive: one row
/// per installed file with an optional hash and size.
///
/// See <https://www.python.org/dev/peps/pep-0376/#record>.
#[derive(Debug, Clone, Default)]
pub struct Record {
    entries: Vec<RecordEntry>,
}

/// A single row of a `RECORD` file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordEntry {
    /// Path relative to the site-packages directory, `/`-separated.
    pub path: String,
    /// `sha256=<base64url>` digest, absent for the RECORD file itself and for
    /// generated files whose content is not stable.
    pub hash: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
}

impl Record {
    /// Reads a `RECORD` file from disk.
    pub fn from_path(path: &Path) -> csv::Result<Self> {
        Self::from_reader(fs_err::File::open(path)?)
    }

    /// Reads `RECORD` rows from a reader.
    pub fn from_reader(reader: impl Read) -> csv::Result<Self> {
        Ok(Self {
            entries: csv::ReaderBuilder::new()
                .has_headers(false)
                .escape(Some(b'"'))
                .from_reader(reader)
                .deserialize()
                .collect::<Result<Vec<RecordEntry>, csv::Error>>()?,
        })
    }

    /// Writes the rows, sorted by path, to a `RECORD` file on disk.
    pub fn write_to_path(&self, path: &Path) -> csv::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .escape(b'"')
            .from_path(path)?;
        for entry in self.entries.iter().sorted() {
            writer.serialize(entry)?;
        }
        Ok(())
    }

    /// Iterates over the rows.
    pub fn iter(&self) -> std::slice::Iter<'_, RecordEntry> {
        self.entries.iter()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the record has no rows.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the row for a path.
    pub fn find(&self, path: &str) -> Option<&RecordEntry> {
        // Paths in wheel RECORDs should be relative; tolerate a leading slash.
        self.entries
            .iter()
            .find(|entry| entry.path.trim_start_matches('/') == path)
    }
}

impl IntoIterator for Record {
    type Item = RecordEntry;
    type IntoIter = std::vec::IntoIter<RecordEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<RecordEntry> for Record {
    fn from_iter<T: IntoIterator<Item = RecordEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
