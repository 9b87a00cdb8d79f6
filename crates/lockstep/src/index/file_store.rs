use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use rattler_digest::Sha256;

use crate::utils::retry_interrupted;

/// A content-addressed key/value store on the filesystem, shared between
/// processes.
///
/// Entries are written to a temporary file and atomically persisted, and a
/// sibling `.lock` file serializes writers, so readers always observe either
/// nothing or a complete value. Keys are relative paths; hashed keys are
/// fanned out over `<hex[:2]>/<hex>` so no directory collects millions of
/// entries.
#[derive(Debug)]
pub struct FileStore {
    base: PathBuf,
    tmp: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `base`.
    pub fn new(base: &Path) -> io::Result<Self> {
        fs_err::create_dir_all(base)?;
        let base = base.canonicalize()?;
        // The temp dir lives inside the store so persisting never crosses a
        // filesystem boundary.
        let tmp = base.join(".tmp");
        fs_err::create_dir_all(&tmp)?;
        Ok(Self { base, tmp })
    }

    /// The fanned-out relative key for a blob of key material.
    pub fn key_for_bytes(data: &[u8]) -> PathBuf {
        let digest = rattler_digest::compute_bytes_digest::<Sha256>(data);
        let hex = data_encoding::HEXLOWER.encode(digest.as_slice());
        Path::new(&hex[..2]).join(&hex[2..])
    }

    /// Opens the value for `key`, or returns `None` when it is absent.
    pub fn get(&self, key: &Path) -> Option<File> {
        let lock = self.lock_if_exists(key)?;
        lock.reader()
    }

    /// Opens the value for `key`, calling `write` to produce it first when
    /// absent.
    pub fn get_or_set<F>(&self, key: &Path, write: F) -> io::Result<File>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let lock = self.lock(key)?;
        if let Some(reader) = lock.reader() {
            // Values are immutable once written, reading without holding the
            // lock is fine.
            return Ok(reader);
        }
        let mut writer = lock.begin()?;
        write(&mut writer)?;
        writer.commit()
    }

    /// Acquires the write lock for `key`, creating parent directories.
    pub fn lock(&self, key: &Path) -> io::Result<EntryLock> {
        let path = self.base.join(key);
        let lock_file = open_lock_file(&path, true)?;
        Ok(EntryLock {
            tmp: self.tmp.clone(),
            path,
            _lock_file: lock_file,
        })
    }

    /// Acquires the lock for `key` only when the entry directory already
    /// exists; probing for absent entries must not litter the store.
    pub fn lock_if_exists(&self, key: &Path) -> Option<EntryLock> {
        let path = self.base.join(key);
        let lock_file = open_lock_file(&path, false).ok()?;
        Some(EntryLock {
            tmp: self.tmp.clone(),
            path,
            _lock_file: lock_file,
        })
    }
}

/// An exclusive hold on one store entry.
pub struct EntryLock {
    tmp: PathBuf,
    path: PathBuf,
    _lock_file: File,
}

impl EntryLock {
    /// Opens the current value, if any.
    pub fn reader(&self) -> Option<File> {
        File::open(&self.path).ok()
    }

    /// Starts writing a new value. Nothing is visible until
    /// [`EntryWriter::commit`].
    pub fn begin(&self) -> io::Result<EntryWriter> {
        Ok(EntryWriter {
            file: tempfile::NamedTempFile::new_in(&self.tmp)?,
            path: self.path.clone(),
        })
    }

    /// Removes the entry.
    pub fn remove(self) -> io::Result<()> {
        fs_err::remove_file(&self.path)
    }
}

/// An in-progress value write; buffered in a temporary file and atomically
/// moved into place on commit.
pub struct EntryWriter {
    file: tempfile::NamedTempFile,
    path: PathBuf,
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl EntryWriter {
    /// Persists the value and reopens it for reading.
    pub fn commit(self) -> io::Result<File> {
        self.file.as_file().sync_data()?;
        let mut file = self.file.persist(&self.path).map_err(|e| e.error)?;
        file.rewind()?;
        Ok(file)
    }
}

fn open_lock_file(entry_path: &Path, create: bool) -> io::Result<File> {
    let lock_path = entry_path.with_extension("lock");

    // Opened for write so another process cannot share it on windows.
    let mut options = fs_err::OpenOptions::new();
    options.write(true);
    if create {
        if let Some(parent) = lock_path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        options.create(true);
    }
    let lock = options.open(&lock_path)?.into_parts().0;

    // flock(2) does not retry on EINTR by itself.
    retry_interrupted(|| lock.lock_exclusive())?;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_set_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let key = FileStore::key_for_bytes(b"some-key");

        assert!(store.get(&key).is_none());

        let mut value = Vec::new();
        store
            .get_or_set(&key, |w| w.write_all(b"payload"))
            .unwrap()
            .read_to_end(&mut value)
            .unwrap();
        assert_eq!(value, b"payload");

        // Second access must not rewrite.
        let mut value = Vec::new();
        store
            .get_or_set(&key, |_| panic!("value was already present"))
            .unwrap()
            .read_to_end(&mut value)
            .unwrap();
        assert_eq!(value, b"payload");
    }

    #[test]
    fn keys_fan_out() {
        let key = FileStore::key_for_bytes(b"abc");
        let first = key.iter().next().unwrap().to_string_lossy().to_string();
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn probing_does_not_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.get(Path::new("aa/bbbb")).is_none());
        assert!(!dir.path().join("aa").exists());
    }
}
